use bytes::Bytes;

use super::huffman;
use super::table::Table;

/// Encodes header lists into HPACK blocks for HEADERS and PUSH_PROMISE
/// frames, keeping its own dynamic table in sync with what the peer's
/// decoder will build.
#[derive(Debug)]
pub(crate) struct Encoder {
    table: Table,
}

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder {
            table: Table::new(super::decoder::DEFAULT_TABLE_SIZE),
        }
    }

    /// Encodes `fields` in order into a fresh header block.
    pub(crate) fn encode<'a, I>(&mut self, fields: I) -> Bytes
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let mut dst = Vec::new();
        for (name, value) in fields {
            self.encode_field(name, value, &mut dst);
        }
        dst.into()
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut Vec<u8>) {
        match self.table.find(name, value) {
            Some((index, true)) => {
                encode_int(index, 7, 0x80, dst);
            }
            Some((index, false)) => {
                // literal with incremental indexing, indexed name
                encode_int(index, 6, 0x40, dst);
                encode_string(value, dst);
                self.table
                    .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
            }
            None => {
                encode_int(0, 6, 0x40, dst);
                encode_string(name, dst);
                encode_string(value, dst);
                self.table
                    .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
            }
        }
    }
}

/// Encodes an N-bit-prefix integer with the pattern bits of the
/// representation OR'd onto the first octet.
fn encode_int(value: usize, prefix: u8, pattern: u8, dst: &mut Vec<u8>) {
    let mask = (1usize << prefix) - 1;
    if value < mask {
        dst.push(pattern | value as u8);
        return;
    }
    dst.push(pattern | mask as u8);
    let mut rest = value - mask;
    while rest >= 0x80 {
        dst.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    dst.push(rest as u8);
}

fn encode_string(raw: &[u8], dst: &mut Vec<u8>) {
    let huff_len = huffman::encoded_len(raw);
    if huff_len < raw.len() {
        encode_int(huff_len, 7, 0x80, dst);
        huffman::encode(raw, dst);
    } else {
        encode_int(raw.len(), 7, 0x00, dst);
        dst.extend_from_slice(raw);
    }
}
