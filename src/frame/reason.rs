use std::fmt;

/// An HTTP/2 error code, carried by RST_STREAM and GOAWAY frames.
///
/// The codes are defined in [Section 7] of RFC 7540.
///
/// [Section 7]: https://tools.ietf.org/html/rfc7540#section-7
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Reason(u32);

impl Reason {
    /// The associated condition is not a result of an error.
    pub const NO_ERROR: Reason = Reason(0x00);
    /// The endpoint detected an unspecific protocol error.
    pub const PROTOCOL_ERROR: Reason = Reason(0x01);
    /// The endpoint encountered an unexpected internal error.
    pub const INTERNAL_ERROR: Reason = Reason(0x02);
    /// The endpoint detected that its peer violated the flow-control
    /// protocol.
    pub const FLOW_CONTROL_ERROR: Reason = Reason(0x03);
    /// The endpoint sent a SETTINGS frame but did not receive a response
    /// in a timely manner.
    pub const SETTINGS_TIMEOUT: Reason = Reason(0x04);
    /// The endpoint received a frame after a stream was half-closed.
    pub const STREAM_CLOSED: Reason = Reason(0x05);
    /// The endpoint received a frame with an invalid size.
    pub const FRAME_SIZE_ERROR: Reason = Reason(0x06);
    /// The endpoint refused the stream prior to performing any
    /// application processing.
    pub const REFUSED_STREAM: Reason = Reason(0x07);
    /// Used by the endpoint to indicate that the stream is no longer
    /// needed.
    pub const CANCEL: Reason = Reason(0x08);
    /// The endpoint is unable to maintain the header compression context
    /// for the connection.
    pub const COMPRESSION_ERROR: Reason = Reason(0x09);
    /// The connection established in response to a CONNECT request was
    /// reset or abnormally closed.
    pub const CONNECT_ERROR: Reason = Reason(0x0a);
    /// The endpoint detected that its peer is exhibiting a behavior that
    /// might be generating excessive load.
    pub const ENHANCE_YOUR_CALM: Reason = Reason(0x0b);
    /// The underlying transport has properties that do not meet minimum
    /// security requirements.
    pub const INADEQUATE_SECURITY: Reason = Reason(0x0c);
    /// The endpoint requires that HTTP/1.1 be used instead of HTTP/2.
    pub const HTTP_1_1_REQUIRED: Reason = Reason(0x0d);

    /// Get a string description of the error code.
    pub fn description(&self) -> &str {
        match self.0 {
            0x00 => "not a result of an error",
            0x01 => "unspecific protocol error detected",
            0x02 => "unexpected internal error encountered",
            0x03 => "flow-control protocol violated",
            0x04 => "settings ACK not received in a timely manner",
            0x05 => "received frame when stream half-closed",
            0x06 => "frame with invalid size",
            0x07 => "refused stream before processing any application logic",
            0x08 => "stream no longer needed",
            0x09 => "unable to maintain the header compression context",
            0x0a => "connection established in response to a CONNECT request was reset or abnormally closed",
            0x0b => "detected excessive load generating behavior",
            0x0c => "security properties do not meet minimum requirements",
            0x0d => "endpoint requires HTTP/1.1",
            _ => "unknown reason",
        }
    }
}

impl From<u32> for Reason {
    fn from(src: u32) -> Reason {
        Reason(src)
    }
}

impl From<Reason> for u32 {
    fn from(src: Reason) -> u32 {
        src.0
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0x00 => "NO_ERROR",
            0x01 => "PROTOCOL_ERROR",
            0x02 => "INTERNAL_ERROR",
            0x03 => "FLOW_CONTROL_ERROR",
            0x04 => "SETTINGS_TIMEOUT",
            0x05 => "STREAM_CLOSED",
            0x06 => "FRAME_SIZE_ERROR",
            0x07 => "REFUSED_STREAM",
            0x08 => "CANCEL",
            0x09 => "COMPRESSION_ERROR",
            0x0a => "CONNECT_ERROR",
            0x0b => "ENHANCE_YOUR_CALM",
            0x0c => "INADEQUATE_SECURITY",
            0x0d => "HTTP_1_1_REQUIRED",
            other => return f.debug_tuple("Reason").field(&other).finish(),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
