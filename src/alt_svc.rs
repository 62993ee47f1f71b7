//! `Alt-Svc` advertisement for non-HTTP/2 requests.
//!
//! An external collaborator: the host calls [`decorate`] on ordinary
//! HTTP/1.1 responses so clients learn where HTTP/2 service is offered.

use http::header::HeaderValue;
use http::HeaderMap;

use crate::config::Config;

/// One configured alternative service: ALPN token, optional host
/// constraint, port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvc {
    /// The ALPN protocol token, e.g. `h2` or `h2c`.
    pub alpn: String,
    /// Host to advertise; `None` means "same host".
    pub host: Option<String>,
    /// The advertised port.
    pub port: u16,
}

impl AltSvc {
    /// Parses an `alpn=host:port` or `alpn=:port` specifier.
    ///
    /// Follows the Alt-Svc draft with two simplifications carried over
    /// from the directive syntax: token values are not percent-encoded
    /// and not quoted.
    pub fn parse(s: &str) -> Option<AltSvc> {
        let (alpn, rest) = s.split_at(s.find('=')?);
        let rest = &rest[1..];
        let colon = rest.find(':')?;
        let host = if colon > 0 {
            Some(rest[..colon].to_string())
        } else {
            None
        };
        let port: u16 = rest[colon + 1..].parse().ok().filter(|&p| p > 0)?;
        Some(AltSvc {
            alpn: alpn.to_string(),
            host,
            port,
        })
    }
}

/// Appends an `Alt-Svc` header to `response_headers` when the config
/// advertises alternative services, the client is not already using one
/// (no `Alt-Svc-Used` request header), and the host constraint matches.
///
/// Services naming a different host are only advertised over secure
/// transports.
pub fn decorate(
    config: &Config,
    request_host: &str,
    secure: bool,
    request_headers: &HeaderMap,
    response_headers: &mut HeaderMap,
) {
    if config.alt_svcs.is_empty() || request_headers.contains_key("alt-svc-used") {
        return;
    }

    let ma = config
        .alt_svc_max_age
        .map(|ma| format!("; ma={}", ma))
        .unwrap_or_default();
    let mut value = String::new();
    for svc in &config.alt_svcs {
        let host = match svc.host.as_deref() {
            Some(h) if h.eq_ignore_ascii_case(request_host) => None,
            other => other,
        };
        if host.is_some() && !secure {
            continue;
        }
        if !value.is_empty() {
            value.push_str(", ");
        }
        value.push_str(&format!(
            "{}=\"{}:{}\"{}",
            svc.alpn,
            host.unwrap_or(""),
            svc.port,
            ma
        ));
    }
    if value.is_empty() {
        return;
    }
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            response_headers.insert("alt-svc", value);
        }
        Err(_) => {
            tracing::warn!("misconfigured alt-svc value not advertised: {:?}", value);
        }
    }
}
