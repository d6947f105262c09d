//! HTTP/1.x request heads: parsing and upstream target resolution.
//!
//! Only the head is parsed. The bytes themselves are never rewritten; the
//! router forwards them to the upstream exactly as the client sent them.

use tokio::io::AsyncRead;

use super::peek::PeekableStream;
use crate::error::{ParseError, SessionError};

/// Header slots parsed without allocating. Larger heads spill to the heap;
/// the head size limit bounds them.
pub const INLINE_HEADERS: usize = 64;

/// Default upper bound on the size of a request head.
pub const DEFAULT_MAX_REQUEST_HEAD: usize = 64 * 1024;

/// Default port for CONNECT targets without one.
pub const CONNECT_DEFAULT_PORT: u16 = 443;

/// Default port for plain requests without one.
pub const HTTP_DEFAULT_PORT: u16 = 80;

/// Parsed request line and the headers the router needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent: origin-form, absolute-form or authority-form.
    pub target: String,
    pub host_header: Option<String>,
    /// Length of the head in bytes, including the terminating blank line.
    pub head_len: usize,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `host:port` of the upstream this request asks for.
    ///
    /// CONNECT uses the authority-form target (port 443 when absent). Other
    /// methods use the absolute-form authority when present, otherwise the
    /// `Host` header (port 80 when absent).
    pub fn upstream_addr(&self) -> Result<String, ParseError> {
        if self.is_connect() {
            return with_default_port(&self.target, CONNECT_DEFAULT_PORT);
        }

        let authority = absolute_form_authority(&self.target)
            .or(self.host_header.as_deref())
            .map(str::trim)
            .filter(|authority| !authority.is_empty())
            .ok_or(ParseError::MissingHost)?;

        with_default_port(authority, HTTP_DEFAULT_PORT)
    }
}

/// Parse a complete request head from `buf`.
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, ParseError> {
    let mut inline = [httparse::EMPTY_HEADER; INLINE_HEADERS];
    let mut spilled = Vec::new();
    // Each header takes at least one line, so there is always a free slot.
    let lines = buf.iter().filter(|b| **b == b'\n').count() + 1;
    let headers = if lines <= INLINE_HEADERS {
        &mut inline[..]
    } else {
        spilled.resize(lines, httparse::EMPTY_HEADER);
        &mut spilled[..]
    };
    let mut request = httparse::Request::new(headers);

    let head_len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ParseError::Malformed(e.to_string())),
    };

    let method = request
        .method
        .ok_or_else(|| ParseError::Malformed("missing method".to_string()))?;
    let target = request
        .path
        .ok_or_else(|| ParseError::Malformed("missing request target".to_string()))?;

    let host_header = request
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("host"))
        .map(|header| String::from_utf8_lossy(header.value).into_owned());

    Ok(Some(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        host_header,
        head_len,
    }))
}

/// Buffer and parse a request head without consuming it.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut PeekableStream<S>,
    max_head: usize,
) -> Result<RequestHead, SessionError> {
    loop {
        if let Some(head) = parse_request_head(stream.buffered())? {
            return Ok(head);
        }
        if stream.buffered().len() >= max_head {
            return Err(ParseError::HeadTooLarge(max_head).into());
        }
        if stream.fill().await? == 0 {
            return Err(ParseError::Incomplete.into());
        }
    }
}

/// Authority of an absolute-form target (`http://host:port/path`).
fn absolute_form_authority(target: &str) -> Option<&str> {
    let (scheme, rest) = target.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c)) {
        return None;
    }

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    // Drop userinfo.
    Some(authority.rsplit_once('@').map_or(authority, |(_, host)| host))
}

/// Append `default_port` unless `authority` already carries a port.
fn with_default_port(authority: &str, default_port: u16) -> Result<String, ParseError> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(ParseError::MissingHost);
    }

    if let Some(rest) = authority.strip_prefix('[') {
        // IPv6 literal: "[::1]" or "[::1]:8080".
        let (_, after) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::Malformed(format!("unterminated IPv6 literal: {authority}")))?;
        return match after {
            "" => Ok(format!("{authority}:{default_port}")),
            port if port.starts_with(':') && valid_port(&port[1..]) => Ok(authority.to_string()),
            _ => Err(ParseError::Malformed(format!("invalid authority: {authority}"))),
        };
    }

    match authority.rsplit_once(':') {
        None => Ok(format!("{authority}:{default_port}")),
        Some((host, port)) if !host.is_empty() && !host.contains(':') && valid_port(port) => {
            Ok(authority.to_string())
        }
        // Bare IPv6 without brackets.
        Some(_) if authority.parse::<std::net::Ipv6Addr>().is_ok() => {
            Ok(format!("[{authority}]:{default_port}"))
        }
        Some(_) => Err(ParseError::Malformed(format!("invalid authority: {authority}"))),
    }
}

fn valid_port(port: &str) -> bool {
    !port.is_empty() && port.parse::<u16>().is_ok()
}
