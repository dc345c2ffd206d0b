//! Client request head parsing and rewriting.
//!
//! A forward proxy receives requests in absolute form
//! (`GET http://host:port/path HTTP/1.1`). The parser pulls the upstream
//! address out of the request line and rebuilds the head in origin form,
//! downgraded to HTTP/1.0 so the upstream closes the connection once the
//! response is sent.

use crate::connection::Target;
use crate::error::ParseError;
use bytes::{BufMut, Bytes, BytesMut};

pub const DEFAULT_HTTP_PORT: u16 = 80;

const UPSTREAM_VERSION: &[u8] = b"HTTP/1.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Protocol version the client asked for.
    pub version: String,
    /// Request head in origin form, followed by any body bytes that arrived
    /// with it.
    pub rewritten: Bytes,
}

impl ParsedRequest {
    pub fn target(&self) -> Target {
        Target {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Parse and rewrite a client request head.
///
/// Returns `ParseError::Truncated` when `buf` does not yet hold a complete
/// head; the caller should read more and try again.
pub fn parse_request(buf: &[u8]) -> Result<ParsedRequest, ParseError> {
    let mut lines = Lines::new(buf);

    let request_line = lines.next().ok_or(ParseError::Truncated)?;
    let (method, uri, version) = split_request_line(request_line.content)?;
    let (host, port, path) = split_absolute_uri(uri)?;

    let mut headers = Vec::new();
    let blank = loop {
        let line = lines.next().ok_or(ParseError::Truncated)?;
        if line.content.is_empty() {
            break line;
        }
        headers.push(line);
    };

    let mut rewritten = BytesMut::with_capacity(buf.len() + 8);
    rewritten.put_slice(method.as_bytes());
    rewritten.put_u8(b' ');
    rewritten.put_slice(path.as_bytes());
    rewritten.put_u8(b' ');
    rewritten.put_slice(UPSTREAM_VERSION);
    rewritten.put_slice(request_line.terminator);

    for header in &headers {
        match connection_header_name(header.content) {
            Some(name) => {
                rewritten.put_slice(name);
                rewritten.put_slice(b": close");
                rewritten.put_slice(header.terminator);
            }
            None => {
                rewritten.put_slice(header.content);
                rewritten.put_slice(header.terminator);
            }
        }
    }

    // Blank line, then whatever body bytes came along with the head.
    rewritten.put_slice(blank.terminator);
    rewritten.put_slice(&buf[blank.end..]);

    Ok(ParsedRequest {
        method: method.to_string(),
        host: host.to_string(),
        port,
        path,
        version: version.to_string(),
        rewritten: rewritten.freeze(),
    })
}

/// Length of the request head in `buf` (through the blank line), if complete.
pub fn head_length(buf: &[u8]) -> Option<usize> {
    let mut lines = Lines::new(buf);
    lines.next()?;
    loop {
        let line = lines.next()?;
        if line.content.is_empty() {
            return Some(line.end);
        }
    }
}

fn split_request_line(line: &[u8]) -> Result<(&str, &str, &str), ParseError> {
    let line = std::str::from_utf8(line)
        .map_err(|_| ParseError::Malformed("request line is not valid text"))?;

    let mut parts = line.split(' ');
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::Malformed("request line must be METHOD URI VERSION"));
    };

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(ParseError::Malformed("invalid method"));
    }
    if uri.is_empty() {
        return Err(ParseError::Malformed("missing request target"));
    }
    if !version.starts_with("HTTP/") {
        return Err(ParseError::Malformed("unsupported protocol version"));
    }

    Ok((method, uri, version))
}

/// Split `scheme://host[:port][path]` into host, port and origin-form path.
fn split_absolute_uri(uri: &str) -> Result<(&str, u16, String), ParseError> {
    let rest = strip_scheme(uri)
        .ok_or(ParseError::Malformed("request target must start with http:// or https://"))?;

    let host_end = rest.find(['/', ':', '?']).unwrap_or(rest.len());
    let host = &rest[..host_end];
    if host.is_empty() {
        return Err(ParseError::Malformed("missing host"));
    }

    let mut remainder = &rest[host_end..];
    let port = match remainder.strip_prefix(':') {
        Some(after_colon) => {
            let port_end = after_colon.find(['/', '?']).unwrap_or(after_colon.len());
            let digits = &after_colon[..port_end];
            remainder = &after_colon[port_end..];
            parse_port(digits)?
        }
        None => DEFAULT_HTTP_PORT,
    };

    let path = if remainder.is_empty() {
        "/".to_string()
    } else if remainder.starts_with('?') {
        format!("/{}", remainder)
    } else {
        remainder.to_string()
    };

    Ok((host, port, path))
}

fn strip_scheme(uri: &str) -> Option<&str> {
    for scheme in ["http://", "https://"] {
        if let Some(prefix) = uri.get(..scheme.len()) {
            if prefix.eq_ignore_ascii_case(scheme) {
                return Some(&uri[scheme.len()..]);
            }
        }
    }
    None
}

fn parse_port(digits: &str) -> Result<u16, ParseError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::Malformed("invalid port"));
    }
    match digits.parse::<u16>() {
        Ok(0) | Err(_) => Err(ParseError::Malformed("invalid port")),
        Ok(port) => Ok(port),
    }
}

/// If `line` is `Connection: keep-alive`, the header name as the client
/// spelled it.
fn connection_header_name(line: &[u8]) -> Option<&[u8]> {
    let colon = line.iter().position(|&b| b == b':')?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);
    if name.eq_ignore_ascii_case(b"connection") && value.trim_ascii().eq_ignore_ascii_case(b"keep-alive") {
        Some(name)
    } else {
        None
    }
}

struct Line<'a> {
    /// Line without its terminator.
    content: &'a [u8],
    /// `\r\n` or `\n`.
    terminator: &'a [u8],
    /// Offset just past the terminator.
    end: usize,
}

/// Iterator over complete lines; a trailing partial line is never yielded.
struct Lines<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Line<'a>> {
        let rest = self.buf.get(self.pos..)?;
        let newline = rest.iter().position(|&b| b == b'\n')?;
        let start = self.pos;
        let end = start + newline + 1;

        let with_cr = newline > 0 && rest[newline - 1] == b'\r';
        let content_end = if with_cr { start + newline - 1 } else { start + newline };

        self.pos = end;
        Some(Line {
            content: &self.buf[start..content_end],
            terminator: &self.buf[content_end..end],
            end,
        })
    }
}
