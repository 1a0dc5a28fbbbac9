//! Request head parsing.
//!
//! # Responsibilities
//! - Read the request line and header block from the client socket
//! - Split the query string, percent-decode and sanitise the path
//! - Leave any bytes read past the head (body, pipelined requests) in the
//!   connection buffer
//!
//! # Design Decisions
//! - Bytes are decoded as Latin-1, so any byte sequence yields a string
//! - A request line with only verb and path is HTTP/1.0 with no headers

use std::time::Duration;

use bytes::BytesMut;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest accepted request or header line, terminator excluded.
pub const MAX_LINE: usize = 8192;

/// Most header lines accepted in one request.
pub const MAX_HEADERS: usize = 128;

/// Blank lines tolerated before the request line.
const MAX_LEADING_BLANK_LINES: usize = 16;

#[derive(Debug, Error)]
pub enum HeadError {
    /// The peer closed the connection before sending anything.
    #[error("connection closed before a request arrived")]
    Closed,

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("request line or header longer than {MAX_LINE} bytes")]
    LineTooLong,

    #[error("timed out reading request head")]
    TimedOut,

    #[error("I/O error reading request head: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed request line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub verb: String,
    /// Decoded and sanitised path.
    pub path: String,
    /// Path as sent by the client, query excluded.
    pub raw_path: String,
    pub query_string: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup; the last occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Host header without its port.
    pub fn host(&self) -> Option<String> {
        self.header("Host").map(|h| split_host_port(h, 80).0)
    }

    /// Declared body length, when present and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.trim().parse().ok()
    }

    /// Path plus query, as it should be echoed back to the client.
    pub fn uri(&self) -> String {
        if self.query_string.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_string)
        }
    }
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
pub fn split_host_port(value: &str, default_port: u16) -> (String, u16) {
    let value = value.trim();
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        match rest.split_once(']') {
            Some((addr, tail)) => (addr, tail.strip_prefix(':')),
            None => (value, None),
        }
    } else {
        match value.rsplit_once(':') {
            // More than one colon without brackets is a bare IPv6 address.
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (value, None),
        }
    };
    let port = port.and_then(|p| p.parse().ok()).unwrap_or(default_port);
    (host.to_lowercase(), port)
}

/// Read and parse a request head.
///
/// `buffer` holds bytes already read from the socket and keeps whatever
/// follows the head.
pub async fn read_request_head<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    io_timeout: Duration,
) -> Result<RequestHead, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut reader = LineReader {
        stream,
        buffer,
        io_timeout,
    };

    let mut blank_lines = 0;
    let request_line = loop {
        let line = match reader.next_line().await? {
            Some(line) => line,
            None if blank_lines == 0 => return Err(HeadError::Closed),
            None => return Err(HeadError::Malformed("connection closed before request line")),
        };
        let line = line.trim();
        if !line.is_empty() {
            break line.to_string();
        }
        blank_lines += 1;
        if blank_lines > MAX_LEADING_BLANK_LINES {
            return Err(HeadError::Malformed("too many blank lines"));
        }
    };

    let mut head = parse_request_line(&request_line)?;
    if head.protocol.is_empty() {
        head.protocol = "HTTP/1.0".to_string();
        return Ok(head);
    }

    loop {
        let line = reader
            .next_line()
            .await?
            .ok_or(HeadError::Malformed("connection closed inside headers"))?;
        if line.is_empty() {
            break;
        }
        if head.headers.len() >= MAX_HEADERS {
            return Err(HeadError::Malformed("too many headers"));
        }
        head.headers.push(parse_header_line(&line)?);
    }
    Ok(head)
}

/// Parse `VERB path [protocol]`. An empty protocol means it was absent.
pub fn parse_request_line(line: &str) -> Result<RequestHead, HeadError> {
    let parts: Vec<&str> = line.split(' ').collect();
    let (verb, target, protocol) = match parts.as_slice() {
        [verb, target] => (*verb, *target, ""),
        [verb, target, protocol] => (*verb, *target, *protocol),
        _ => return Err(HeadError::Malformed("request line needs 2 or 3 fields")),
    };
    if verb.is_empty() || target.is_empty() {
        return Err(HeadError::Malformed("empty verb or path"));
    }

    let (raw_path, query_string) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };

    let decoded = percent_decode_str(raw_path).decode_utf8_lossy();
    let mut path = safe_path(&decoded);
    if let Some(rest) = path.strip_prefix("/~/") {
        path = format!("/{rest}");
    }

    Ok(RequestHead {
        verb: verb.to_string(),
        path,
        raw_path: raw_path.to_string(),
        query_string: query_string.to_string(),
        protocol: protocol.to_string(),
        headers: Vec::new(),
    })
}

fn parse_header_line(line: &str) -> Result<(String, String), HeadError> {
    let (name, value) = line
        .split_once(':')
        .ok_or(HeadError::Malformed("header line without colon"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(HeadError::Malformed("empty header name"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Normalise a decoded path: backslashes become slashes, empty and `.`
/// segments vanish, `..` pops a segment without escaping the root, and a
/// trailing slash survives.
pub fn safe_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let trailing = path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }
    let mut result = String::with_capacity(path.len() + 1);
    for segment in segments {
        result.push('/');
        result.push_str(segment);
    }
    if trailing {
        result.push('/');
    }
    result
}

/// Bytes escaped in a query string echoed into a header. `%` passes through
/// so escapes the client already made are kept.
const QUERY: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'<').add(b'>').add(b'`');

/// Bytes escaped in a path echoed into a header.
const PATH: &AsciiSet = &QUERY.add(b'?').add(b'{').add(b'}');

/// `Location` value for a redirect to `prefix`, carrying the client's query.
pub fn redirect_location(prefix: &str, query_string: &str) -> String {
    let mut location = utf8_percent_encode(&safe_path(prefix), PATH).to_string();
    if !query_string.is_empty() {
        location.push('?');
        location.extend(utf8_percent_encode(query_string, QUERY));
    }
    location
}

struct LineReader<'a, S> {
    stream: &'a mut S,
    buffer: &'a mut BytesMut,
    io_timeout: Duration,
}

impl<S: AsyncRead + Unpin> LineReader<'_, S> {
    /// Next line without its terminator; `None` at EOF with nothing buffered.
    async fn next_line(&mut self) -> Result<Option<String>, HeadError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buffer[scanned..].iter().position(|b| *b == b'\n') {
                let end = scanned + pos;
                if end > MAX_LINE + 1 {
                    return Err(HeadError::LineTooLong);
                }
                let raw = self.buffer.split_to(end + 1);
                let line = &raw[..end];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                return Ok(Some(latin1(line)));
            }
            scanned = self.buffer.len();
            if scanned > MAX_LINE + 1 {
                return Err(HeadError::LineTooLong);
            }

            let read = tokio::time::timeout(self.io_timeout, self.stream.read_buf(self.buffer))
                .await
                .map_err(|_| HeadError::TimedOut)??;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                // A final line without terminator.
                let raw = self.buffer.split();
                let line = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
                return Ok(Some(latin1(line)));
            }
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}
