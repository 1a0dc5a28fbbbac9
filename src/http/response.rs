//! Response head formatting and canned error pages.
//!
//! # Responsibilities
//! - Buffer status and headers until the first body write
//! - Decide whether the connection survives the response
//! - Format the status line, `Date`, `Server` and connection headers
//!
//! # Design Decisions
//! - The client's protocol is echoed in the status line
//! - Error pages are complete HTTP/1.0 responses that always close

use time::macros::format_description;
use time::OffsetDateTime;

use super::request::RequestHead;

/// Value of the `Server` header.
pub const SERVER_SOFTWARE: &str = concat!("hostbridge/", env!("CARGO_PKG_VERSION"));

/// Connection parameters applied when the head is formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Keep-alive was negotiated for this request.
    pub keep_alive: bool,
    /// Requests the socket may still carry after this one.
    pub remaining: u32,
    /// Advertised in `Keep-Alive: timeout=`.
    pub timeout_secs: u64,
}

/// Status and headers of a response not yet sent.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    protocol: String,
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// An empty reason picks the standard phrase for `code`.
    pub fn set_status(&mut self, code: u16, reason: &str) {
        self.status = code;
        self.reason = if reason.trim().is_empty() {
            reason_phrase(code).to_string()
        } else {
            reason.trim().to_string()
        };
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Whether the connection may stay open once this response is complete.
    pub fn allows_keep_alive(&self, requested: bool) -> bool {
        if !requested || self.status == 400 || self.status >= 500 {
            return false;
        }
        if let Some(connection) = self.header("Connection") {
            if !contains_token(connection, "keep-alive") {
                return false;
            }
        }
        self.header("Content-Length")
            .is_some_and(|len| len.trim().parse::<u64>().is_ok())
    }

    /// Serialise the head, connection headers included.
    pub fn encode(&self, policy: ConnectionPolicy) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(&format!("{} {} {}\r\n", self.protocol, self.status, self.reason));
        out.push_str(&format!("Date: {}\r\n", http_date(OffsetDateTime::now_utc())));
        out.push_str(&format!("Server: {SERVER_SOFTWARE}\r\n"));

        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Connection") || name.eq_ignore_ascii_case("Keep-Alive") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }

        if policy.keep_alive && policy.remaining > 0 {
            out.push_str(&format!(
                "Keep-Alive: timeout={}, max={}\r\nConnection: Keep-Alive\r\n",
                policy.timeout_secs, policy.remaining
            ));
        } else {
            out.push_str("Connection: close\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Keep-alive requested by the client: on by default for HTTP/1.1, toggled
/// by the `Connection` header.
pub fn client_wants_keep_alive(head: &RequestHead) -> bool {
    let mut keep_alive = head.protocol.eq_ignore_ascii_case("HTTP/1.1");
    if let Some(connection) = head.header("Connection") {
        if contains_token(connection, "keep-alive") {
            keep_alive = true;
        }
        if contains_token(connection, "close") {
            keep_alive = false;
        }
    }
    keep_alive
}

fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// RFC 1123 date as used in HTTP headers.
pub fn http_date(at: OffsetDateTime) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    at.format(&format).unwrap_or_default()
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Generic page sent when a request fails before its head went out.
pub fn server_error_page() -> &'static [u8] {
    b"HTTP/1.0 500 Server error\r\n\
Connection: close\r\n\r\n\
<html><head><title>500 Server Error</title><body><h1>Server error</h1>\r\n\
Your client sent a request that was not understood by this server.\r\n\
</body></html>\r\n"
}

pub fn bad_request_page() -> &'static [u8] {
    b"HTTP/1.0 400 Bad Request\r\n\
Connection: close\r\n\r\n\
<html><head><title>400 Bad Request</title></head>\
<body><h1>Bad Request</h1>The request was not understood\
<p></body></html>"
}

pub fn not_found_page(uri: &str) -> Vec<u8> {
    format!(
        "HTTP/1.0 404 Not Found\r\n\
Connection: close\r\n\r\n\
<html><head><title>404 Not Found</title></head>\r\n\
<body><h1>Not Found</h1>The requested URL {} was not found on this server.<p>\r\n\
</body></html>\r\n",
        escape_html(uri)
    )
    .into_bytes()
}

/// Permanent redirect to `location`, sent when a request names an
/// application root without its trailing slash.
pub fn redirect_response(protocol: &str, location: &str, policy: ConnectionPolicy) -> Vec<u8> {
    let body = format!(
        "<html><head><title>Object moved</title></head>\
<body><h2>Object moved to <a href=\"{0}\">{0}</a></h2></body></html>\r\n",
        escape_html(location)
    );
    let mut head = ResponseHead::new(protocol);
    head.set_status(301, "");
    head.add_header("Location", location);
    head.add_header("Content-Type", "text/html");
    head.add_header("Content-Length", &body.len().to_string());
    let policy = ConnectionPolicy {
        keep_alive: policy.keep_alive && head.allows_keep_alive(true),
        ..policy
    };
    let mut out = head.encode(policy);
    out.extend_from_slice(body.as_bytes());
    out
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}
