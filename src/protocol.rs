//! HTTP/1.x request parsing.
//!
//! A request must arrive in one read: there is no accumulation across reads, so a parse that
//! runs out of bytes reports `Incomplete` and the request is dropped.

/// Result of attempting to parse a request from a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Request line, headers and body are all present; see the context for the decoded parts.
    Complete,
    /// Headers or body are cut short.
    Incomplete,
    /// Not an HTTP request.
    Error(&'static str),
}

/// Per-worker parse state, reused for every request.
#[derive(Debug, Default)]
pub struct ParserContext {
    method: String,
    url: String,
    body: Vec<u8>,
}

impl ParserContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous request. Keeps allocations.
    pub fn reset(&mut self) {
        self.method.clear();
        self.url.clear();
        self.body.clear();
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target as sent, e.g. `/index.html` or `/regex?html=x`.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse `buf` into `ctx`. `ctx` only holds meaningful values after `Complete`.
pub fn parse(ctx: &mut ParserContext, buf: &[u8]) -> ParseStatus {
    let Some(line_end) = find(buf, CRLF) else {
        return ParseStatus::Error("request line not terminated");
    };
    let Ok(line) = std::str::from_utf8(&buf[..line_end]) else {
        return ParseStatus::Error("request line is not utf-8");
    };

    let mut parts = line.split(' ');
    let (Some(method), Some(url), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return ParseStatus::Error("request line needs exactly three tokens");
    };
    if !version.contains("HTTP") {
        return ParseStatus::Error("missing HTTP version");
    }
    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return ParseStatus::Error("bad method");
    }
    if !url.starts_with('/') || url.bytes().any(|b| b.is_ascii_control()) {
        return ParseStatus::Error("bad request target");
    }

    // The request line's CRLF doubles as the first half of the blank line when there are no
    // headers.
    let Some(headers_end) = find(&buf[line_end..], HEADER_END).map(|i| i + line_end) else {
        return ParseStatus::Incomplete;
    };

    let mut content_length = 0usize;
    let headers = buf.get(line_end + CRLF.len()..headers_end).unwrap_or(&[]);
    for raw in headers.split(|&b| b == b'\n').filter(|h| !h.is_empty()) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let Some(colon) = raw.iter().position(|&b| b == b':') else {
            return ParseStatus::Error("header without colon");
        };
        let name = &raw[..colon];
        if name.is_empty() {
            return ParseStatus::Error("empty header name");
        }
        if name.eq_ignore_ascii_case(b"content-length") {
            let value = std::str::from_utf8(&raw[colon + 1..]).map(str::trim);
            match value.ok().and_then(|v| v.parse::<usize>().ok()) {
                Some(n) => content_length = n,
                None => return ParseStatus::Error("bad content-length"),
            }
        }
    }

    let body_start = headers_end + HEADER_END.len();
    let available = buf.len() - body_start;
    if available < content_length {
        return ParseStatus::Incomplete;
    }

    ctx.method.push_str(method);
    ctx.url.push_str(url);
    ctx.body
        .extend_from_slice(&buf[body_start..body_start + content_length]);
    ParseStatus::Complete
}

/// Decode `%XX` escapes. `None` on a truncated escape or if the result is not utf-8.
pub fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
