//! Response serialization: status line, `Content-Length`, `Content-Type`, body.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    NotImplemented,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::NotImplemented => 501,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::NotImplemented => "Not Implemented",
        }
    }
}

pub const TEXT_HTML: &str = "text/html";

/// Fixed reply to a request the parser rejects.
pub const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nContent-Type: text/html\r\n\r\n";

pub fn header(status: StatusCode, body_len: usize, mime: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {}\r\n\r\n",
        status.code(),
        status.reason(),
        body_len,
        mime
    )
}

/// Header and body in one buffer, ready to hand to a write.
pub fn build(status: StatusCode, mime: &str, body: &[u8]) -> Vec<u8> {
    let header = header(status, body.len(), mime);
    let mut out = Vec::with_capacity(header.len() + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

pub fn bad_request() -> Vec<u8> {
    BAD_REQUEST.to_vec()
}

/// Mime type from the file extension; unknown extensions are served as `text/plain`.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => TEXT_HTML,
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "text/plain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_has_status_length_and_type() {
        let h = header(StatusCode::NotFound, 0, TEXT_HTML);
        assert_eq!(
            h,
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nContent-Type: text/html\r\n\r\n"
        );
    }

    #[test]
    fn build_appends_body() {
        let out = build(StatusCode::Ok, "text/plain", b"hi");
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with(b"\r\n\r\nhi"));
    }

    #[test]
    fn bad_request_is_400_with_empty_body() {
        let out = bad_request();
        assert!(out.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.ends_with(b"Content-Length: 0\r\nContent-Type: text/html\r\n\r\n"));
    }

    #[test]
    fn mime_type_by_extension() {
        assert_eq!(mime_type(Path::new("www/index.html")), "text/html");
        assert_eq!(mime_type(Path::new("www/INDEX.HTM")), "text/html");
        assert_eq!(mime_type(Path::new("a/b.png")), "image/png");
        assert_eq!(mime_type(Path::new("noext")), "text/plain");
    }

    #[test]
    fn status_codes_used_on_the_wire() {
        let codes: Vec<u16> = [
            StatusCode::Ok,
            StatusCode::BadRequest,
            StatusCode::NotFound,
            StatusCode::NotImplemented,
        ]
        .iter()
        .map(|s| s.code())
        .collect();
        assert_eq!(codes, vec![200, 400, 404, 501]);
    }
}
