//! Turning a parsed request into response bytes.
//!
//! Shared by processing workers (split mode) and dispatch workers (joined mode).

use std::io;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TEMPLATE_CAPACITY;
use crate::metrics;
use crate::protocol::{self, ParseStatus, ParserContext};
use crate::response::{self, StatusCode, TEXT_HTML};

/// Requests under this prefix are rendered from the page template rather than read from disk.
pub const TEMPLATE_PREFIX: &str = "/regex";

const TEMPLATE_URL_PATTERN: &str = r"^/regex\?html=([^&]*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    File,
    Templated,
}

pub fn request_kind(url: &str) -> RequestKind {
    if url.starts_with(TEMPLATE_PREFIX) {
        RequestKind::Templated
    } else {
        RequestKind::File
    }
}

/// The handler could not produce a response at all; the request gets no reply.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("url does not match the template pattern")]
    NoMatch,
    #[error("parameter is not valid percent-encoding")]
    BadEncoding,
    #[error("rendered page exceeds the template capacity")]
    TooLarge,
}

/// What to do with one inbound request.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Send(Vec<u8>),
    /// Incomplete request or handler failure: nothing goes back.
    Drop,
}

#[derive(Debug)]
pub struct RequestHandler {
    doc_root: PathBuf,
    template_url: Regex,
}

impl RequestHandler {
    pub fn new(doc_root: impl Into<PathBuf>) -> Self {
        Self {
            doc_root: doc_root.into(),
            template_url: Regex::new(TEMPLATE_URL_PATTERN).expect("template pattern is valid"),
        }
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    /// Parse `request` and produce its reply. `ctx` is reset before returning, whatever the
    /// outcome.
    pub fn serve(&self, ctx: &mut ParserContext, request: &[u8]) -> Reply {
        ctx.reset();
        let reply = match protocol::parse(ctx, request) {
            ParseStatus::Complete => match self.handle(ctx) {
                Ok(bytes) => Reply::Send(bytes),
                Err(e) => {
                    warn!(error = %e, "error formatting response, dropping request");
                    metrics::inc_requests_dropped();
                    Reply::Drop
                }
            },
            ParseStatus::Error(reason) => {
                debug!(reason, "malformed request");
                metrics::inc_bad_requests();
                Reply::Send(response::bad_request())
            }
            ParseStatus::Incomplete => {
                warn!(
                    request = %String::from_utf8_lossy(request),
                    "incomplete request, partial requests are not reassembled"
                );
                metrics::inc_requests_dropped();
                Reply::Drop
            }
        };
        ctx.reset();
        reply
    }

    /// Build the response for a completely parsed request.
    pub fn handle(&self, ctx: &ParserContext) -> Result<Vec<u8>, HandlerError> {
        match request_kind(ctx.url()) {
            RequestKind::Templated => Ok(self.templated(ctx.url())),
            RequestKind::File => self.file(ctx.url()),
        }
    }

    fn file(&self, url: &str) -> Result<Vec<u8>, HandlerError> {
        let Some(path) = url_to_path(&self.doc_root, url) else {
            debug!(url, "unmappable url");
            return Ok(response::build(StatusCode::NotFound, TEXT_HTML, b""));
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                debug!(path = %path.display(), "directory requested, returning 404");
                return Ok(response::build(StatusCode::NotFound, TEXT_HTML, b""));
            }
            Ok(_) => {}
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no such file");
                return Ok(response::build(StatusCode::NotFound, TEXT_HTML, b""));
            }
        }
        let body = std::fs::read(&path).map_err(|source| HandlerError::Read {
            path: path.clone(),
            source,
        })?;
        Ok(response::build(
            StatusCode::Ok,
            response::mime_type(&path),
            &body,
        ))
    }

    fn templated(&self, url: &str) -> Vec<u8> {
        match self.render(url) {
            Ok(page) => response::build(StatusCode::Ok, TEXT_HTML, page.as_bytes()),
            Err(e) => {
                debug!(url, error = %e, "cannot render template");
                response::build(StatusCode::NotImplemented, TEXT_HTML, b"")
            }
        }
    }

    /// Render the page for a templated url.
    pub fn render(&self, url: &str) -> Result<String, RenderError> {
        let captures = self.template_url.captures(url).ok_or(RenderError::NoMatch)?;
        let raw = captures.get(1).map_or("", |m| m.as_str());
        let value = protocol::percent_decode(raw).ok_or(RenderError::BadEncoding)?;
        let page = format!(
            "<!DOCTYPE html>\n<html><head><title>regex</title></head>\
             <body><h1>{}</h1></body></html>\n",
            escape_html(&value)
        );
        if page.len() > TEMPLATE_CAPACITY {
            return Err(RenderError::TooLarge);
        }
        Ok(page)
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Map a request target to a path under `root`. The query string is ignored; `None` for
/// undecodable paths or any attempt to climb out of `root`.
pub fn url_to_path(root: &Path, url: &str) -> Option<PathBuf> {
    let path = url.split('?').next().unwrap_or(url);
    let decoded = protocol::percent_decode(path)?;
    let relative = Path::new(decoded.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(relative))
}
