use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use http::{Method, StatusCode, Uri, Version};
use tracing::trace;

use crate::conn::ConnCore;
use crate::headers::HeaderMap;
use crate::packet::Packet;
use crate::stage::Stage;
use crate::trace::TraceItem;

/// Outbound chunking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunking {
    /// Chunk when the body length is unknown at first emission.
    Auto,
    /// Never chunk.
    Off,
    /// Chunk with a forced chunk size.
    Size(usize),
}

/// Per-request outbound response (or client request) builder.
///
/// Owned by the connection and valid only for the current request.
#[derive(Debug)]
pub struct Tx {
    /// Response status.
    pub status: u16,
    /// Custom reason phrase; the canonical reason is used when absent.
    pub status_message: Option<String>,
    /// Request method (client side).
    pub method: Method,
    /// Request target (client side).
    pub parsed_uri: Option<Uri>,
    /// Response headers, emitted in insertion order.
    pub headers: HeaderMap,
    /// Fixed body length. `None` until known.
    pub length: Option<u64>,
    /// Full entity length, independent of ranges.
    pub entity_length: Option<u64>,
    /// Chunking mode.
    pub chunk_size: Chunking,
    /// Resolved output ranges (exclusive ends).
    pub(crate) ranges: Vec<(u64, u64)>,
    pub(crate) current_range: usize,
    pub(crate) range_boundary: Option<String>,
    /// Entity stream position used by the range filter.
    pub(crate) pos: u64,
    /// The selected handler stage.
    pub(crate) handler: Option<Arc<dyn Stage>>,
    /// Methods of the originally selected handler, for `Allow`.
    pub(crate) trace_methods: crate::stage::MethodSet,
    /// File for send-file delivery.
    pub(crate) file: Option<File>,
    /// Path for send-file delivery.
    pub filename: Option<PathBuf>,
    /// Alternate body overriding pending output (error pages).
    pub(crate) alt_body: Option<String>,
    /// Entity tag for the response.
    pub etag: Option<String>,
    /// Response headers have been serialized; only disconnect can signal
    /// failure after this point.
    pub(crate) headers_created: bool,
    pub(crate) no_body: bool,
    pub(crate) finalized: bool,
    pub(crate) dont_cache: bool,
    pub(crate) bytes_written: u64,
    pub(crate) header_size: usize,
}

impl Tx {
    pub(crate) fn new() -> Tx {
        Tx {
            status: 200,
            status_message: None,
            method: Method::GET,
            parsed_uri: None,
            headers: HeaderMap::new(),
            length: None,
            entity_length: None,
            chunk_size: Chunking::Auto,
            ranges: Vec::new(),
            current_range: 0,
            range_boundary: None,
            pos: 0,
            handler: None,
            trace_methods: crate::stage::MethodSet::all(),
            file: None,
            filename: None,
            alt_body: None,
            etag: None,
            headers_created: false,
            no_body: false,
            finalized: false,
            dont_cache: false,
            bytes_written: 0,
            header_size: 0,
        }
    }

    pub(crate) fn reset_for_interim(&mut self) {
        self.finalized = false;
    }

    /// Suppress the response body (HEAD, OPTIONS, TRACE, 304).
    pub fn omit_body(&mut self) {
        self.no_body = true;
    }

    /// Disable client caching of this response.
    pub fn dont_cache(&mut self) {
        self.dont_cache = true;
    }

    /// Set a fixed content length, which also disables chunking.
    pub fn set_content_length(&mut self, length: u64) {
        self.length = Some(length);
        self.chunk_size = Chunking::Off;
    }

    /// Declare the full entity length (used by ranged responses).
    pub fn set_entity_length(&mut self, length: u64) {
        self.entity_length = Some(length);
        if self.ranges.is_empty() {
            self.length = Some(length);
        }
    }

    /// Set the response content type.
    pub fn set_content_type(&mut self, mime: &str) {
        self.headers.set("Content-Type", mime);
    }

    /// Designate a file for send-file delivery by the connector.
    pub fn set_send_file(&mut self, path: impl Into<PathBuf>) {
        self.filename = Some(path.into());
    }

    /// Build an HTML body used in place of any pending output.
    ///
    /// The body is a small self-contained document; callers escape
    /// interpolated text with [`escape_html`].
    pub fn format_body(&mut self, title: &str, body: &str) -> usize {
        let alt = format!(
            "<!DOCTYPE html>\r\n<html><head><title>{}</title></head>\r\n\
             <body>\r\n{}\r\n</body>\r\n</html>\r\n",
            title, body
        );
        let len = alt.len();
        self.alt_body = Some(alt);
        len
    }

    /// Install the standard error body for `status`.
    pub(crate) fn set_response_body(&mut self, status: u16, msg: &str) {
        self.status = status;
        if self.alt_body.is_none() {
            let status_msg = status_message(status);
            let body = format!(
                "<h2>Access Error: {} -- {}</h2>\r\n<p>{}</p>\r\n",
                status,
                status_msg,
                escape_html(msg)
            );
            self.format_body(status_msg, &body);
        }
    }

    /// Append a `Set-Cookie` header.
    pub fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        path: &str,
        domain: Option<&str>,
        lifetime: Option<Duration>,
        secure: bool,
    ) {
        let mut cookie = format!("{}={}; path={}", name, value, path);
        if let Some(domain) = domain {
            cookie.push_str("; domain=");
            cookie.push_str(domain);
        }
        if let Some(lifetime) = lifetime {
            let expires = SystemTime::now() + lifetime;
            cookie.push_str("; expires=");
            cookie.push_str(&httpdate::fmt_http_date(expires));
        }
        if secure {
            cookie.push_str("; secure");
        }
        cookie.push_str("; httponly");
        self.headers.append("Set-Cookie", cookie);
    }
}

/// Canonical reason phrase for a status code.
pub(crate) fn status_message(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Custom error")
}

/// Escape text for inclusion in an HTML error body.
pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

impl ConnCore {
    /// Redirect to `target`, synthesizing the body and `Location` header.
    pub fn redirect(&mut self, status: u16, target: &str) {
        let location = if target.starts_with('/') {
            let scheme = if self.secure { "https" } else { "http" };
            let host = self
                .rx
                .as_ref()
                .and_then(|rx| rx.host_header.clone())
                .unwrap_or_else(|| "localhost".to_string());
            format!("{}://{}{}", scheme, host, target)
        } else {
            target.to_string()
        };
        let tx = self.tx.as_mut().expect("tx");
        tx.status = status;
        tx.headers.set("Location", location.clone());
        let msg = status_message(status);
        let body = format!(
            "<h1>{}</h1>\r\n<p>The document has moved <a href=\"{}\">here</a>.</p>\r\n",
            msg,
            escape_html(&location)
        );
        tx.format_body(msg, &body);
        if status == 301 {
            self.keep_alive_count = 0;
        }
        self.finalize();
    }

    /// Serialize the head into `packet` if not already created.
    ///
    /// Called by the connector on the header packet's first emission so
    /// that late header decisions (chunking, ranges, keep-alive) are
    /// final.
    pub(crate) fn write_headers(&mut self, packet: &mut Packet) {
        if self.tx.as_ref().expect("tx").headers_created {
            return;
        }
        self.set_default_headers();
        self.set_headers();

        let mut buf = BytesMut::with_capacity(256);
        let server = self.server;
        let tx = self.tx.as_mut().expect("tx");
        if server {
            let version = match self.protocol {
                Version::HTTP_10 => "HTTP/1.0",
                _ => "HTTP/1.1",
            };
            buf.extend_from_slice(version.as_bytes());
            buf.extend_from_slice(b" ");
            let mut itoa_buf = itoa::Buffer::new();
            buf.extend_from_slice(itoa_buf.format(tx.status).as_bytes());
            buf.extend_from_slice(b" ");
            let reason = tx
                .status_message
                .as_deref()
                .unwrap_or_else(|| status_message(tx.status));
            buf.extend_from_slice(reason.as_bytes());
            buf.extend_from_slice(b"\r\n");
        } else {
            buf.extend_from_slice(tx.method.as_str().as_bytes());
            buf.extend_from_slice(b" ");
            let target = tx
                .parsed_uri
                .as_ref()
                .map(|uri| {
                    uri.path_and_query()
                        .map(|pq| pq.as_str().to_string())
                        .unwrap_or_else(|| uri.path().to_string())
                })
                .unwrap_or_else(|| "/".to_string());
            buf.extend_from_slice(target.as_bytes());
            let version = match self.protocol {
                Version::HTTP_10 => " HTTP/1.0\r\n",
                _ => " HTTP/1.1\r\n",
            };
            buf.extend_from_slice(version.as_bytes());
        }
        for (key, value) in tx.headers.iter() {
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        // When chunking, the blank line is omitted so the first chunk
        // prefix "\r\nSIZE\r\n" completes the head.
        let chunked = matches!(tx.chunk_size, Chunking::Size(_)) && tx.alt_body.is_none();
        if !chunked {
            buf.extend_from_slice(b"\r\n");
        }
        if let Some(alt) = tx.alt_body.take() {
            buf.extend_from_slice(alt.as_bytes());
        }
        tx.header_size = buf.len();
        tx.headers_created = true;
        if let Some(level) = self.trace.should_trace(crate::queue::Dir::Tx, TraceItem::Headers, None) {
            trace!(level, head = %String::from_utf8_lossy(&buf), "response head");
        }
        *packet.content_mut() = buf;
    }

    fn set_default_headers(&mut self) {
        let software = self.http.software().to_string();
        let tx = self.tx.as_mut().expect("tx");
        if self.server {
            tx.headers.add("Server", software);
        } else {
            tx.headers.add("User-Agent", software);
        }
    }

    /// Define the standard headers ahead of serialization.
    fn set_headers(&mut self) {
        let date = httpdate::fmt_http_date(SystemTime::now());
        let ranges = self.rx.as_ref().map_or(false, |rx| !rx.ranges.is_empty());
        let is_head = self.rx.as_ref().map_or(false, |rx| rx.is_head());
        let inactivity = self.limits.inactivity_timeout.as_secs();
        let server = self.server;

        let resolved = self.tx.as_ref().expect("tx").ranges.clone();
        let entity_length = self.tx.as_ref().expect("tx").entity_length;
        let tx = self.tx.as_mut().expect("tx");
        tx.headers.add("Date", date);

        if tx.dont_cache {
            tx.headers.add("Cache-Control", "no-cache");
        }
        if let Some(ref etag) = tx.etag {
            tx.headers.set("ETag", etag.clone());
        }
        if let Some(ref alt) = tx.alt_body {
            tx.length = Some(alt.len() as u64);
        }
        match (tx.chunk_size, tx.alt_body.is_some()) {
            (Chunking::Size(_), false) => {
                if !is_head {
                    tx.headers.set("Transfer-Encoding", "chunked");
                }
            }
            _ => {
                if let Some(length) = tx.length {
                    let mut itoa_buf = itoa::Buffer::new();
                    tx.headers.set("Content-Length", itoa_buf.format(length));
                }
            }
        }
        if ranges && server {
            if resolved.len() == 1 {
                let (start, end) = resolved[0];
                let total = match entity_length {
                    Some(len) => len.to_string(),
                    None => "*".to_string(),
                };
                tx.headers
                    .set("Content-Range", format!("bytes {}-{}/{}", start, end - 1, total));
            } else if let Some(ref boundary) = tx.range_boundary {
                tx.headers.set(
                    "Content-Type",
                    format!("multipart/byteranges; boundary={}", boundary),
                );
            }
            tx.headers.add("Accept-Ranges", "bytes");
        }
        if server {
            self.keep_alive_count -= 1;
            if self.keep_alive_count > 0 {
                let tx = self.tx.as_mut().expect("tx");
                tx.headers.set("Connection", "keep-alive");
                tx.headers.set(
                    "Keep-Alive",
                    format!("timeout={}, max={}", inactivity, self.keep_alive_count),
                );
            } else {
                self.tx.as_mut().expect("tx").headers.set("Connection", "close");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_entities() {
        assert_eq!(escape_html("<b>&\"x\""), "&lt;b&gt;&amp;&quot;x&quot;");
    }

    #[test]
    fn status_messages() {
        assert_eq!(status_message(200), "OK");
        assert_eq!(status_message(416), "Range Not Satisfiable");
        assert_eq!(status_message(999), "Custom error");
    }

    #[test]
    fn format_body_is_self_contained() {
        let mut tx = Tx::new();
        let len = tx.format_body("Not Found", "<h2>missing</h2>");
        let body = tx.alt_body.unwrap();
        assert_eq!(len, body.len());
        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.contains("<title>Not Found</title>"));
    }

    #[test]
    fn response_body_escapes_message() {
        let mut tx = Tx::new();
        tx.set_response_body(404, "no <such> file");
        let body = tx.alt_body.unwrap();
        assert!(body.contains("no &lt;such&gt; file"));
        assert_eq!(tx.status, 404);
    }

    #[test]
    fn cookie_attributes() {
        let mut tx = Tx::new();
        tx.set_cookie("-http-session-", "abc", "/", None, None, true);
        let cookie = tx.headers.get("set-cookie").unwrap();
        assert!(cookie.starts_with("-http-session-=abc; path=/"));
        assert!(cookie.contains("secure"));
        assert!(cookie.contains("httponly"));
    }
}
