use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use http::{Method, Uri, Version};
use memchr::memmem;
use tracing::{debug, trace};

use crate::conn::{ConnCore, ConnState, ErrorFlags};
use crate::headers::HeaderMap;
use crate::route::Route;
use crate::stage::MethodSet;
use crate::trace::TraceItem;

/// Incoming chunked-body decode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkState {
    Start,
    Data,
    Eof,
}

/// One element of a parsed `Range: bytes=` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `N-M`: inclusive start, stored with an exclusive end.
    FromTo(u64, u64),
    /// `N-`: from N to the end of the entity.
    From(u64),
    /// `-N`: the last N bytes of the entity.
    Last(u64),
}

/// Metadata for one decoded multipart file part.
#[derive(Debug)]
pub struct UploadFile {
    /// Form field name of the part.
    pub name: String,
    /// Filename as supplied by the client.
    pub client_filename: String,
    /// Path of the spool file holding the part data.
    pub temp_filename: PathBuf,
    /// Declared content type, if any.
    pub content_type: Option<String>,
    /// Bytes written to the spool file.
    pub size: u64,
    /// When auto-delete is set the spool path is retained here and the
    /// file is unlinked when the request state is dropped.
    pub(crate) spool: Option<tempfile::TempPath>,
}

/// Per-request parsed inbound state.
///
/// Owned by the connection and valid only for the current request.
#[derive(Debug)]
pub struct Rx {
    /// Request method (server side).
    pub method: Method,
    /// Method bit for routing and `Allow` synthesis.
    pub method_set: MethodSet,
    /// Request URI as received; routing may rewrite [`Rx::uri`].
    pub original_uri: String,
    /// Current request URI (after rewrites).
    pub uri: String,
    /// Parsed form of the URI.
    pub parsed_uri: Option<Uri>,
    /// Protocol version of this message.
    pub version: Version,
    /// Response status (client side).
    pub status: u16,
    /// Response reason phrase (client side).
    pub status_message: String,
    /// Folded message headers, keys lowercased.
    pub headers: HeaderMap,
    /// `Content-Length`, when present.
    pub content_length: Option<u64>,
    /// Body bytes still expected. `u64::MAX` means delimited by framing
    /// or connection close.
    pub remaining_content: u64,
    /// Body bytes consumed so far.
    pub bytes_read: u64,
    pub(crate) chunk_state: ChunkState,
    pub(crate) chunk_size: u64,
    /// Parsed `Range` header.
    pub ranges: Vec<RangeSpec>,
    /// Parsed input `Content-Range` (start, end, size).
    pub input_range: Option<(u64, u64, u64)>,
    /// Raw cookie header (multiple headers joined with `; `).
    pub cookie: Option<String>,
    /// Form variables: query, urlencoded bodies, route captures and the
    /// CGI-style surface.
    pub form_vars: HeaderMap,
    /// Uploaded files decoded from a multipart body.
    pub files: Vec<UploadFile>,
    /// Scheme of the `Authorization` header (lowercased).
    pub auth_type: Option<String>,
    /// Remainder of the `Authorization` header.
    pub auth_details: Option<String>,
    /// Authenticated user, once verified.
    pub auth_user: Option<String>,
    /// `Host` header.
    pub host_header: Option<String>,
    /// `Content-Type` value.
    pub mime_type: Option<String>,
    /// `Location` value (client side).
    pub redirect: Option<String>,
    /// Directory for upload spool files. Defaults to the system temp dir.
    pub upload_dir: Option<PathBuf>,
    /// If-Modified-Since / If-Unmodified-Since: (is_modified_variant, time).
    pub if_modified: Option<(bool, SystemTime)>,
    /// Body is chunked.
    pub chunked: bool,
    /// Body is a urlencoded form.
    pub form: bool,
    /// Body is a multipart upload.
    pub upload: bool,
    /// Request fully received.
    pub eof: bool,
    /// Spool files are unlinked at request completion.
    pub auto_delete: bool,
    pub(crate) need_input_pipeline: bool,
    pub(crate) start_after_content: bool,
    /// The matched route.
    pub route: Option<Arc<Route>>,
}

impl Rx {
    pub(crate) fn new() -> Rx {
        Rx {
            method: Method::GET,
            method_set: MethodSet::empty(),
            original_uri: String::new(),
            uri: String::new(),
            parsed_uri: None,
            version: Version::HTTP_11,
            status: 0,
            status_message: String::new(),
            headers: HeaderMap::new(),
            content_length: None,
            remaining_content: 0,
            bytes_read: 0,
            chunk_state: ChunkState::Start,
            chunk_size: 0,
            ranges: Vec::new(),
            input_range: None,
            cookie: None,
            form_vars: HeaderMap::new(),
            files: Vec::new(),
            auth_type: None,
            auth_details: None,
            auth_user: None,
            host_header: None,
            mime_type: None,
            redirect: None,
            upload_dir: None,
            if_modified: None,
            chunked: false,
            form: false,
            upload: false,
            eof: false,
            auto_delete: false,
            need_input_pipeline: false,
            start_after_content: false,
            route: None,
        }
    }

    /// True for HEAD requests.
    pub fn is_head(&self) -> bool {
        self.method_set.contains(MethodSet::HEAD)
    }

    /// Look up a cookie value by name.
    pub fn cookie(&self, name: &str) -> Option<String> {
        cookie_value(self.cookie.as_deref()?, name)
    }

    /// Decide whether a resource modified at `mtime` satisfies the
    /// request's conditional headers (so a 304 may be sent).
    pub fn content_not_modified(&self, mtime: SystemTime) -> bool {
        match self.if_modified {
            Some((true, since)) => mtime <= since,
            _ => false,
        }
    }
}

/// Parse a `Range: bytes=…` value. Returns `None` for syntactically or
/// structurally invalid sets (overlap, disorder, non-final open range),
/// which callers answer with 416.
pub(crate) fn parse_range(value: &str) -> Option<Vec<RangeSpec>> {
    let value = value.strip_prefix("bytes=")?;
    let mut specs = Vec::new();
    for tok in value.split(',') {
        let tok = tok.trim();
        if tok.is_empty() {
            return None;
        }
        let dash = tok.find('-')?;
        let (start, end) = tok.split_at(dash);
        let end = &end[1..];
        let spec = if start.is_empty() {
            RangeSpec::Last(end.parse().ok()?)
        } else if end.is_empty() {
            RangeSpec::From(start.parse().ok()?)
        } else {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            // Exclusive end internally; the wire format is inclusive.
            RangeSpec::FromTo(start, end.checked_add(1)?)
        };
        specs.push(spec);
    }
    if specs.is_empty() {
        return None;
    }
    for (i, spec) in specs.iter().enumerate() {
        let last = i + 1 == specs.len();
        match *spec {
            RangeSpec::FromTo(start, end) => {
                if start >= end {
                    return None;
                }
                if !last {
                    // Later ranges cannot overlap or precede earlier ones.
                    match specs[i + 1] {
                        RangeSpec::FromTo(next, _) | RangeSpec::From(next) => {
                            if end > next {
                                return None;
                            }
                        }
                        RangeSpec::Last(_) => {}
                    }
                }
            }
            // An open-ended range must be last.
            RangeSpec::From(_) | RangeSpec::Last(_) => {
                if !last {
                    return None;
                }
            }
        }
    }
    Some(specs)
}

/// Resolve range specs against a known entity length. Empty ranges are
/// dropped. Returns `None` when the length is required but unknown.
pub(crate) fn resolve_ranges(specs: &[RangeSpec], entity_len: Option<u64>) -> Option<Vec<(u64, u64)>> {
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let (start, end) = match *spec {
            RangeSpec::FromTo(start, end) => match entity_len {
                Some(len) => (start.min(len), end.min(len)),
                None => (start, end),
            },
            RangeSpec::From(start) => {
                let len = entity_len?;
                (start.min(len), len)
            }
            RangeSpec::Last(n) => {
                let len = entity_len?;
                (len.saturating_sub(n), len)
            }
        };
        if start < end {
            out.push((start, end));
        }
    }
    Some(out)
}

/// Extract a cookie by name from a raw `Cookie` header value.
pub(crate) fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    for pair in cookies.split(';') {
        let pair = pair.trim();
        let mut it = pair.splitn(2, '=');
        let key = it.next()?.trim();
        if key == name {
            let value = it.next().unwrap_or("").trim().trim_matches('"');
            return Some(value.to_string());
        }
    }
    None
}

/// Decode a www-form-urlencoded byte run.
pub(crate) fn url_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = |b: u8| (b as char).to_digit(16);
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi * 16 + lo) as u8);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode `a=b&c=d` pairs into the form-variable map.
pub(crate) fn add_form_vars(vars: &mut HeaderMap, encoded: &str) {
    for pair in encoded.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut it = pair.splitn(2, '=');
        let key = url_decode(it.next().unwrap_or(""));
        let value = url_decode(it.next().unwrap_or(""));
        if !key.is_empty() {
            vars.set(key, value);
        }
    }
}

impl ConnCore {
    /// Consume buffered input, parsing the message head when complete.
    /// Returns true when the state machine can advance further.
    pub(crate) fn parse_incoming(&mut self) -> bool {
        let len = match self.input.as_ref() {
            Some(packet) => packet.len(),
            None => return false,
        };
        if len == 0 {
            return false;
        }
        if self.rx.is_none() {
            self.rx = Some(Rx::new());
            self.tx = Some(crate::tx::Tx::new());
        }
        let head_len = {
            let buf = &self.input.as_ref().expect("input")
                .content()
                .expect("input content")[..];
            match memmem::find(buf, b"\r\n\r\n") {
                Some(pos) => pos + 4,
                None => {
                    if len >= self.limits.header_size {
                        self.error(413, ErrorFlags::abort(), "Header too big");
                        return true;
                    }
                    return false;
                }
            }
        };
        if head_len > self.limits.header_size {
            self.error(413, ErrorFlags::abort(), "Header too big");
            return true;
        }
        let head = {
            let content = self.input.as_ref().expect("input").content().expect("content");
            content[..head_len].to_vec()
        };
        let parsed = if self.server {
            self.parse_request_head(&head)
        } else {
            self.parse_response_head(&head)
        };
        // Consume the head even on failure, so the connection does not
        // re-parse a rejected request. When the body is chunked, the
        // blank line is left in place so chunk delimiters parse as
        // "\r\nSIZE\r\n".
        let consume = if parsed && self.rx_ref().chunked {
            head_len - 2
        } else {
            head_len
        };
        let now_empty = {
            let input = self.input.as_mut().expect("input");
            let content = input.content_mut();
            let _ = content.split_to(consume);
            content.is_empty()
        };
        if now_empty {
            self.input = None;
        }
        if !parsed {
            // A protocol error was reported; the error path runs next.
            return true;
        }
        if self.rx_ref().remaining_content == 0 && !self.rx_ref().chunked {
            self.rx_mut().eof = true;
        }
        if self.server {
            self.match_host();
            if self.error {
                return true;
            }
            self.route_request();
            true
        } else {
            let status = self.rx_ref().status;
            if (100..200).contains(&status) {
                // Interim response: discard and wait for the real one.
                debug!(status, "ignoring interim response");
                self.rx = Some(Rx::new());
                self.tx.as_mut().expect("tx").reset_for_interim();
                true
            } else {
                self.set_state(ConnState::Parsed);
                true
            }
        }
    }

    fn parse_request_head(&mut self, head: &[u8]) -> bool {
        let mut header_slots = vec![httparse::EMPTY_HEADER; self.limits.header_count + 1];
        let mut req = httparse::Request::new(&mut header_slots);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                self.error(400, ErrorFlags::close(), "Bad request header");
                return false;
            }
            Err(httparse::Error::TooManyHeaders) => {
                self.error(400, ErrorFlags::abort(), "Too many headers");
                return false;
            }
            Err(e) => {
                self.error(400, ErrorFlags::close(), format!("Bad request: {}", e));
                return false;
            }
        }
        let method_token = req.method.unwrap_or("");
        let uri = req.path.unwrap_or("").to_string();
        let version = if req.version == Some(0) {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };
        if uri.is_empty() {
            self.error(400, ErrorFlags::close(), "Bad HTTP request. Empty URI");
            return false;
        }
        if uri.len() >= self.limits.uri_size {
            self.error(414, ErrorFlags::close(), "Bad request. URI too long");
            return false;
        }
        if let Some(level) = self.trace.should_trace(crate::queue::Dir::Rx, TraceItem::FirstLine, None) {
            trace!(level, "{} {} {:?}", method_token, uri, version);
        }
        let method_set = MethodSet::from_token(method_token);
        {
            let rx = self.rx.as_mut().expect("rx");
            rx.method = method_token.parse().unwrap_or(Method::GET);
            rx.method_set = method_set;
            rx.version = version;
            rx.original_uri = uri.clone();
            rx.uri = uri.clone();
            rx.parsed_uri = uri.parse::<Uri>().ok();
            if method_set.contains(MethodSet::POST) || method_set.contains(MethodSet::PUT) {
                rx.need_input_pipeline = true;
            }
        }
        if self.rx_ref().parsed_uri.is_none() {
            self.error(400, ErrorFlags::close(), "Bad URL format");
            return false;
        }
        if method_set.contains(MethodSet::HEAD)
            || method_set.contains(MethodSet::OPTIONS)
            || method_set.contains(MethodSet::TRACE)
        {
            self.tx.as_mut().expect("tx").omit_body();
        }
        self.protocol = version;
        if version == Version::HTTP_10 {
            if method_set.contains(MethodSet::POST) || method_set.contains(MethodSet::PUT) {
                let rx = self.rx.as_mut().expect("rx");
                rx.remaining_content = u64::MAX;
                rx.need_input_pipeline = true;
            }
        }
        self.set_state(ConnState::FirstLine);
        self.parse_header_fields(&req_headers_owned(req.headers))
    }

    fn parse_response_head(&mut self, head: &[u8]) -> bool {
        let mut header_slots = vec![httparse::EMPTY_HEADER; self.limits.header_count + 1];
        let mut res = httparse::Response::new(&mut header_slots);
        match res.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => {
                self.error(400, ErrorFlags::close(), "Bad response header");
                return false;
            }
        }
        let version = if res.version == Some(0) {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };
        let status = res.code.unwrap_or(0);
        if !(100..600).contains(&status) {
            self.error(400, ErrorFlags::close(), "Bad response status code");
            return false;
        }
        {
            let rx = self.rx.as_mut().expect("rx");
            rx.version = version;
            rx.status = status;
            rx.status_message = res.reason.unwrap_or("").to_string();
        }
        self.protocol = version;
        if let Some(level) = self.trace.should_trace(crate::queue::Dir::Rx, TraceItem::FirstLine, None) {
            trace!(level, "{:?} {} {}", version, status, self.rx_ref().status_message);
        }
        self.set_state(ConnState::FirstLine);
        self.parse_header_fields(&req_headers_owned(res.headers))
    }

    /// Fold and act on parsed header fields.
    fn parse_header_fields(&mut self, fields: &[(String, String)]) -> bool {
        let mut keep_alive = self.protocol != Version::HTTP_10;
        for (key, value) in fields {
            let key = key.to_ascii_lowercase();
            let value = value.trim();
            if key.is_empty() || key.bytes().any(|b| matches!(b, b'%' | b'<' | b'>' | b'/' | b'\\')) {
                self.error(400, ErrorFlags::close(), "Bad header key value");
                return false;
            }
            if key == "content-length" && self.rx_ref().content_length.is_some() {
                self.error(400, ErrorFlags::close(), "Multiple content length headers");
                return false;
            }
            self.rx_mut().headers.append(key.clone(), value);
            match key.as_str() {
                "authorization" => {
                    let mut it = value.splitn(2, char::is_whitespace);
                    let scheme = it.next().unwrap_or("").to_ascii_lowercase();
                    let details = it.next().unwrap_or("").trim().to_string();
                    let rx = self.rx_mut();
                    rx.auth_type = Some(scheme);
                    rx.auth_details = Some(details);
                }
                "content-length" => {
                    let length: u64 = match value.parse() {
                        Ok(n) => n,
                        Err(_) => {
                            self.error(400, ErrorFlags::close(), "Bad content length");
                            return false;
                        }
                    };
                    if length >= self.limits.receive_body_size {
                        self.error(
                            413,
                            ErrorFlags::abort(),
                            format!(
                                "Request content length {} bytes is too big. Limit {}",
                                length, self.limits.receive_body_size
                            ),
                        );
                        return false;
                    }
                    let is_head_response = !self.server
                        && self.tx.as_ref().map_or(false, |t| t.method == Method::HEAD);
                    let rx = self.rx_mut();
                    rx.content_length = Some(length);
                    if !is_head_response {
                        rx.remaining_content = length;
                        if length > 0 {
                            rx.need_input_pipeline = true;
                        }
                    }
                }
                "content-range" => {
                    // Content-Range: bytes n1-n2/size on posted body data.
                    match parse_content_range(value) {
                        Some(range) => self.rx_mut().input_range = Some(range),
                        None => {
                            self.error(416, ErrorFlags::default(), "Bad content range");
                            return false;
                        }
                    }
                }
                "content-type" => {
                    let rx = self.rx_mut();
                    rx.mime_type = Some(value.to_string());
                    rx.form = value.starts_with("application/x-www-form-urlencoded");
                }
                "cookie" => {
                    let rx = self.rx_mut();
                    match rx.cookie {
                        Some(ref mut cookie) => {
                            cookie.push_str("; ");
                            cookie.push_str(value);
                        }
                        None => rx.cookie = Some(value.to_string()),
                    }
                }
                "connection" => {
                    if value.eq_ignore_ascii_case("keep-alive") {
                        keep_alive = true;
                    } else if value.eq_ignore_ascii_case("close") {
                        keep_alive = false;
                        self.keep_alive_count = 0;
                    }
                }
                "host" => {
                    self.rx_mut().host_header = Some(value.to_string());
                }
                "if-modified-since" | "if-unmodified-since" => {
                    let modified = key.as_bytes()[3] == b'm';
                    let date = value.split(';').next().unwrap_or(value).trim();
                    if let Ok(when) = httpdate::parse_http_date(date) {
                        self.rx_mut().if_modified = Some((modified, when));
                    }
                }
                "keep-alive" => {
                    // A client "max=1" means this is the second-last
                    // request; close one early so the client leads the
                    // termination.
                    if value.to_ascii_lowercase().ends_with("max=1") {
                        self.keep_alive_count = 0;
                    } else {
                        keep_alive = true;
                    }
                }
                "location" => {
                    self.rx_mut().redirect = Some(value.to_string());
                }
                "range" => match parse_range(value) {
                    Some(ranges) => self.rx_mut().ranges = ranges,
                    None => {
                        self.error(416, ErrorFlags::default(), "Bad range");
                        return false;
                    }
                },
                "transfer-encoding" => {
                    if value.eq_ignore_ascii_case("chunked") {
                        let rx = self.rx_mut();
                        rx.chunked = true;
                        // Revised by the chunk filter as chunks are
                        // consumed; zero once the last chunk is seen.
                        rx.remaining_content = u64::MAX;
                        rx.need_input_pipeline = true;
                    }
                }
                "www-authenticate" => {
                    if !self.server {
                        self.parse_authenticate(value);
                    }
                }
                _ => {}
            }
            if self.error {
                return false;
            }
        }
        if !keep_alive {
            self.keep_alive_count = 0;
        }
        if let Some(level) = self.trace.should_trace(crate::queue::Dir::Rx, TraceItem::Headers, None) {
            trace!(level, headers = ?self.rx_ref().headers, "parsed headers");
        }
        true
    }
}

fn req_headers_owned(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let value = value.trim().strip_prefix("bytes")?.trim();
    let mut it = value.splitn(2, '/');
    let range = it.next()?;
    let size: u64 = it.next()?.trim().parse().ok()?;
    let mut bounds = range.splitn(2, '-');
    let start: u64 = bounds.next()?.trim().parse().ok()?;
    let end: u64 = bounds.next()?.trim().parse().ok()?;
    if end <= start {
        return None;
    }
    Some((start, end, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_simple() {
        let specs = parse_range("bytes=0-49").unwrap();
        assert_eq!(specs, vec![RangeSpec::FromTo(0, 50)]);
    }

    #[test]
    fn range_multi() {
        let specs = parse_range("bytes=0-3,6-9").unwrap();
        assert_eq!(specs, vec![RangeSpec::FromTo(0, 4), RangeSpec::FromTo(6, 10)]);
    }

    #[test]
    fn range_suffix_and_open() {
        assert_eq!(parse_range("bytes=-50").unwrap(), vec![RangeSpec::Last(50)]);
        assert_eq!(parse_range("bytes=1-").unwrap(), vec![RangeSpec::From(1)]);
    }

    #[test]
    fn range_rejects_disorder_and_overlap() {
        assert!(parse_range("bytes=5-2").is_none());
        assert!(parse_range("bytes=0-10,5-20").is_none());
        assert!(parse_range("bytes=5-,0-3").is_none());
        assert!(parse_range("bytes=").is_none());
        assert!(parse_range("lines=0-3").is_none());
    }

    #[test]
    fn range_resolution() {
        let specs = parse_range("bytes=-7").unwrap();
        let resolved = resolve_ranges(&specs, Some(10)).unwrap();
        assert_eq!(resolved, vec![(3, 10)]);

        let specs = parse_range("bytes=1-").unwrap();
        assert_eq!(resolve_ranges(&specs, Some(10)).unwrap(), vec![(1, 10)]);
        assert!(resolve_ranges(&specs, None).is_none());

        // Ends are clamped to the entity length.
        let specs = parse_range("bytes=0-99").unwrap();
        assert_eq!(resolve_ranges(&specs, Some(10)).unwrap(), vec![(0, 10)]);
    }

    #[test]
    fn cookie_lookup() {
        assert_eq!(
            cookie_value("a=1; -http-session-=\"abc\"; b=2", "-http-session-").as_deref(),
            Some("abc")
        );
        assert_eq!(cookie_value("a=1", "b"), None);
    }

    #[test]
    fn url_decoding() {
        assert_eq!(url_decode("a%20b+c%2F"), "a b c/");
        assert_eq!(url_decode("100%"), "100%");
    }

    #[test]
    fn form_var_decoding() {
        let mut vars = HeaderMap::new();
        add_form_vars(&mut vars, "name=alice&tag=a%2Fb&empty=");
        assert_eq!(vars.get("name"), Some("alice"));
        assert_eq!(vars.get("tag"), Some("a/b"));
        assert_eq!(vars.get("empty"), Some(""));
    }

    #[test]
    fn content_range_parse() {
        assert_eq!(parse_content_range("bytes 0-4/10"), Some((0, 4, 10)));
        assert_eq!(parse_content_range("bytes 4-0/10"), None);
        assert_eq!(parse_content_range("chars 0-4/10"), None);
    }
}
