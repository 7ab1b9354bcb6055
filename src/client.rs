use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{Method, Uri, Version};
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::auth::digest;
use crate::conn::{ConnCore, ConnState, ErrorFlags};
use crate::error::{Error, Kind, User};
use crate::headers::HeaderMap;
use crate::packet::Packet;
use crate::rx::Rx;
use crate::service::Http;
use crate::tx::Tx;

/// Combined cap on redirect and authentication retries, to terminate
/// loops.
const MAX_RETRIES: usize = 16;

/// An HTTP/1.x client issuing requests over the shared connection core.
///
/// Keep-alive connections are reused across requests to the same
/// authority. On 401 the request is retried once per challenge with
/// computed credentials; 301/302 responses are followed when enabled.
pub struct Client {
    http: Http,
    follow_redirects: bool,
    credentials: Option<(String, String)>,
    auth: crate::conn::ClientAuth,
    conn: Option<ClientConn>,
}

/// A buffered client response.
#[derive(Debug)]
pub struct ClientResponse {
    /// Response status code.
    pub status: u16,
    /// Reason phrase.
    pub reason: String,
    /// Protocol version.
    pub version: Version,
    /// Response headers, keys lowercased.
    pub headers: HeaderMap,
    /// The response body.
    pub body: Bytes,
}

impl ClientResponse {
    /// The body as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct ClientConn {
    io: TcpStream,
    read_buf: BytesMut,
    core: ConnCore,
    authority: (String, u16),
}

impl Drop for ClientConn {
    fn drop(&mut self) {
        let watch = self.core.watch.clone();
        self.core.http.remove_conn(&watch);
    }
}

impl Client {
    /// Create a client bound to an engine service.
    pub fn new(http: &Http) -> Client {
        Client {
            http: http.clone(),
            follow_redirects: true,
            credentials: None,
            auth: Default::default(),
            conn: None,
        }
    }

    /// Configure credentials offered on 401 challenges.
    pub fn set_credentials(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.credentials = Some((user.into(), password.into()));
        self.auth = Default::default();
    }

    /// Clear configured credentials and cached challenge state.
    pub fn reset_credentials(&mut self) {
        self.credentials = None;
        self.auth = Default::default();
    }

    /// Whether 301/302 responses are followed automatically.
    pub fn follow_redirects(&mut self, follow: bool) {
        self.follow_redirects = follow;
    }

    /// Issue a GET request.
    pub async fn get(&mut self, url: &str) -> crate::Result<ClientResponse> {
        self.request(Method::GET, url, None).await
    }

    /// Issue a POST request with a body.
    pub async fn post(&mut self, url: &str, body: Bytes) -> crate::Result<ClientResponse> {
        self.request(Method::POST, url, Some(body)).await
    }

    /// Issue a request, following redirects and answering auth
    /// challenges as configured.
    pub async fn request(
        &mut self,
        method: Method,
        url: &str,
        body: Option<Bytes>,
    ) -> crate::Result<ClientResponse> {
        let mut url = url.to_string();
        let mut sent_credentials;
        for _ in 0..MAX_RETRIES {
            let response = self.issue(&method, &url, body.clone()).await?;
            sent_credentials = self
                .conn
                .as_ref()
                .map_or(false, |c| c.core.sent_credentials);
            if response.status == 401 {
                if self.credentials.is_none() {
                    return Err(Error::new_status(401, "Authentication required"));
                }
                if sent_credentials {
                    return Err(Error::new_status(401, "Authentication failed"));
                }
                debug!("retrying with credentials");
                continue;
            }
            if (301..=302).contains(&response.status) && self.follow_redirects {
                match response.headers.get("location") {
                    Some(location) => {
                        url = resolve_location(&url, location)?;
                        debug!(%url, "following redirect");
                        continue;
                    }
                    None => return Ok(response),
                }
            }
            return Ok(response);
        }
        Err(Error::new_user(User::TooManyRetries))
    }

    async fn issue(
        &mut self,
        method: &Method,
        url: &str,
        body: Option<Bytes>,
    ) -> crate::Result<ClientResponse> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::new_user(User::AbsoluteUriRequired).with(format!("{}", e)))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::new_user(User::AbsoluteUriRequired))?
            .to_string();
        if uri.scheme_str() == Some("https") {
            return Err(Error::new(Kind::Connect).with("https requires an external TLS transport"));
        }
        let port = uri.port_u16().unwrap_or(80);

        let mut conn = self.open_connection(&host, port).await?;
        conn.core.client_auth = self.auth.clone();
        conn.prepare(&self.http);
        self.write_request(&mut conn, method, &uri, &host, port, body)?;
        let result = conn.drive_response().await;
        // Pull back challenge state learned from this response.
        self.auth = conn.core.client_auth.clone();
        let response = result?;
        if !conn.core.closing {
            self.conn = Some(conn);
        } else {
            self.conn = Some(conn);
            // Keep for sent_credentials inspection; the socket will not
            // be reused.
            if let Some(ref mut conn) = self.conn {
                conn.core.keep_alive_count = -1;
            }
        }
        Ok(response)
    }

    /// Open, or reuse, a socket to the resolved authority.
    async fn open_connection(&mut self, host: &str, port: u16) -> crate::Result<ClientConn> {
        if let Some(conn) = self.conn.take() {
            if conn.core.keep_alive_count >= 0
                && conn.authority == (host.to_string(), port)
                && !conn.core.conn_error
            {
                trace!(host, port, "reusing keep-alive connection");
                return Ok(conn);
            }
        }
        debug!(host, port, "opening connection");
        let io = TcpStream::connect((host, port))
            .await
            .map_err(Error::new_connect)?;
        let limits = self.http.client_limits();
        let watch = self.http.add_conn(&limits);
        let mut core = ConnCore::new(&self.http, false, Arc::new(Vec::new()), limits, watch);
        core.keep_alive_count = core.limits.keep_alive_count;
        core.peer_addr = io.peer_addr().ok();
        core.local_addr = io.local_addr().ok();
        core.state = ConnState::Connected;
        Ok(ClientConn {
            io,
            read_buf: BytesMut::with_capacity(8 * 1024),
            core,
            authority: (host.to_string(), port),
        })
    }

    /// Assemble the outgoing head (including auth headers) and body.
    fn write_request(
        &mut self,
        conn: &mut ClientConn,
        method: &Method,
        uri: &Uri,
        host: &str,
        port: u16,
        body: Option<Bytes>,
    ) -> crate::Result<()> {
        let core = &mut conn.core;
        {
            let tx = core.tx_mut();
            tx.method = method.clone();
            tx.parsed_uri = Some(uri.clone());
        }
        core.sent_credentials = false;
        self.add_auth_headers(core, method, uri);
        {
            let host_value = if port == 80 {
                host.to_string()
            } else {
                format!("{}:{}", host, port)
            };
            let keep_alive = core.keep_alive_count > 0;
            let tx = core.tx_mut();
            tx.headers.add("Host", host_value);
            if keep_alive {
                tx.headers.set("Connection", "keep-alive");
            } else {
                tx.headers.set("Connection", "close");
            }
            if let Some(ref body) = body {
                tx.set_content_length(body.len() as u64);
            } else if matches!(*method, Method::POST | Method::PUT) {
                tx.set_content_length(0);
            }
        }
        let wq = core.write_q.expect("client pipeline");
        core.put_for_service(wq, Packet::header(), false);
        if let Some(body) = body {
            core.put_for_service(wq, Packet::data_from(&body[..]), false);
        }
        core.tx_mut().finalized = true;
        core.put_for_service(wq, Packet::end(), true);
        core.service_queues();
        Ok(())
    }

    /// Compute `Authorization` per the cached challenge.
    fn add_auth_headers(&mut self, core: &mut ConnCore, method: &Method, uri: &Uri) {
        let (user, password) = match self.credentials {
            Some(ref creds) => creds.clone(),
            None => return,
        };
        let scheme = match self.auth.auth_type.as_deref() {
            Some(scheme) => scheme.to_string(),
            None => return,
        };
        if scheme == "basic" {
            let value = crate::auth::basic::header_value(&user, &password);
            core.tx_mut().headers.set("Authorization", value);
            core.sent_credentials = true;
        } else if scheme == "digest" {
            let realm = self.auth.realm.clone().unwrap_or_default();
            let nonce = match self.auth.nonce.clone() {
                Some(nonce) => nonce,
                None => return,
            };
            let path = uri.path().to_string();
            let cnonce = digest::md5_hex(&format!(
                "{}:{}:{}",
                self.http.secret(),
                realm,
                crate::auth::now_secs()
            ));
            self.auth.nc += 1;
            let nc = format!("{:08x}", self.auth.nc);
            let ha1 = digest::md5_hex(&format!("{}:{}:{}", user, realm, password));
            let qop = self.auth.qop.clone().filter(|q| q == "auth");
            let response = digest::calc_digest(
                &ha1,
                method.as_str(),
                &path,
                &nonce,
                qop.as_deref(),
                Some(&nc),
                Some(&cnonce),
            );
            let value = match qop {
                Some(_) => format!(
                    "Digest username=\"{}\", realm=\"{}\", domain=\"{}\", algorithm=\"MD5\", \
                     qop=\"auth\", cnonce=\"{}\", nc={}, nonce=\"{}\", opaque=\"{}\", \
                     uri=\"{}\", response=\"{}\"",
                    user,
                    realm,
                    self.auth.domain.clone().unwrap_or_default(),
                    cnonce,
                    nc,
                    nonce,
                    self.auth.opaque.clone().unwrap_or_default(),
                    path,
                    response
                ),
                None => format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                     response=\"{}\"",
                    user, realm, nonce, path, response
                ),
            };
            core.tx_mut().headers.set("Authorization", value);
            core.sent_credentials = true;
        }
        core.client_auth = self.auth.clone();
    }
}

impl ClientConn {
    /// Reset per-request state and rebuild the client pipelines.
    fn prepare(&mut self, _http: &Http) {
        let sent = self.core.sent_credentials;
        self.core.reset();
        self.core.sent_credentials = sent;
        self.core.state = ConnState::Connected;
        self.core.rx = Some(Rx::new());
        self.core.tx = Some(Tx::new());
        self.core.create_client_pipeline();
    }

    /// Flush the request and read the response to completion.
    async fn drive_response(&mut self) -> crate::Result<ClientResponse> {
        loop {
            self.core.process();
            self.core.service_queues();
            self.flush_output().await?;
            if self.core.resume_connector() {
                continue;
            }
            if self.core.state == ConnState::Complete || self.core.conn_error {
                break;
            }
            if self.core.error {
                break;
            }
            let watch = self.core.watch.clone();
            self.read_buf.reserve(8 * 1024);
            let n = tokio::select! {
                r = self.io.read_buf(&mut self.read_buf) => r.map_err(Error::new_io)?,
                _ = watch.expired() => {
                    if !watch.confirm_expired() {
                        continue;
                    }
                    self.core.error(408, ErrorFlags::close(), watch.timeout_reason());
                    return Err(Error::new_timeout());
                }
            };
            if n == 0 {
                if !self.core.handle_eof() {
                    break;
                }
                continue;
            }
            self.core.feed(&self.read_buf[..]);
            self.read_buf.clear();
        }
        if self.core.error && self.core.rx.as_ref().map_or(true, |rx| rx.status == 0) {
            let msg = self.core.error_msg.clone().unwrap_or_default();
            return Err(Error::new_incomplete().with(msg));
        }
        let mut body = BytesMut::new();
        while let Some(chunk) = self.core.read_body() {
            body.extend_from_slice(&chunk);
        }
        let rx = self.core.rx_ref();
        Ok(ClientResponse {
            status: rx.status,
            reason: rx.status_message.clone(),
            version: rx.version,
            headers: rx.headers.clone(),
            body: body.freeze(),
        })
    }

    async fn flush_output(&mut self) -> crate::Result<()> {
        let io = &mut self.io;
        let write_buf = &mut self.core.write_buf;
        while write_buf.has_remaining() {
            let n = futures_util::future::poll_fn(|cx| {
                let slices = write_buf.io_slices();
                std::pin::Pin::new(&mut *io).poll_write_vectored(cx, &slices)
            })
            .await
            .map_err(Error::new_io)?;
            if n == 0 {
                return Err(Error::new_io(std::io::ErrorKind::WriteZero.into()));
            }
            write_buf.advance(n);
        }
        Ok(())
    }
}

/// Resolve a redirect target against the request URL.
fn resolve_location(base: &str, location: &str) -> crate::Result<String> {
    if location.starts_with('/') {
        let base: Uri = base
            .parse()
            .map_err(|_| Error::new_user(User::AbsoluteUriRequired))?;
        let scheme = base.scheme_str().unwrap_or("http");
        let authority = base
            .authority()
            .ok_or_else(|| Error::new_user(User::AbsoluteUriRequired))?;
        Ok(format!("{}://{}{}", scheme, authority, location))
    } else {
        Ok(location.to_string())
    }
}

impl crate::conn::ConnCore {
    /// Build the client pipelines: the request flows straight to the
    /// connector, the response flows connector → chunk decode → sink.
    pub(crate) fn create_client_pipeline(&mut self) {
        use crate::queue::{Dir, Queue};

        let net = self.http.net_connector();
        let chunk = self.http.chunk_filter();
        let sink = self.http.pass_handler();
        let buffer = self.limits.stage_buffer_size;

        let wq = self.queues.len();
        self.queues.push(Queue::new(net.clone(), Dir::Tx, buffer));
        self.write_q = Some(wq);
        self.conn_q = Some(wq);

        let mut prev: Option<usize> = None;
        for stage in [net, chunk, sink] {
            let qid = self.queues.len();
            self.queues.push(Queue::new(stage, Dir::Rx, buffer));
            if let Some(prev) = prev {
                self.queues[prev].next = Some(qid);
                self.queues[qid].prev = Some(prev);
            }
            if prev.is_none() {
                self.rx_head = Some(qid);
            }
            prev = Some(qid);
        }
        self.read_q = prev;

        for q in 0..self.queues.len() {
            if !self.queues[q].open {
                self.queues[q].open = true;
                let stage = self.stage_of(q);
                stage.open(self, q);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_resolution() {
        assert_eq!(
            resolve_location("http://h:8080/a", "/b").unwrap(),
            "http://h:8080/b"
        );
        assert_eq!(
            resolve_location("http://h/a", "http://other/b").unwrap(),
            "http://other/b"
        );
    }
}
