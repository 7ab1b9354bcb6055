use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use http::Version;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{Error, Kind, User};
use crate::host::Host;
use crate::limits::Limits;
use crate::net::WriteBuf;
use crate::packet::Packet;
use crate::queue::{Dir, Qid, Queue};
use crate::rx::{ChunkState, Rx};
use crate::service::{ConnWatch, Http};
use crate::session::Session;
use crate::trace::TraceFilter;
use crate::tx::{Chunking, Tx};

/// Connection lifecycle states. Transitions are monotonic: attempts to
/// regress are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    /// Allocated, not yet bound to a socket.
    Begin = 0,
    /// Socket attached; no bytes seen.
    Connected = 1,
    /// Request-line or status-line consumed.
    FirstLine = 2,
    /// Headers consumed; host and route matched; pipeline built.
    Parsed = 3,
    /// Request body being received.
    Content = 4,
    /// Request fully received; the handler may begin.
    Ready = 5,
    /// Handler invoked; output generation in progress.
    Running = 6,
    /// Unrecoverable failure; completes without further handler work.
    Error = 7,
    /// Response fully written; about to reset or be destroyed.
    Complete = 8,
}

/// Error disposition flags.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ErrorFlags {
    /// Disconnect the socket immediately, no graceful flush.
    pub abort: bool,
    /// Finish the current response, then close.
    pub close: bool,
}

impl ErrorFlags {
    pub(crate) fn abort() -> ErrorFlags {
        ErrorFlags {
            abort: true,
            close: false,
        }
    }

    pub(crate) fn close() -> ErrorFlags {
        ErrorFlags {
            abort: false,
            close: true,
        }
    }
}

/// Client-side authentication scratch captured from challenges.
#[derive(Debug, Default, Clone)]
pub(crate) struct ClientAuth {
    pub auth_type: Option<String>,
    pub realm: Option<String>,
    pub domain: Option<String>,
    pub nonce: Option<String>,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub cnonce: Option<String>,
    pub nc: u32,
}

/// The per-connection engine core: one socket's worth of protocol state.
///
/// The core owns the request (`Rx`), response (`Tx`), the pipeline queues
/// and the input stash. It is driven by [`Connection`] on the server and
/// by [`Client`](crate::Client) on the client side; all state is touched
/// only from the task the connection is bound to.
pub struct ConnCore {
    pub(crate) http: Http,
    pub(crate) server: bool,
    pub(crate) state: ConnState,
    pub(crate) limits: Arc<Limits>,
    pub(crate) trace: Arc<TraceFilter>,
    pub(crate) protocol: Version,
    pub(crate) secure: bool,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) hosts: Arc<Vec<Arc<Host>>>,
    pub(crate) host: Option<Arc<Host>>,
    pub(crate) rx: Option<Rx>,
    pub(crate) tx: Option<Tx>,
    pub(crate) queues: Vec<Queue>,
    pub(crate) serviceq: VecDeque<Qid>,
    pub(crate) rx_head: Option<Qid>,
    pub(crate) read_q: Option<Qid>,
    pub(crate) write_q: Option<Qid>,
    pub(crate) conn_q: Option<Qid>,
    pub(crate) input: Option<Packet>,
    pub(crate) write_buf: WriteBuf,
    pub(crate) write_complete: bool,
    pub(crate) error: bool,
    pub(crate) conn_error: bool,
    pub(crate) error_msg: Option<String>,
    pub(crate) keep_alive_count: i32,
    pub(crate) closing: bool,
    pub(crate) advancing: bool,
    pub(crate) request_started: Option<Instant>,
    pub(crate) watch: Arc<ConnWatch>,
    // Client side.
    pub(crate) client_auth: ClientAuth,
    pub(crate) sent_credentials: bool,
}

impl ConnCore {
    pub(crate) fn new(
        http: &Http,
        server: bool,
        hosts: Arc<Vec<Arc<Host>>>,
        limits: Arc<Limits>,
        watch: Arc<ConnWatch>,
    ) -> ConnCore {
        ConnCore {
            http: http.clone(),
            server,
            state: ConnState::Begin,
            limits,
            trace: http.trace_filter(),
            protocol: Version::HTTP_11,
            secure: false,
            peer_addr: None,
            local_addr: None,
            hosts,
            host: None,
            rx: None,
            tx: None,
            queues: Vec::new(),
            serviceq: VecDeque::new(),
            rx_head: None,
            read_q: None,
            write_q: None,
            conn_q: None,
            input: None,
            write_buf: WriteBuf::new(),
            write_complete: false,
            error: false,
            conn_error: false,
            error_msg: None,
            keep_alive_count: 0,
            closing: false,
            advancing: false,
            request_started: None,
            watch,
            client_auth: ClientAuth::default(),
            sent_credentials: false,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The parsed inbound state, once a message head has been seen.
    pub fn rx(&self) -> Option<&Rx> {
        self.rx.as_ref()
    }

    /// Mutable inbound state.
    pub fn rx_mut_opt(&mut self) -> Option<&mut Rx> {
        self.rx.as_mut()
    }

    /// The outbound state, once a request is in flight.
    pub fn tx(&self) -> Option<&Tx> {
        self.tx.as_ref()
    }

    /// Mutable outbound state.
    pub fn tx_mut_opt(&mut self) -> Option<&mut Tx> {
        self.tx.as_mut()
    }

    /// Whether this is the server end of the connection.
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// True when the connection is secured by TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The peer address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The local address, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The message recorded by the first error on this connection.
    pub fn error_msg(&self) -> Option<&str> {
        self.error_msg.as_deref()
    }

    pub(crate) fn rx_ref(&self) -> &Rx {
        self.rx.as_ref().expect("rx valid in this state")
    }

    pub(crate) fn rx_mut(&mut self) -> &mut Rx {
        self.rx.as_mut().expect("rx valid in this state")
    }

    pub(crate) fn tx_ref(&self) -> &Tx {
        self.tx.as_ref().expect("tx valid in this state")
    }

    pub(crate) fn tx_mut(&mut self) -> &mut Tx {
        self.tx.as_mut().expect("tx valid in this state")
    }

    /// Advance the state, never regressing.
    pub(crate) fn set_state(&mut self, state: ConnState) {
        if state <= self.state {
            return;
        }
        trace!(from = ?self.state, to = ?state, "state transition");
        if self.state <= ConnState::Connected && state > ConnState::Connected {
            // A request is now in flight.
            self.watch.set_active();
            self.request_started = Some(Instant::now());
        }
        self.state = state;
    }

    /// Append read bytes to the input stash.
    pub(crate) fn feed(&mut self, data: &[u8]) {
        match self.input {
            Some(ref mut packet) => packet.content_mut().extend_from_slice(data),
            None => self.input = Some(Packet::data_from(data)),
        }
        self.watch.touch();
    }

    /// The reentrancy-guarded advance loop: run state predicates while
    /// they report progress, then return to the event loop.
    pub(crate) fn process(&mut self) {
        if self.advancing {
            return;
        }
        self.advancing = true;
        let mut can_proceed = true;
        while can_proceed {
            trace!(state = ?self.state, error = self.error, "process");
            can_proceed = match self.state {
                ConnState::Begin | ConnState::Connected | ConnState::FirstLine => {
                    self.parse_incoming()
                }
                ConnState::Parsed => self.process_parsed(),
                ConnState::Content => self.process_content(),
                ConnState::Ready => self.process_ready(),
                ConnState::Running => self.process_running(),
                ConnState::Error => self.process_error(),
                ConnState::Complete => self.process_completion(),
            };
        }
        self.advancing = false;
    }

    fn process_parsed(&mut self) -> bool {
        if !self.rx_ref().start_after_content {
            self.start_pipeline();
        }
        self.set_state(ConnState::Content);
        true
    }

    fn process_content(&mut self) -> bool {
        if self.conn_error || self.rx_ref().remaining_content == 0 {
            return self.finish_content();
        }
        let available = self.input.as_ref().map_or(0, |p| p.len());
        if available == 0 {
            return false;
        }
        if !self.analyse_content() {
            return false;
        }
        let done = {
            let rx = self.rx_ref();
            self.conn_error
                || (rx.remaining_content == 0
                    && (!rx.chunked || rx.chunk_state == ChunkState::Eof))
        };
        if done {
            return self.finish_content();
        }
        self.service_queues();
        self.error || self.input.as_ref().map_or(0, |p| p.len()) > 0
    }

    fn finish_content(&mut self) -> bool {
        self.rx_mut().eof = true;
        if self.rx_ref().need_input_pipeline {
            if let Some(head) = self.rx_head {
                self.deliver(head, Packet::end());
            }
        }
        self.set_state(ConnState::Ready);
        true
    }

    /// Slice body bytes off the input stash and feed the inbound
    /// pipeline. Returns false when more data is needed.
    fn analyse_content(&mut self) -> bool {
        let mut packet = match self.input.take() {
            Some(packet) => packet,
            None => return false,
        };
        let chunked = self.rx_ref().chunked;
        let remaining = if chunked {
            match self.chunk_packet_size(&packet) {
                Ok(0) => {
                    if packet.len() > 0 {
                        self.input = Some(packet);
                    }
                    return false;
                }
                Ok(n) => n,
                Err(()) => return true,
            }
        } else {
            self.rx_ref().remaining_content
        };
        let nbytes = remaining.min(packet.len() as u64) as usize;
        debug_assert!(nbytes > 0);
        {
            let rx = self.rx_mut();
            rx.remaining_content = rx.remaining_content.saturating_sub(nbytes as u64);
            rx.bytes_read += nbytes as u64;
        }
        if self.rx_ref().bytes_read >= self.limits.receive_body_size {
            let msg = format!(
                "Request body of {} bytes is too big. Limit {}",
                self.rx_ref().bytes_read,
                self.limits.receive_body_size
            );
            self.error(413, ErrorFlags::close(), msg);
            return true;
        }
        // Bytes past this request (a pipelined next request, or the next
        // chunk) stay stashed.
        let leftover = if packet.len() > nbytes {
            Some(packet.split_at(nbytes))
        } else {
            None
        };
        self.input = leftover;
        let head = self.rx_head.expect("rx pipeline");
        self.deliver(head, packet);
        true
    }

    /// Compute how many input bytes the chunk filter can accept, so that
    /// packets never straddle a chunk-spec boundary.
    fn chunk_packet_size(&mut self, packet: &Packet) -> Result<u64, ()> {
        match self.rx_ref().chunk_state {
            ChunkState::Data => {
                let remaining = self.rx_ref().remaining_content;
                if remaining > 0 {
                    return Ok(remaining);
                }
            }
            ChunkState::Start => {}
            ChunkState::Eof => return Ok(0),
        }
        let buf = match packet.content() {
            Some(content) => &content[..],
            None => return Ok(0),
        };
        if buf.len() < 3 {
            return Ok(0);
        }
        if buf[0] != b'\r' || buf[1] != b'\n' {
            self.error(400, ErrorFlags::abort(), "Bad chunk specification");
            return Err(());
        }
        let nl = match memchr::memchr(b'\n', &buf[2..]) {
            Some(i) => 2 + i,
            None => {
                if buf.len() > 80 {
                    self.error(400, ErrorFlags::abort(), "Bad chunk specification");
                    return Err(());
                }
                return Ok(0);
            }
        };
        if nl < 3 || buf[nl - 1] != b'\r' {
            self.error(400, ErrorFlags::abort(), "Bad chunk specification");
            return Err(());
        }
        let size = match parse_chunk_hex(&buf[2..nl - 1]) {
            Some(size) => size,
            None => {
                self.error(400, ErrorFlags::abort(), "Bad chunk specification");
                return Err(());
            }
        };
        let mut need = (nl + 1) as u64;
        if size == 0 && buf.len() > nl + 2 && buf[nl + 1] == b'\r' && buf[nl + 2] == b'\n' {
            // Last chunk: take the trailing CRLF with it. Lenient when
            // the peer omits it.
            need += 2;
        }
        Ok(need)
    }

    fn process_ready(&mut self) -> bool {
        if self.server && self.rx_ref().form && !self.error {
            self.add_body_form_vars();
        }
        if self.rx_ref().start_after_content && !self.error {
            self.start_pipeline();
        }
        self.set_state(ConnState::Running);
        true
    }

    /// Decode a urlencoded request body into the form-variable map.
    fn add_body_form_vars(&mut self) {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_body() {
            body.extend_from_slice(&chunk);
            if body.len() as u64 > self.limits.receive_form_size {
                self.error(413, ErrorFlags::close(), "Form is too big");
                return;
            }
        }
        if !body.is_empty() {
            let encoded = String::from_utf8_lossy(&body).into_owned();
            let rx = self.rx_mut();
            crate::rx::add_form_vars(&mut rx.form_vars, &encoded);
        }
    }

    fn process_running(&mut self) -> bool {
        if self.conn_error {
            self.set_state(ConnState::Complete);
            return true;
        }
        if self.server {
            self.process_pipeline();
            if self.conn_error || self.write_complete {
                self.set_state(ConnState::Complete);
                true
            } else {
                self.service_queues()
            }
        } else {
            self.service_queues();
            self.finalize();
            self.set_state(ConnState::Complete);
            true
        }
    }

    fn process_error(&mut self) -> bool {
        if self.conn_error {
            self.set_state(ConnState::Complete);
            return true;
        }
        self.service_queues();
        if self.write_complete {
            self.set_state(ConnState::Complete);
            true
        } else {
            false
        }
    }

    fn process_completion(&mut self) -> bool {
        self.destroy_pipeline();
        if let (Some(started), Some(_)) =
            (self.request_started, self.trace.should_trace(Dir::Rx, crate::trace::TraceItem::Time, None))
        {
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "request complete");
        }
        if self.server {
            if self.error && self.rx.as_ref().map_or(false, |rx| rx.remaining_content > 0) {
                // The request failed with body bytes unread; the stream
                // position cannot be trusted for another request.
                self.input = None;
                self.keep_alive_count = 0;
            }
            let more = !self.conn_error && self.input.as_ref().map_or(0, |p| p.len()) > 0;
            let keep = !self.conn_error && self.keep_alive_count > 0;
            if keep {
                self.reset();
                return more;
            }
            self.closing = true;
            false
        } else {
            if self.keep_alive_count <= 0 || self.conn_error {
                self.closing = true;
            }
            false
        }
    }

    /// Reset for keep-alive reuse. The connection, not the request, owns
    /// the input stash, so pipelined bytes survive.
    pub(crate) fn reset(&mut self) {
        self.rx = None;
        self.tx = None;
        self.queues.clear();
        self.serviceq.clear();
        self.rx_head = None;
        self.read_q = None;
        self.write_q = None;
        self.conn_q = None;
        self.error = false;
        self.error_msg = None;
        self.write_complete = false;
        self.host = None;
        self.request_started = None;
        self.state = ConnState::Begin;
        self.watch.set_idle();
    }

    /// Report a request error.
    ///
    /// Sets the status and, when the headers are not yet on the wire,
    /// synthesizes an HTML error body via the pass handler; otherwise the
    /// socket is disconnected since the peer cannot be told the response
    /// was truncated.
    pub(crate) fn error(&mut self, status: u16, flags: ErrorFlags, msg: impl Into<String>) {
        let msg = msg.into();
        if flags.abort {
            self.conn_error = true;
        }
        if let Some(rx) = self.rx.as_mut() {
            rx.eof = true;
        }
        self.error = true;
        if self.error_msg.is_none() {
            debug!(status, %msg, "request error");
            self.error_msg = Some(msg.clone());
            if self.server {
                if let Some(tx) = self.tx.as_mut() {
                    tx.status = status;
                }
            } else if let Some(rx) = self.rx.as_mut() {
                rx.status = status;
            }
        }
        if flags.abort || flags.close {
            self.keep_alive_count = -1;
        }
        let headers_created = self.tx.as_ref().map_or(false, |tx| tx.headers_created);
        if flags.abort || headers_created {
            self.disconnect();
        } else if self.server {
            self.format_response_error(status, &msg);
        }
        self.set_state(ConnState::Error);
    }

    /// Public error entry for handlers: fail the current request.
    pub fn fail(&mut self, status: u16, msg: &str) {
        self.error(status, ErrorFlags::default(), msg.to_string());
    }

    /// Edge-triggered cancellation: the socket is closed and any
    /// in-flight service call observes the error at its next predicate.
    pub(crate) fn disconnect(&mut self) {
        self.conn_error = true;
        self.keep_alive_count = -1;
        if let Some(rx) = self.rx.as_mut() {
            rx.eof = true;
        }
    }

    fn format_response_error(&mut self, status: u16, msg: &str) {
        if self.rx.is_none() {
            self.rx = Some(Rx::new());
        }
        if self.tx.is_none() {
            self.tx = Some(Tx::new());
        }
        if self.write_q.is_none() {
            // Parse-time failure: no pipeline yet, emit via the pass
            // handler.
            let pass = self.http.pass_handler();
            self.tx_mut().handler = Some(pass);
            self.create_pipeline(None);
        }
        self.discard_transmit_data();
        self.tx_mut().set_response_body(status, msg);
        self.finalize();
    }

    /// Write body bytes into the handler's outgoing queue.
    ///
    /// Buffers into packets of the queue's preferred size; when the queue
    /// crosses its high watermark the pipeline is flushed cooperatively.
    pub fn write(&mut self, data: &[u8]) -> crate::Result<usize> {
        let wq = self.write_q.expect("pipeline open");
        if self.tx_ref().finalized {
            return Err(Error::new_user(User::WriteAfterFinalize));
        }
        let mut written = 0;
        let mut data = data;
        while !data.is_empty() {
            if self.state >= ConnState::Complete {
                return Err(Error::new(Kind::Io).with("connection completed"));
            }
            let packet_size = match self.tx_ref().chunk_size {
                Chunking::Size(n) if n > 0 => n,
                _ => self.queues[wq].packet_size,
            };
            let q = &mut self.queues[wq];
            let room = match q.last_mut() {
                Some(last) if last.is_data() && last.len() < packet_size => {
                    packet_size - last.len()
                }
                _ => 0,
            };
            let n = if room > 0 {
                let n = room.min(data.len());
                let last = q.last_mut().expect("last packet");
                last.content_mut().extend_from_slice(&data[..n]);
                q.count += n;
                n
            } else {
                let n = packet_size.min(data.len());
                q.push(Packet::data_from(&data[..n]));
                n
            };
            data = &data[n..];
            written += n;
        }
        if self.queues[wq].count >= self.queues[wq].max {
            self.flush_queue(wq);
        }
        if self.error {
            let status = self.tx_ref().status;
            let msg = self.error_msg.clone().unwrap_or_default();
            return Err(Error::new_status(status, &msg));
        }
        Ok(written)
    }

    /// Write a string body fragment.
    pub fn write_str(&mut self, data: &str) -> crate::Result<usize> {
        self.write(data.as_bytes())
    }

    /// Pre-declare `len` bytes of entity that the connector materializes
    /// from the designated send file
    /// ([`Tx::set_send_file`](crate::Tx::set_send_file)). The region is
    /// not buffered; the connector reads it in packet-size pieces as the
    /// socket drains.
    pub fn write_entity(&mut self, len: u64) -> crate::Result<()> {
        let wq = self.write_q.expect("pipeline open");
        if self.tx_ref().finalized {
            return Err(Error::new_user(User::WriteAfterFinalize));
        }
        self.tx_mut().set_entity_length(len);
        self.put_for_service(wq, Packet::entity(len), false);
        Ok(())
    }

    /// Flush buffered output toward the connector.
    pub fn flush(&mut self) {
        if let Some(wq) = self.write_q {
            self.flush_queue(wq);
        }
    }

    pub(crate) fn flush_queue(&mut self, q: Qid) {
        if self.queues[q].disabled {
            return;
        }
        self.schedule_queue(q);
        if let Some(next) = self.queues[q].next {
            if self.queues[next].count >= self.queues[next].max {
                self.schedule_queue(next);
            }
        }
        self.service_queues();
    }

    /// Signal that all output for this request has been generated.
    pub fn finalize(&mut self) {
        if self.tx.as_ref().map_or(true, |tx| tx.finalized) {
            return;
        }
        let wq = match self.write_q {
            Some(wq) => wq,
            None => return,
        };
        self.tx_mut().finalized = true;
        self.put_for_service(wq, Packet::end(), true);
        self.service_queues();
        if self.state == ConnState::Running && self.write_complete && !self.advancing {
            self.process();
        }
    }

    /// True once [`ConnCore::finalize`] has been called.
    pub fn is_finalized(&self) -> bool {
        self.tx.as_ref().map_or(false, |tx| tx.finalized)
    }

    /// Detach the next buffered chunk of request body, once the inbound
    /// pipeline has delivered it to the handler.
    pub fn read_body(&mut self) -> Option<Bytes> {
        let rq = self.read_q?;
        loop {
            let packet = self.take_packet(rq)?;
            if packet.is_end() {
                return None;
            }
            if packet.len() > 0 {
                let mut packet = packet;
                return Some(packet.content_mut().split().freeze());
            }
        }
    }

    /// The connector finished writing the response.
    pub(crate) fn complete_writing(&mut self) {
        self.write_complete = true;
    }

    /// Get or create the cookie-bound session for this request.
    pub fn session(&mut self, create: bool) -> Option<Session> {
        let id = self
            .rx
            .as_ref()
            .and_then(|rx| rx.cookie(crate::session::SESSION_COOKIE));
        match id {
            Some(id) => self.http.session(&id, self.limits.session_timeout),
            None if create => {
                let session = self.http.new_session(self.limits.session_timeout)?;
                let secure = self.secure;
                self.tx_mut().set_cookie(
                    crate::session::SESSION_COOKIE,
                    session.id(),
                    "/",
                    None,
                    None,
                    secure,
                );
                Some(session)
            }
            None => None,
        }
    }

    /// Handle end-of-input from the transport. Returns true when the
    /// driver should keep running.
    pub(crate) fn handle_eof(&mut self) -> bool {
        let idle = self.input.as_ref().map_or(0, |p| p.len()) == 0;
        if self.state <= ConnState::Connected && idle {
            self.closing = true;
            return false;
        }
        if self.state == ConnState::Content {
            let close_delimited = {
                let rx = self.rx_ref();
                !rx.chunked && rx.content_length.is_none() && rx.remaining_content > 0
            };
            if close_delimited {
                // An HTTP/1.0 body (or close-delimited response) ends
                // with the connection.
                self.rx_mut().remaining_content = 0;
                self.keep_alive_count = -1;
                self.process();
                return true;
            }
        }
        self.error(
            400,
            ErrorFlags::abort(),
            "Communications error: peer closed connection",
        );
        self.process();
        false
    }
}

fn parse_chunk_hex(buf: &[u8]) -> Option<u64> {
    let mut size: u64 = 0;
    let mut digits = 0;
    for &b in buf {
        let value = match b {
            b'0'..=b'9' => (b - b'0') as u64,
            b'a'..=b'f' => (b - b'a' + 10) as u64,
            b'A'..=b'F' => (b - b'A' + 10) as u64,
            // Extensions and whitespace end the size.
            _ => break,
        };
        size = size.checked_mul(16)?.checked_add(value)?;
        digits += 1;
    }
    if digits == 0 {
        None
    } else {
        Some(size)
    }
}

/// A server connection bound to one transport and one task.
///
/// Created by [`Endpoint`](crate::Endpoint) on accept, or directly over
/// any `AsyncRead + AsyncWrite` transport for embedding and tests.
pub struct Connection<T> {
    io: T,
    read_buf: BytesMut,
    pub(crate) core: ConnCore,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a server connection over `io` serving `hosts`.
    pub fn server(http: &Http, io: T, hosts: Vec<Host>) -> Connection<T> {
        let hosts = Arc::new(hosts.into_iter().map(Arc::new).collect::<Vec<_>>());
        Connection::server_shared(http, io, hosts, http.server_limits(), false, None, None)
    }

    pub(crate) fn server_shared(
        http: &Http,
        io: T,
        hosts: Arc<Vec<Arc<Host>>>,
        limits: Arc<Limits>,
        secure: bool,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Connection<T> {
        let watch = http.add_conn(&limits);
        let mut core = ConnCore::new(http, true, hosts, limits, watch);
        core.secure = secure;
        core.peer_addr = peer_addr;
        core.local_addr = local_addr;
        core.keep_alive_count = core.limits.keep_alive_count;
        core.state = ConnState::Connected;
        Connection {
            io,
            read_buf: BytesMut::with_capacity(8 * 1024),
            core,
        }
    }

    /// Access the connection core.
    pub fn core(&mut self) -> &mut ConnCore {
        &mut self.core
    }

    /// Drive the connection until it is closed.
    ///
    /// Reads feed the state machine, the state machine feeds the
    /// pipeline, and staged connector output is flushed with vectored
    /// writes. Returns after the connection is complete and not
    /// keep-alive reusable, or on a fatal transport error.
    pub async fn drive(mut self) -> crate::Result<()> {
        let result = self.drive_inner().await;
        let watch = self.core.watch.clone();
        self.core.http.remove_conn(&watch);
        result
    }

    async fn drive_inner(&mut self) -> crate::Result<()> {
        // The connection state is Connected; the first read event below
        // delivers the first input packet.
        loop {
            self.core.process();
            self.core.service_queues();
            self.flush_output().await?;
            if self.core.resume_connector() {
                continue;
            }
            if self.core.closing || self.core.conn_error {
                break;
            }
            // Blocked on input: read, or time out.
            let watch = self.core.watch.clone();
            self.read_buf.reserve(8 * 1024);
            let n = tokio::select! {
                r = self.io.read_buf(&mut self.read_buf) => r?,
                _ = watch.expired() => {
                    // A stale permit from before a keep-alive reset is
                    // not a timeout.
                    if watch.confirm_expired() {
                        let msg = watch.timeout_reason();
                        self.core.error(408, ErrorFlags::close(), msg);
                    }
                    continue;
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
        // Graceful close unless the connection was aborted mid-flush.
        let _ = self.flush_output().await;
        let _ = self.io.shutdown().await;
        Ok(())
    }

    async fn flush_output(&mut self) -> crate::Result<()> {
        let io = &mut self.io;
        let write_buf = &mut self.core.write_buf;
        while write_buf.has_remaining() {
            let n = futures_util::future::poll_fn(|cx| {
                let slices = write_buf.io_slices();
                std::pin::Pin::new(&mut *io).poll_write_vectored(cx, &slices)
            })
            .await?;
            if n == 0 {
                return Err(Error::new_io(std::io::ErrorKind::WriteZero.into()));
            }
            trace!(bytes = n, "flushed");
            write_buf.advance(n);
        }
        io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(ConnState::Begin < ConnState::Connected);
        assert!(ConnState::Parsed < ConnState::Content);
        assert!(ConnState::Running < ConnState::Error);
        assert!(ConnState::Error < ConnState::Complete);
    }

    #[test]
    fn chunk_hex() {
        assert_eq!(parse_chunk_hex(b"0"), Some(0));
        assert_eq!(parse_chunk_hex(b"a"), Some(10));
        assert_eq!(parse_chunk_hex(b"Ff"), Some(255));
        assert_eq!(parse_chunk_hex(b"10; ext=1"), Some(16));
        assert_eq!(parse_chunk_hex(b"x"), None);
        assert_eq!(parse_chunk_hex(b"fffffffffffffffff"), None);
    }
}
