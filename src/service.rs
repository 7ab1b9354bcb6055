use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::filter::{ChunkFilter, RangeFilter, UploadFilter};
use crate::handler::PassHandler;
use crate::limits::Limits;
use crate::net::NetConnector;
use crate::session::{make_session_id, Cache, MemoryCache, Session};
use crate::stage::Stage;
use crate::trace::TraceFilter;

const SOFTWARE: &str = concat!("weir/", env!("CARGO_PKG_VERSION"));

/// Period of the connection timeout sweep while connections are active.
const TIMER_PERIOD: Duration = Duration::from_secs(1);

/// The process-wide engine service.
///
/// Owns the stage registry, the default stages, the shared secret used
/// for digest nonces, the session cache and the connection list swept by
/// the timeout timer. Create one per process (or per isolated engine)
/// and pass the handle to endpoints, clients and connections; the handle
/// is cheap to clone.
#[derive(Clone)]
pub struct Http {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    stages: Mutex<Vec<Arc<dyn Stage>>>,
    pass: Arc<dyn Stage>,
    net: Arc<dyn Stage>,
    chunk: Arc<dyn Stage>,
    range: Arc<dyn Stage>,
    upload: Arc<dyn Stage>,
    secret: String,
    server_limits: Arc<Limits>,
    client_limits: Arc<Limits>,
    trace: Arc<TraceFilter>,
    session_cache: Arc<dyn Cache>,
    session_counter: Arc<()>,
    nonce_counter: AtomicU64,
    conns: Mutex<Vec<Arc<ConnWatch>>>,
    sweeping: AtomicBool,
}

impl Http {
    /// Create an engine service with default limits, a process secret
    /// and an in-memory session cache.
    pub fn new() -> Http {
        Http::with_limits(Limits::server())
    }

    /// Create an engine service with explicit server limits.
    pub fn with_limits(limits: Limits) -> Http {
        let pass: Arc<dyn Stage> = Arc::new(PassHandler);
        let net: Arc<dyn Stage> = Arc::new(NetConnector);
        let chunk: Arc<dyn Stage> = Arc::new(ChunkFilter);
        let range: Arc<dyn Stage> = Arc::new(RangeFilter);
        let upload: Arc<dyn Stage> = Arc::new(UploadFilter);
        let stages = vec![
            pass.clone(),
            net.clone(),
            chunk.clone(),
            range.clone(),
            upload.clone(),
        ];
        Http {
            inner: Arc::new(HttpInner {
                stages: Mutex::new(stages),
                pass,
                net,
                chunk,
                range,
                upload,
                secret: create_secret(),
                server_limits: Arc::new(limits),
                client_limits: Arc::new(Limits::client()),
                trace: Arc::new(TraceFilter::default()),
                session_cache: Arc::new(MemoryCache::new()),
                session_counter: Arc::new(()),
                nonce_counter: AtomicU64::new(0),
                conns: Mutex::new(Vec::new()),
                sweeping: AtomicBool::new(false),
            }),
        }
    }

    /// The server software identifier sent in `Server` headers.
    pub fn software(&self) -> &str {
        SOFTWARE
    }

    /// Register a custom stage.
    pub fn add_stage(&self, stage: Arc<dyn Stage>) {
        self.inner.stages.lock().expect("stage registry").push(stage);
    }

    /// Look up a registered stage by name.
    pub fn stage(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.inner
            .stages
            .lock()
            .expect("stage registry")
            .iter()
            .find(|stage| stage.name() == name)
            .cloned()
    }

    /// The pass handler: serves error bodies and unrouted requests.
    pub fn pass_handler(&self) -> Arc<dyn Stage> {
        self.inner.pass.clone()
    }

    /// The network connector stage.
    pub fn net_connector(&self) -> Arc<dyn Stage> {
        self.inner.net.clone()
    }

    /// The chunked transfer-encoding filter.
    pub fn chunk_filter(&self) -> Arc<dyn Stage> {
        self.inner.chunk.clone()
    }

    /// The ranged-response filter.
    pub fn range_filter(&self) -> Arc<dyn Stage> {
        self.inner.range.clone()
    }

    /// The multipart upload filter.
    pub fn upload_filter(&self) -> Arc<dyn Stage> {
        self.inner.upload.clone()
    }

    /// Default outbound filter chain: range, then chunk nearest the
    /// connector.
    pub fn default_output_filters(&self) -> Vec<Arc<dyn Stage>> {
        vec![self.inner.range.clone(), self.inner.chunk.clone()]
    }

    /// Default inbound filter chain: chunk decode, then upload decode.
    pub fn default_input_filters(&self) -> Vec<Arc<dyn Stage>> {
        vec![self.inner.chunk.clone(), self.inner.upload.clone()]
    }

    /// The process-wide secret used to mint digest nonces.
    pub(crate) fn secret(&self) -> &str {
        &self.inner.secret
    }

    pub(crate) fn next_nonce(&self) -> u64 {
        self.inner.nonce_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn server_limits(&self) -> Arc<Limits> {
        self.inner.server_limits.clone()
    }

    pub(crate) fn client_limits(&self) -> Arc<Limits> {
        self.inner.client_limits.clone()
    }

    pub(crate) fn trace_filter(&self) -> Arc<TraceFilter> {
        self.inner.trace.clone()
    }

    /// Open an existing session by id.
    pub(crate) fn session(&self, id: &str, ttl: Duration) -> Option<Session> {
        Some(Session::new(
            id.to_string(),
            ttl,
            self.inner.session_cache.clone(),
            self.inner.session_counter.clone(),
        ))
    }

    /// Allocate a new session, enforcing the live-session limit.
    pub(crate) fn new_session(&self, ttl: Duration) -> Option<Session> {
        let session = Session::new(
            make_session_id(),
            ttl,
            self.inner.session_cache.clone(),
            self.inner.session_counter.clone(),
        );
        if session.live_count() - 1 > self.inner.server_limits.session_count {
            debug!("session limit reached");
            return None;
        }
        Some(session)
    }

    /// Register a connection with the timeout sweep. Starts the sweep
    /// timer when this is the first active connection.
    pub(crate) fn add_conn(&self, limits: &Arc<Limits>) -> Arc<ConnWatch> {
        let watch = Arc::new(ConnWatch::new(limits));
        self.inner.conns.lock().expect("conn list").push(watch.clone());
        if !self.inner.sweeping.swap(true, Ordering::SeqCst) {
            let inner = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TIMER_PERIOD);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let inner = match inner.upgrade() {
                        Some(inner) => inner,
                        None => break,
                    };
                    let conns = inner.conns.lock().expect("conn list");
                    if conns.is_empty() {
                        // Self-disable until the next connection.
                        inner.sweeping.store(false, Ordering::SeqCst);
                        break;
                    }
                    for watch in conns.iter() {
                        watch.sweep();
                    }
                }
                trace!("timeout sweep idle");
            });
        }
        watch
    }

    /// Drop a connection from the sweep list.
    pub(crate) fn remove_conn(&self, watch: &Arc<ConnWatch>) {
        let mut conns = self.inner.conns.lock().expect("conn list");
        conns.retain(|w| !Arc::ptr_eq(w, watch));
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().expect("conn list").len()
    }
}

impl Default for Http {
    fn default() -> Http {
        Http::new()
    }
}

impl std::fmt::Debug for Http {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http")
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn create_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    let mut secret = String::with_capacity(64);
    for b in bytes {
        secret.push_str(&format!("{:02x}", b));
    }
    secret
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Timeout bookkeeping shared between a connection and the sweep timer.
///
/// The sweep never touches connection state: on expiry it notifies the
/// connection's own task, which fails the request with 408.
pub(crate) struct ConnWatch {
    last_activity: AtomicU64,
    request_start: AtomicU64,
    active: AtomicBool,
    inactivity_ms: u64,
    request_ms: u64,
    expired: Notify,
    expired_kind: AtomicU64,
}

const EXPIRE_NONE: u64 = 0;
const EXPIRE_INACTIVITY: u64 = 1;
const EXPIRE_REQUEST: u64 = 2;

impl ConnWatch {
    fn new(limits: &Arc<Limits>) -> ConnWatch {
        ConnWatch {
            last_activity: AtomicU64::new(now_ms()),
            request_start: AtomicU64::new(0),
            active: AtomicBool::new(false),
            inactivity_ms: limits.inactivity_timeout.as_millis() as u64,
            request_ms: limits
                .request_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(0),
            expired: Notify::new(),
            expired_kind: AtomicU64::new(EXPIRE_NONE),
        }
    }

    pub(crate) fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn set_active(&self) {
        self.request_start.store(now_ms(), Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_idle(&self) {
        self.active.store(false, Ordering::Relaxed);
        self.touch();
    }

    /// Called by the sweep timer; never touches connection state. On
    /// expiry the connection's own task is notified and fails the
    /// request itself.
    fn sweep(&self) {
        match self.check_expired() {
            EXPIRE_NONE => {}
            kind => {
                self.expired_kind.store(kind, Ordering::Relaxed);
                self.expired.notify_one();
            }
        }
    }

    fn check_expired(&self) -> u64 {
        let now = now_ms();
        let idle = now.saturating_sub(self.last_activity.load(Ordering::Relaxed));
        if self.inactivity_ms > 0 && idle > self.inactivity_ms {
            return EXPIRE_INACTIVITY;
        }
        // The whole-request timeout only applies while a request is in
        // flight.
        if self.request_ms > 0 && self.active.load(Ordering::Relaxed) {
            let elapsed = now.saturating_sub(self.request_start.load(Ordering::Relaxed));
            if elapsed > self.request_ms {
                return EXPIRE_REQUEST;
            }
        }
        EXPIRE_NONE
    }

    /// Re-verify expiry from the connection task; a permit left over
    /// from before a reset is stale.
    pub(crate) fn confirm_expired(&self) -> bool {
        self.check_expired() != EXPIRE_NONE
    }

    /// Resolves when the sweep expires this connection.
    pub(crate) async fn expired(&self) {
        self.expired.notified().await
    }

    pub(crate) fn timeout_reason(&self) -> String {
        match self.expired_kind.load(Ordering::Relaxed) {
            EXPIRE_REQUEST => format!(
                "Exceeded timeout of {} ms for the whole request",
                self.request_ms
            ),
            _ => format!("Exceeded inactivity timeout of {} ms", self.inactivity_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_random() {
        let a = create_secret();
        let b = create_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn stage_registry_lookup() {
        let http = Http::new();
        assert!(http.stage("chunk").is_some());
        assert!(http.stage("pass").is_some());
        assert!(http.stage("nope").is_none());
    }

    #[test]
    fn watch_sweep_detects_inactivity() {
        let mut limits = Limits::server();
        limits.inactivity_timeout = Duration::from_millis(0);
        let watch = ConnWatch::new(&Arc::new(limits));
        // Inactivity of zero disables the check.
        watch.set_active();
        watch.sweep();
        assert_eq!(watch.expired_kind.load(Ordering::Relaxed), EXPIRE_NONE);

        let mut limits = Limits::server();
        limits.inactivity_timeout = Duration::from_millis(1);
        let watch = ConnWatch::new(&Arc::new(limits));
        watch.set_active();
        watch
            .last_activity
            .store(now_ms().saturating_sub(10_000), Ordering::Relaxed);
        watch.sweep();
        assert_eq!(watch.expired_kind.load(Ordering::Relaxed), EXPIRE_INACTIVITY);
    }
}
