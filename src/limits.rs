use std::time::Duration;

/// Resource limits applied per endpoint or per connection.
///
/// Server defaults are conservative; clients start from [`Limits::client`]
/// which eases the body ceilings.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum size of the request or response head.
    pub header_size: usize,
    /// Maximum number of headers in a message head.
    pub header_count: usize,
    /// Maximum chunk size used when chunking output.
    pub chunk_size: usize,
    /// Preferred packet size and per-queue buffer budget.
    pub stage_buffer_size: usize,
    /// Maximum acceptable request body size.
    pub receive_body_size: u64,
    /// Maximum acceptable urlencoded form size.
    pub receive_form_size: u64,
    /// Maximum transmitted body size.
    pub transmit_body_size: u64,
    /// Maximum accepted size of any single uploaded file.
    pub upload_size: u64,
    /// Maximum length of a request URI.
    pub uri_size: usize,
    /// Requests a connection may carry before being closed (keep-alive).
    pub keep_alive_count: i32,
    /// Maximum concurrently connected clients per endpoint.
    pub client_count: usize,
    /// Maximum concurrently active requests.
    pub request_count: usize,
    /// Maximum concurrent requests from a single client IP.
    pub requests_per_client: usize,
    /// Maximum live sessions.
    pub session_count: usize,
    /// Connection inactivity timeout.
    pub inactivity_timeout: Duration,
    /// Whole-request duration timeout. `None` means unbounded.
    pub request_timeout: Option<Duration>,
    /// Session entry lifetime.
    pub session_timeout: Duration,
    /// Whether the TRACE method is allowed.
    pub enable_trace_method: bool,
}

impl Limits {
    /// Server-side defaults.
    pub fn server() -> Limits {
        Limits {
            header_size: 32 * 1024,
            header_count: 64,
            chunk_size: 8 * 1024,
            stage_buffer_size: 64 * 1024,
            receive_body_size: 128 * 1024 * 1024,
            receive_form_size: 16 * 1024 * 1024,
            transmit_body_size: u64::MAX,
            upload_size: 128 * 1024 * 1024,
            uri_size: 4096,
            keep_alive_count: 100,
            client_count: 256,
            request_count: 256,
            requests_per_client: 32,
            session_count: 512,
            inactivity_timeout: Duration::from_secs(60),
            request_timeout: None,
            session_timeout: Duration::from_secs(3600),
            enable_trace_method: false,
        }
    }

    /// Client-side defaults: the server profile with eased body ceilings.
    pub fn client() -> Limits {
        let mut limits = Limits::server();
        limits.ease();
        limits
    }

    /// Relax the body size limits. Used by clients and trusted embedders.
    pub fn ease(&mut self) {
        self.receive_body_size = u64::MAX;
        self.receive_form_size = u64::MAX;
        self.transmit_body_size = u64::MAX;
        self.upload_size = u64::MAX;
    }
}

impl Default for Limits {
    fn default() -> Limits {
        Limits::server()
    }
}
