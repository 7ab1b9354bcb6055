use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::conn::Connection;
use crate::error::Error;
use crate::host::Host;
use crate::limits::Limits;
use crate::service::Http;

/// Object-safe transport bound: anything readable and writable.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// A type-erased transport, as produced by a [`TlsProvider`].
pub type BoxedTransport = Box<dyn Transport>;

/// Opaque TLS capability for a secure endpoint.
///
/// The engine does not integrate a TLS stack; a provider wraps each
/// accepted socket and returns the secured transport.
pub trait TlsProvider: Send + Sync + 'static {
    /// Perform the server-side handshake over an accepted socket.
    fn accept(
        &self,
        io: TcpStream,
    ) -> Pin<Box<dyn Future<Output = io::Result<BoxedTransport>> + Send>>;
}

/// A listener bound to an address, serving a set of virtual hosts.
pub struct Endpoint {
    http: Http,
    addr: SocketAddr,
    hosts: Vec<Arc<Host>>,
    limits: Arc<Limits>,
    tls: Option<Arc<dyn TlsProvider>>,
}

impl Endpoint {
    /// Create an endpoint bound to `addr` once started.
    pub fn new(http: &Http, addr: SocketAddr) -> Endpoint {
        Endpoint {
            http: http.clone(),
            addr,
            hosts: Vec::new(),
            limits: http.server_limits(),
            tls: None,
        }
    }

    /// Add a virtual host. The first host is the fallback when no name
    /// matches.
    pub fn add_host(&mut self, host: Host) {
        self.hosts.push(Arc::new(host));
    }

    /// Override the endpoint limits.
    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = Arc::new(limits);
    }

    /// Secure this endpoint with a TLS provider.
    pub fn set_tls(&mut self, provider: Arc<dyn TlsProvider>) {
        self.tls = Some(provider);
    }

    /// Bind the listen socket and start accepting connections.
    pub async fn start(self) -> crate::Result<EndpointHandle> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(Error::new_listen)?;
        let local_addr = listener.local_addr().map_err(Error::new_listen)?;
        debug!(%local_addr, secure = self.tls.is_some(), "endpoint listening");

        let shutdown = Arc::new(Notify::new());
        let accept_shutdown = shutdown.clone();
        let http = self.http.clone();
        let hosts = Arc::new(self.hosts);
        let limits = self.limits.clone();
        let tls = self.tls.clone();
        let client_loads: Arc<Mutex<HashMap<IpAddr, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let client_count = Arc::new(AtomicUsize::new(0));

        let join = tokio::spawn(async move {
            loop {
                let (socket, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    },
                    _ = accept_shutdown.notified() => break,
                };
                if !admit(&client_count, &client_loads, peer, &limits) {
                    // Over the concurrency limits; shed the connection.
                    drop(socket);
                    continue;
                }
                let http = http.clone();
                let hosts = hosts.clone();
                let limits = limits.clone();
                let tls = tls.clone();
                let client_loads = client_loads.clone();
                let client_count = client_count.clone();
                tokio::spawn(async move {
                    let local = socket.local_addr().ok();
                    let secure = tls.is_some();
                    let io: io::Result<BoxedTransport> = match tls {
                        Some(provider) => provider.accept(socket).await,
                        None => Ok(Box::new(socket)),
                    };
                    match io {
                        Ok(io) => {
                            let conn = Connection::server_shared(
                                &http,
                                io,
                                hosts,
                                limits,
                                secure,
                                Some(peer),
                                local,
                            );
                            if let Err(e) = conn.drive().await {
                                debug!(error = %e, %peer, "connection ended with error");
                            }
                        }
                        Err(e) => debug!(error = %e, %peer, "tls accept failed"),
                    }
                    release(&client_count, &client_loads, peer);
                });
            }
            debug!("endpoint stopped");
        });

        Ok(EndpointHandle {
            local_addr,
            shutdown,
            join,
        })
    }
}

fn admit(
    count: &AtomicUsize,
    loads: &Mutex<HashMap<IpAddr, usize>>,
    peer: SocketAddr,
    limits: &Limits,
) -> bool {
    if count.load(Ordering::Relaxed) >= limits.client_count {
        warn!(%peer, "too many concurrent clients");
        return false;
    }
    let mut loads = loads.lock().expect("client loads");
    let entry = loads.entry(peer.ip()).or_insert(0);
    if *entry >= limits.requests_per_client {
        warn!(ip = %peer.ip(), "too many connections from client");
        return false;
    }
    *entry += 1;
    count.fetch_add(1, Ordering::Relaxed);
    true
}

fn release(count: &AtomicUsize, loads: &Mutex<HashMap<IpAddr, usize>>, peer: SocketAddr) {
    count.fetch_sub(1, Ordering::Relaxed);
    let mut loads = loads.lock().expect("client loads");
    if let Some(entry) = loads.get_mut(&peer.ip()) {
        *entry -= 1;
        if *entry == 0 {
            loads.remove(&peer.ip());
        }
    }
}

/// A started endpoint: its bound address and stop control.
pub struct EndpointHandle {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl EndpointHandle {
    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting: the listen socket closes; active connections
    /// drain on their own tasks.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Wait for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}
