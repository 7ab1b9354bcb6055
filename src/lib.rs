//! # weir
//!
//! weir is an embeddable HTTP/1.0 and HTTP/1.1 protocol engine for both
//! server-side request handling and client-side request issuance over a
//! shared transport abstraction.
//!
//! The engine is organized around four subsystems:
//!
//! - A per-connection request/response **state machine** that drives a
//!   connection from accept (or connect) through header parsing, body
//!   transfer, handler execution and completion or keep-alive reuse.
//! - A **pipeline of stages** (handler, bidirectional filter chain and
//!   connector) that request and response data flows through, with
//!   back-pressure aware packet queues.
//! - An **HTTP/1.x wire codec**: request-line and status-line parsing,
//!   header folding, chunked transfer-encoding framing, ranged responses
//!   and multipart/form-data upload decoding.
//! - **Authentication** challenge and verification for HTTP Basic and
//!   Digest (RFC 2617), including the nonce lifecycle.
//!
//! weir is a lower-level building block: application handlers (files, CGI,
//! proxies, script runtimes) plug in through the [`Stage`] contract and are
//! not part of this crate.
//!
//! ## Example
//!
//! ```no_run
//! use weir::{Endpoint, Host, Http, Route};
//!
//! # async fn run() -> weir::Result<()> {
//! let http = Http::new();
//! let mut host = Host::new("*");
//! host.add_route(Route::new("default").handler(http.pass_handler()).build()?);
//!
//! let mut endpoint = Endpoint::new(&http, "127.0.0.1:8080".parse().unwrap());
//! endpoint.add_host(host);
//! let handle = endpoint.start().await?;
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```

#[doc(no_inline)]
pub use http::{Method, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};

pub mod auth;
mod client;
mod conn;
mod endpoint;
mod error;
pub mod filter;
pub mod handler;
mod headers;
mod host;
mod limits;
mod net;
mod packet;
mod pipeline;
mod queue;
mod route;
mod rx;
mod service;
mod session;
mod stage;
mod trace;
mod tx;
mod vars;

pub use crate::client::{Client, ClientResponse};
pub use crate::conn::{ConnCore, ConnState, Connection};
pub use crate::endpoint::{BoxedTransport, Endpoint, EndpointHandle, TlsProvider, Transport};
pub use crate::headers::HeaderMap;
pub use crate::host::Host;
pub use crate::limits::Limits;
pub use crate::packet::{Packet, PacketKind};
pub use crate::queue::{Dir, Qid, Queue};
pub use crate::route::{Route, RouteBuilder, RouteMatch};
pub use crate::rx::{RangeSpec, Rx, UploadFile};
pub use crate::service::Http;
pub use crate::session::{Cache, MemoryCache, Session, SESSION_COOKIE};
pub use crate::stage::{MethodSet, Stage, StageKind};
pub use crate::trace::{TraceFilter, TraceItem};
pub use crate::tx::{Chunking, Tx};
