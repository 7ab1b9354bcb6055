use std::fmt;

use crate::conn::ConnCore;
use crate::packet::Packet;
use crate::pipeline;
use crate::queue::{Dir, Qid};

/// Stage names are static: stages are registered once and shared.
pub type StageName = &'static str;

/// The three stage roles in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Produces the response (or consumes the request) for a route.
    Handler,
    /// Transforms packets flowing through the pipeline.
    Filter,
    /// The I/O terminus of a pipeline.
    Connector,
}

/// Set of HTTP methods a stage accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSet(u16);

impl MethodSet {
    /// The GET method.
    pub const GET: MethodSet = MethodSet(1 << 0);
    /// The HEAD method.
    pub const HEAD: MethodSet = MethodSet(1 << 1);
    /// The POST method.
    pub const POST: MethodSet = MethodSet(1 << 2);
    /// The PUT method.
    pub const PUT: MethodSet = MethodSet(1 << 3);
    /// The DELETE method.
    pub const DELETE: MethodSet = MethodSet(1 << 4);
    /// The OPTIONS method.
    pub const OPTIONS: MethodSet = MethodSet(1 << 5);
    /// The TRACE method.
    pub const TRACE: MethodSet = MethodSet(1 << 6);
    /// Methods not otherwise recognized.
    pub const UNKNOWN: MethodSet = MethodSet(1 << 7);

    /// The empty set.
    pub fn empty() -> MethodSet {
        MethodSet(0)
    }

    /// Every method, including unknown ones.
    pub fn all() -> MethodSet {
        MethodSet(u16::MAX)
    }

    /// Union with another set.
    pub fn with(self, other: MethodSet) -> MethodSet {
        MethodSet(self.0 | other.0)
    }

    /// True when `other` is contained in this set.
    pub fn contains(self, other: MethodSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// The set bit for a method token.
    pub fn from_token(token: &str) -> MethodSet {
        match token {
            "GET" => MethodSet::GET,
            "HEAD" => MethodSet::HEAD,
            "POST" => MethodSet::POST,
            "PUT" => MethodSet::PUT,
            "DELETE" => MethodSet::DELETE,
            "OPTIONS" => MethodSet::OPTIONS,
            "TRACE" => MethodSet::TRACE,
            _ => MethodSet::UNKNOWN,
        }
    }

    pub(crate) fn allow_tokens(self, trace_enabled: bool) -> String {
        let mut allow = String::from("OPTIONS");
        if trace_enabled {
            allow.push_str(",TRACE");
        }
        for (set, token) in [
            (MethodSet::GET, ",GET"),
            (MethodSet::HEAD, ",HEAD"),
            (MethodSet::POST, ",POST"),
            (MethodSet::PUT, ",PUT"),
            (MethodSet::DELETE, ",DELETE"),
        ] {
            if self.contains(set) {
                allow.push_str(token);
            }
        }
        allow
    }
}

/// A polymorphic pipeline processing unit.
///
/// Stages are immutable after registration and shared by every
/// connection; per-request state belongs on the queue
/// ([`Queue::set_stage_data`](crate::Queue::set_stage_data)). All
/// callbacks receive the connection core by exclusive reference and must
/// not retain references across calls.
///
/// The default callback bodies give a stage the standard pass-through
/// behavior: incoming packets are forwarded to the next queue (or
/// buffered at the handler), outgoing packets are queued for service, and
/// the outgoing service drains packets downstream respecting the next
/// queue's room.
pub trait Stage: Send + Sync {
    /// Registered stage name.
    fn name(&self) -> StageName;

    /// Which role this stage plays.
    fn kind(&self) -> StageKind;

    /// Methods the stage accepts. Informs routing and the OPTIONS reply.
    fn methods(&self) -> MethodSet {
        MethodSet::all()
    }

    /// Whether this stage belongs in the pipeline being assembled.
    fn matches(&self, _core: &ConnCore, _dir: Dir) -> bool {
        true
    }

    /// Handlers returning true are started only after the request body
    /// has been fully received.
    fn start_after_content(&self) -> bool {
        false
    }

    /// Handlers returning true get query variables decoded into the
    /// form-variable map before start.
    fn wants_query_vars(&self) -> bool {
        false
    }

    /// Handlers returning true get the CGI-style variable surface
    /// populated before start.
    fn wants_cgi_vars(&self) -> bool {
        false
    }

    /// Called once per request after the pipeline is assembled.
    fn open(&self, _core: &mut ConnCore, _q: Qid) {}

    /// Called when the request reaches the parsed state (or after the
    /// body, for `start_after_content` handlers the `process` callback is
    /// used instead).
    fn start(&self, _core: &mut ConnCore, _q: Qid) {}

    /// Called once the request body has been fully received.
    fn process(&self, _core: &mut ConnCore, _q: Qid) {}

    /// Accept an inbound packet.
    fn incoming(&self, core: &mut ConnCore, q: Qid, packet: Packet) {
        pipeline::default_incoming(core, q, packet);
    }

    /// Drain buffered inbound packets.
    fn incoming_service(&self, _core: &mut ConnCore, _q: Qid) {}

    /// Accept an outbound packet.
    fn outgoing(&self, core: &mut ConnCore, q: Qid, packet: Packet) {
        core.put_for_service(q, packet, true);
    }

    /// Drain buffered outbound packets toward the connector.
    fn outgoing_service(&self, core: &mut ConnCore, q: Qid) {
        pipeline::default_outgoing_service(core, q);
    }

    /// Pipeline teardown.
    fn close(&self, _core: &mut ConnCore, _q: Qid) {}
}

impl fmt::Debug for dyn Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_set_ops() {
        let set = MethodSet::GET.with(MethodSet::HEAD);
        assert!(set.contains(MethodSet::GET));
        assert!(!set.contains(MethodSet::POST));
        assert!(MethodSet::all().contains(MethodSet::UNKNOWN));
        assert_eq!(MethodSet::from_token("PATCH"), MethodSet::UNKNOWN);
    }

    #[test]
    fn allow_header_tokens() {
        let set = MethodSet::GET.with(MethodSet::POST);
        assert_eq!(set.allow_tokens(false), "OPTIONS,GET,POST");
        assert_eq!(set.allow_tokens(true), "OPTIONS,TRACE,GET,POST");
    }
}
