use tracing::trace;

use crate::conn::ConnCore;
use crate::queue::Qid;
use crate::stage::{MethodSet, Stage, StageKind, StageName};

/// Pass-through handler.
///
/// Relays content to the connector unchanged. It serves requests with no
/// configured handler, conveys synthesized error bodies when a request
/// fails before or instead of its handler, and answers OPTIONS and TRACE.
pub struct PassHandler;

impl Stage for PassHandler {
    fn name(&self) -> StageName {
        "pass"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn start(&self, core: &mut ConnCore, _q: Qid) {
        trace!("start pass handler");
        let rx = match core.rx() {
            Some(rx) => rx,
            None => return,
        };
        if rx.method_set.contains(MethodSet::OPTIONS)
            || rx.method_set.contains(MethodSet::TRACE)
        {
            core.handle_options_trace();
        }
    }

    fn process(&self, core: &mut ConnCore, _q: Qid) {
        core.finalize();
    }
}

impl ConnCore {
    /// Answer OPTIONS and TRACE requests.
    ///
    /// Handlers may do this themselves; typically all such requests come
    /// through here. TRACE is disabled unless the limits enable it.
    pub fn handle_options_trace(&mut self) {
        let method_set = self.rx_ref().method_set;
        if method_set.contains(MethodSet::TRACE) {
            if !self.limits.enable_trace_method {
                let tx = self.tx_mut();
                tx.status = 406;
                tx.format_body(
                    "Trace Request Denied",
                    "<p>The TRACE method is disabled on this server.</p>",
                );
            } else {
                let echo = {
                    let rx = self.rx_ref();
                    format!("{} {} {:?}\r\n", rx.method, rx.uri, self.protocol)
                };
                let len = echo.len();
                let tx = self.tx_mut();
                tx.alt_body = Some(echo);
                tx.length = Some(len as u64);
            }
            self.finalize();
        } else if method_set.contains(MethodSet::OPTIONS) {
            let methods = self.tx_ref().trace_methods;
            let allow = methods.allow_tokens(self.limits.enable_trace_method);
            let tx = self.tx_mut();
            tx.headers.set("Allow", allow);
            tx.omit_body();
            tx.set_content_length(0);
            self.finalize();
        }
    }
}
