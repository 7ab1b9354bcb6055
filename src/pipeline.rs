use std::sync::Arc;

use tracing::trace;

use crate::conn::ConnCore;
use crate::packet::Packet;
use crate::queue::{Dir, Qid, Queue};
use crate::route::Route;
use crate::stage::Stage;
use crate::vars;

impl ConnCore {
    pub(crate) fn stage_of(&self, q: Qid) -> Arc<dyn Stage> {
        self.queues[q].stage.clone()
    }

    /// Deliver a packet to queue `q` through its stage's put callback.
    pub(crate) fn deliver(&mut self, q: Qid, packet: Packet) {
        let stage = self.stage_of(q);
        match self.queues[q].dir {
            Dir::Rx => stage.incoming(self, q, packet),
            Dir::Tx => stage.outgoing(self, q, packet),
        }
    }

    /// Pass a packet to the queue after `q`.
    pub(crate) fn send_to_next(&mut self, q: Qid, packet: Packet) {
        let next = self.queues[q].next.expect("next queue");
        self.deliver(next, packet);
    }

    /// Drain all packets from `q` to the next queue.
    pub(crate) fn send_all(&mut self, q: Qid) {
        while let Some(packet) = self.take_packet(q) {
            self.send_to_next(q, packet);
        }
    }

    /// Detach the next packet from `q`, transferring ownership to the
    /// caller. Back-enables the upstream queue when the count drops
    /// below the low watermark.
    pub(crate) fn take_packet(&mut self, q: Qid) -> Option<Packet> {
        let packet = self.queues[q].pop()?;
        let queue = &self.queues[q];
        if queue.full && queue.count < queue.low {
            self.queues[q].full = false;
            if let Some(prev) = self.queues[q].prev {
                if self.queues[prev].disabled {
                    self.enable_queue(prev);
                }
            }
        }
        Some(packet)
    }

    /// Put a packet back at the front of `q`.
    pub(crate) fn put_back(&mut self, q: Qid, packet: Packet) {
        self.queues[q].push_front(packet);
    }

    /// Append a packet to `q`, optionally scheduling it for service.
    pub(crate) fn put_for_service(&mut self, q: Qid, packet: Packet, service: bool) {
        self.queues[q].push(packet);
        if service && !self.queues[q].disabled {
            self.schedule_queue(q);
        }
    }

    /// Split `packet` so it fits the next queue; the tail is put back on
    /// `q`. `size` of zero means "whatever fits".
    pub(crate) fn resize_packet(&mut self, q: Qid, packet: &mut Packet, size: usize) {
        let next = self.queues[q].next.expect("next queue");
        let len = packet.body_len() as usize;
        let mut fit = if size == 0 { usize::MAX } else { size };
        fit = fit
            .min(len)
            .min(self.queues[next].max)
            .min(self.queues[next].packet_size);
        if fit == 0 || fit == len {
            return;
        }
        let tail = packet.split_at(fit);
        self.put_back(q, tail);
    }

    /// Join adjacent small packets on `q` up to `size` and the next
    /// queue's packet size.
    pub(crate) fn join_packets(&mut self, q: Qid, size: usize) {
        let max = match self.queues[q].next {
            Some(next) => size.min(self.queues[next].packet_size),
            None => size,
        };
        let queue = &mut self.queues[q];
        let mut joined: Vec<Packet> = Vec::with_capacity(queue.packets.len());
        while let Some(packet) = queue.packets.pop_front() {
            let can_join = match joined.last() {
                Some(last) => {
                    packet.is_data()
                        && last.is_data()
                        && !packet.has_prefix()
                        && last.len() + packet.len() < max
                }
                None => false,
            };
            if can_join {
                joined.last_mut().expect("joined last").join(packet);
            } else {
                joined.push(packet);
            }
        }
        queue.packets.extend(joined);
    }

    /// Test whether the next queue will accept `packet`, splitting it to
    /// fit when necessary. On refusal the producing queue is disabled
    /// and the downstream queue marked full and scheduled.
    pub(crate) fn will_next_accept(&mut self, q: Qid, packet: &mut Packet) -> bool {
        let next = self.queues[q].next.expect("next queue");
        let size = packet.len();
        if size == 0
            || (size <= self.queues[next].packet_size
                && size + self.queues[next].count <= self.queues[next].max)
        {
            return true;
        }
        self.resize_packet(q, packet, 0);
        let size = packet.len();
        if size <= self.queues[next].packet_size
            && size + self.queues[next].count <= self.queues[next].max
        {
            return true;
        }
        trace!(
            stage = self.queues[q].stage_name(),
            "downstream full, disabling"
        );
        self.disable_queue(q);
        self.queues[next].full = true;
        if !self.queues[next].disabled {
            self.schedule_queue(next);
        }
        false
    }

    pub(crate) fn schedule_queue(&mut self, q: Qid) {
        let queue = &mut self.queues[q];
        if !queue.scheduled && !queue.disabled {
            queue.scheduled = true;
            self.serviceq.push_back(q);
        }
    }

    pub(crate) fn disable_queue(&mut self, q: Qid) {
        trace!(stage = self.queues[q].stage_name(), "disable queue");
        self.queues[q].disabled = true;
    }

    pub(crate) fn enable_queue(&mut self, q: Qid) {
        trace!(stage = self.queues[q].stage_name(), "enable queue");
        self.queues[q].disabled = false;
        self.schedule_queue(q);
    }

    /// Run one queue's service callback, guarding against recursion: a
    /// reentrant schedule is deferred via the reservice flag.
    pub(crate) fn service_queue(&mut self, q: Qid) {
        if self.queues[q].servicing {
            self.queues[q].reservice = true;
            return;
        }
        self.queues[q].servicing = true;
        let stage = self.stage_of(q);
        match self.queues[q].dir {
            Dir::Tx => stage.outgoing_service(self, q),
            Dir::Rx => stage.incoming_service(self, q),
        }
        self.queues[q].serviced = true;
        self.queues[q].servicing = false;
        if self.queues[q].reservice {
            self.queues[q].reservice = false;
            self.schedule_queue(q);
        }
    }

    /// Drain the service list until no more work is scheduled. All I/O
    /// is non-blocking; a connector that cannot progress leaves its
    /// packets queued.
    pub(crate) fn service_queues(&mut self) -> bool {
        let mut work_done = false;
        while self.state < crate::conn::ConnState::Complete {
            let q = match self.serviceq.pop_front() {
                Some(q) => q,
                None => break,
            };
            self.queues[q].scheduled = false;
            self.service_queue(q);
            work_done = true;
        }
        work_done
    }

    /// Remove `q` from the pipeline flow (it keeps existing, unlinked).
    pub(crate) fn remove_queue(&mut self, q: Qid) {
        let prev = self.queues[q].prev;
        let next = self.queues[q].next;
        if let Some(prev) = prev {
            self.queues[prev].next = next;
        }
        if let Some(next) = next {
            self.queues[next].prev = prev;
        }
        self.queues[q].prev = None;
        self.queues[q].next = None;
    }

    /// Drop data and range packets from `q` (alt-body override and
    /// no-body responses).
    pub(crate) fn discard_data(&mut self, q: Qid) {
        let queue = &mut self.queues[q];
        let mut kept = std::collections::VecDeque::new();
        while let Some(packet) = queue.packets.pop_front() {
            if packet.is_data() || packet.is_range_marker() {
                queue.count -= packet.len();
            } else {
                kept.push_back(packet);
            }
        }
        queue.packets = kept;
    }

    /// Discard buffered output on every outgoing queue.
    pub(crate) fn discard_transmit_data(&mut self) {
        let mut q = self.write_q;
        while let Some(qid) = q {
            self.discard_data(qid);
            q = self.queues[qid].next;
        }
    }

    /// Assemble the transmit and receive pipelines after routing.
    ///
    /// The Tx pipeline is `[handler, matching output filters, connector]`
    /// and the Rx pipeline is `[connector, matching input filters,
    /// handler]`. Queues of the same stage are paired, opened once per
    /// pair, and a header packet is seeded on the write queue.
    pub(crate) fn create_pipeline(&mut self, route: Option<&Arc<Route>>) {
        let handler = self
            .tx
            .as_ref()
            .and_then(|tx| tx.handler.clone())
            .unwrap_or_else(|| self.http.pass_handler());

        let output_filters = route
            .map(|r| r.output_filters().to_vec())
            .unwrap_or_else(|| self.http.default_output_filters());
        let input_filters = route
            .map(|r| r.input_filters().to_vec())
            .unwrap_or_else(|| self.http.default_input_filters());
        let connector = self.http.net_connector();

        let mut tx_stages: Vec<Arc<dyn Stage>> = vec![handler.clone()];
        for filter in output_filters {
            if filter.matches(self, Dir::Tx) {
                tx_stages.push(filter);
            }
        }
        tx_stages.push(connector.clone());

        let mut rx_stages: Vec<Arc<dyn Stage>> = vec![connector];
        for filter in input_filters {
            if filter.matches(self, Dir::Rx) {
                rx_stages.push(filter);
            }
        }
        rx_stages.push(handler);

        let buffer = self.limits.stage_buffer_size;
        let mut tx_ids = Vec::with_capacity(tx_stages.len());
        for stage in tx_stages {
            let qid = self.queues.len();
            self.queues.push(Queue::new(stage, Dir::Tx, buffer));
            if let Some(&prev) = tx_ids.last() {
                self.queues[prev as usize].next = Some(qid);
                self.queues[qid].prev = Some(prev);
            }
            tx_ids.push(qid);
        }
        let mut rx_ids = Vec::with_capacity(rx_stages.len());
        for stage in rx_stages {
            let qid = self.queues.len();
            self.queues.push(Queue::new(stage, Dir::Rx, buffer));
            if let Some(&prev) = rx_ids.last() {
                self.queues[prev as usize].next = Some(qid);
                self.queues[qid].prev = Some(prev);
            }
            rx_ids.push(qid);
        }
        self.write_q = tx_ids.first().copied();
        self.conn_q = tx_ids.last().copied();
        self.rx_head = rx_ids.first().copied();
        self.read_q = rx_ids.last().copied();

        // Pair queues of the same stage across directions.
        for &tq in &tx_ids {
            for &rq in &rx_ids {
                if Arc::ptr_eq(&self.queues[tq].stage, &self.queues[rq].stage)
                    && self.queues[tq].pair.is_none()
                    && self.queues[rq].pair.is_none()
                {
                    self.queues[tq].pair = Some(rq);
                    self.queues[rq].pair = Some(tq);
                }
            }
        }

        self.set_vars();
        self.open_queues();

        let wq = self.write_q.expect("write queue");
        self.put_for_service(wq, Packet::header(), false);
    }

    fn set_vars(&mut self) {
        let handler = match self.tx.as_ref().and_then(|tx| tx.handler.clone()) {
            Some(handler) => handler,
            None => return,
        };
        if handler.wants_query_vars() {
            let query = self
                .rx
                .as_ref()
                .and_then(|rx| rx.parsed_uri.as_ref())
                .and_then(|uri| uri.query())
                .map(|q| q.to_string());
            if let Some(query) = query {
                let rx = self.rx_mut();
                crate::rx::add_form_vars(&mut rx.form_vars, &query);
            }
        }
        if handler.wants_cgi_vars() {
            vars::create_cgi_vars(self);
        }
    }

    /// Open each queue exactly once per stage pair.
    fn open_queues(&mut self) {
        let forced_chunk = match self.tx.as_ref().map(|tx| tx.chunk_size) {
            Some(crate::tx::Chunking::Size(n)) => Some(n),
            _ => None,
        };
        for q in 0..self.queues.len() {
            if self.queues[q].open {
                continue;
            }
            if let Some(pair) = self.queues[q].pair {
                if self.queues[pair].open {
                    continue;
                }
            }
            self.queues[q].open = true;
            if let Some(chunk) = forced_chunk {
                let queue = &mut self.queues[q];
                queue.packet_size = queue.packet_size.min(chunk);
            }
            let stage = self.stage_of(q);
            stage.open(self, q);
        }
    }

    /// Start the pipeline stages: inbound filters first (when a body is
    /// expected), then outbound stages upstream, the handler last.
    pub(crate) fn start_pipeline(&mut self) {
        if self.rx.as_ref().map_or(false, |rx| rx.need_input_pipeline) {
            let mut q = self.rx_head;
            while let Some(qid) = q {
                let next = self.queues[qid].next;
                if next.is_some() {
                    // The handler's own queue starts on the Tx side.
                    self.start_queue(qid);
                }
                q = next;
            }
        }
        let mut order = Vec::new();
        let mut q = self.write_q;
        while let Some(qid) = q {
            order.push(qid);
            q = self.queues[qid].next;
        }
        let write_q = self.write_q;
        let to_start: Vec<Qid> = order
            .iter()
            .rev()
            .filter(|&&qid| Some(qid) != write_q)
            .copied()
            .collect();
        for qid in to_start {
            self.start_queue(qid);
        }
        if let Some(wq) = self.write_q {
            self.start_queue(wq);
        }
    }

    fn start_queue(&mut self, q: Qid) {
        if self.queues[q].started {
            return;
        }
        if let Some(pair) = self.queues[q].pair {
            if self.queues[pair].started {
                return;
            }
        }
        self.queues[q].started = true;
        let stage = self.stage_of(q);
        stage.start(self, q);
    }

    /// Invoke the handler's process callback once all content has been
    /// received. May be called multiple times.
    pub(crate) fn process_pipeline(&mut self) {
        if self.error {
            self.finalize();
        }
        if let Some(wq) = self.write_q {
            let stage = self.stage_of(wq);
            stage.process(self, wq);
        }
    }

    /// Tear the pipeline down, closing each opened stage once.
    pub(crate) fn destroy_pipeline(&mut self) {
        for q in 0..self.queues.len() {
            if self.queues[q].open {
                self.queues[q].open = false;
                let stage = self.stage_of(q);
                stage.close(self, q);
            }
        }
    }

    /// Reschedule the connector after staged output was flushed.
    /// Returns true when new bytes were staged.
    pub(crate) fn resume_connector(&mut self) -> bool {
        let cq = match self.conn_q {
            Some(cq) => cq,
            None => return false,
        };
        if self.queues[cq].is_empty() || self.write_buf.has_remaining() {
            return false;
        }
        self.schedule_queue(cq);
        self.service_queues();
        self.write_buf.has_remaining()
    }
}

/// Default incoming behavior: forward to the next queue; at the last
/// queue, buffer for the handler to consume.
pub(crate) fn default_incoming(core: &mut ConnCore, q: Qid, packet: Packet) {
    match core.queues[q].next {
        Some(_) => core.send_to_next(q, packet),
        None => core.put_for_service(q, packet, false),
    }
}

/// Default outgoing service: drain packets downstream, splitting them to
/// respect the next queue's packet size and room.
pub(crate) fn default_outgoing_service(core: &mut ConnCore, q: Qid) {
    while let Some(mut packet) = core.take_packet(q) {
        if !core.will_next_accept(q, &mut packet) {
            core.put_back(q, packet);
            return;
        }
        core.send_to_next(q, packet);
    }
}
