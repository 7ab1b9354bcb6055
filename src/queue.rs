use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::packet::Packet;
use crate::stage::Stage;

/// Direction of a queue within the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Inbound: connector toward handler.
    Rx,
    /// Outbound: handler toward connector.
    Tx,
}

/// Index of a queue within its connection's pipeline.
pub type Qid = usize;

/// A bounded FIFO of packets owned by one stage.
///
/// Queues are created during pipeline assembly and destroyed at teardown.
/// `count` tracks buffered content bytes; when it reaches `max` the queue
/// marks itself full and its upstream producer is disabled until `count`
/// drops below `low` again.
pub struct Queue {
    pub(crate) stage: Arc<dyn Stage>,
    pub(crate) dir: Dir,
    pub(crate) packets: VecDeque<Packet>,
    pub(crate) count: usize,
    pub(crate) max: usize,
    pub(crate) low: usize,
    pub(crate) packet_size: usize,
    pub(crate) prev: Option<Qid>,
    pub(crate) next: Option<Qid>,
    pub(crate) pair: Option<Qid>,
    pub(crate) open: bool,
    pub(crate) started: bool,
    pub(crate) disabled: bool,
    pub(crate) full: bool,
    pub(crate) serviced: bool,
    pub(crate) servicing: bool,
    pub(crate) reservice: bool,
    pub(crate) scheduled: bool,
    pub(crate) eof: bool,
    pub(crate) stage_data: Option<Box<dyn Any + Send>>,
}

impl Queue {
    pub(crate) fn new(stage: Arc<dyn Stage>, dir: Dir, buffer_size: usize) -> Queue {
        Queue {
            stage,
            dir,
            packets: VecDeque::new(),
            count: 0,
            max: buffer_size,
            low: buffer_size / 100 * 5,
            packet_size: buffer_size,
            prev: None,
            next: None,
            pair: None,
            open: false,
            started: false,
            disabled: false,
            full: false,
            serviced: false,
            servicing: false,
            reservice: false,
            scheduled: false,
            eof: false,
            stage_data: None,
        }
    }

    /// Name of the owning stage.
    pub fn stage_name(&self) -> &str {
        self.stage.name()
    }

    /// Queue direction.
    pub fn dir(&self) -> Dir {
        self.dir
    }

    /// Buffered content bytes.
    pub fn count(&self) -> usize {
        self.count
    }

    /// High watermark.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Preferred packet size for this queue.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// True when no packets are buffered.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Bytes the queue will still accept. Never negative.
    pub fn room(&self) -> usize {
        self.max.saturating_sub(self.count)
    }

    /// Peek at the first buffered packet.
    pub fn first(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// Peek at the last buffered packet.
    pub fn last(&self) -> Option<&Packet> {
        self.packets.back()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut Packet> {
        self.packets.back_mut()
    }

    /// Append a packet, adjusting the byte count.
    pub(crate) fn push(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_back(packet);
    }

    /// Put a packet back at the front of the queue.
    pub(crate) fn push_front(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_front(packet);
    }

    /// Detach the next packet. The caller becomes the owner.
    pub(crate) fn pop(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.count -= packet.len();
        Some(packet)
    }

    /// Per-request state installed by the owning stage.
    pub fn stage_data<T: 'static>(&self) -> Option<&T> {
        self.stage_data.as_ref().and_then(|d| d.downcast_ref())
    }

    /// Mutable access to per-request stage state.
    pub fn stage_data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.stage_data.as_mut().and_then(|d| d.downcast_mut())
    }

    /// Install per-request stage state.
    pub fn set_stage_data<T: Any + Send>(&mut self, data: T) {
        self.stage_data = Some(Box::new(data));
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("stage", &self.stage.name())
            .field("dir", &self.dir)
            .field("count", &self.count)
            .field("max", &self.max)
            .field("packets", &self.packets.len())
            .field("disabled", &self.disabled)
            .field("full", &self.full)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{StageKind, StageName};

    struct Noop;
    impl Stage for Noop {
        fn name(&self) -> StageName {
            "noop"
        }
        fn kind(&self) -> StageKind {
            StageKind::Filter
        }
    }

    #[test]
    fn count_tracks_content_bytes() {
        let mut q = Queue::new(Arc::new(Noop), Dir::Tx, 1024);
        q.push(Packet::data_from(&b"12345"[..]));
        q.push(Packet::end());
        assert_eq!(q.count(), 5);
        let p = q.pop().unwrap();
        assert_eq!(p.len(), 5);
        assert_eq!(q.count(), 0);
        assert!(q.pop().unwrap().is_end());
        assert!(q.pop().is_none());
    }

    #[test]
    fn room_never_underflows() {
        let mut q = Queue::new(Arc::new(Noop), Dir::Tx, 4);
        q.push(Packet::data_from(&b"123456"[..]));
        assert_eq!(q.room(), 0);
    }
}
