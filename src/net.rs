use std::collections::VecDeque;
use std::io::{IoSlice, Read};

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::conn::{ConnCore, ErrorFlags};
use crate::packet::Packet;
use crate::queue::Qid;
use crate::stage::{Stage, StageKind, StageName};
use crate::tx::Chunking;

/// Cap on distinct buffers staged for one vectored write.
pub(crate) const MAX_IOVEC: usize = 16;

/// Staged connector output awaiting a vectored write.
///
/// Buffers are appended by the net connector and drained by the
/// connection driver; a partial write advances buffer cursors and
/// compacts the vector.
pub(crate) struct WriteBuf {
    bufs: VecDeque<Bytes>,
    remaining: usize,
}

impl WriteBuf {
    pub(crate) fn new() -> WriteBuf {
        WriteBuf {
            bufs: VecDeque::new(),
            remaining: 0,
        }
    }

    pub(crate) fn push(&mut self, buf: Bytes) {
        if !buf.is_empty() {
            self.remaining += buf.len();
            self.bufs.push_back(buf);
        }
    }

    pub(crate) fn has_remaining(&self) -> bool {
        self.remaining > 0
    }

    pub(crate) fn slots(&self) -> usize {
        self.bufs.len()
    }

    /// The write vector for the next I/O request.
    pub(crate) fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.bufs
            .iter()
            .take(MAX_IOVEC)
            .map(|buf| IoSlice::new(buf))
            .collect()
    }

    /// Consume `n` written bytes from the front of the vector.
    pub(crate) fn advance(&mut self, mut n: usize) {
        self.remaining -= n.min(self.remaining);
        while n > 0 {
            let front = match self.bufs.front_mut() {
                Some(front) => front,
                None => break,
            };
            if front.len() > n {
                front.advance(n);
                break;
            }
            n -= front.len();
            self.bufs.pop_front();
        }
    }
}

/// The network connector: aggregates outbound packets into a bounded
/// scatter/gather vector for the connection driver to write.
pub struct NetConnector;

impl Stage for NetConnector {
    fn name(&self) -> StageName {
        "net"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn outgoing_service(&self, core: &mut ConnCore, q: Qid) {
        if core.write_complete {
            return;
        }
        if core.tx.as_ref().map_or(false, |tx| tx.no_body) {
            core.discard_data(q);
        }
        let projected = core.tx.as_ref().map_or(0, |tx| tx.bytes_written) + core.queues[q].count as u64;
        if projected > core.limits.transmit_body_size {
            let msg = format!(
                "Http transmission aborted. Exceeded transmission max body of {} bytes",
                core.limits.transmit_body_size
            );
            let headers_created = core.tx.as_ref().map_or(false, |tx| tx.headers_created);
            core.error(413, ErrorFlags::default(), msg);
            if headers_created {
                // The client must be notified somehow.
                core.disconnect();
                core.complete_writing();
                return;
            }
        }
        while core.write_buf.slots() < MAX_IOVEC - 2 {
            let mut packet = match core.take_packet(q) {
                Some(packet) => packet,
                None => break,
            };
            if packet.is_header() {
                let tx = core.tx_ref();
                let unframed = tx.length.is_none() && !matches!(tx.chunk_size, Chunking::Size(_));
                if unframed && core.queues[q].count > 0 {
                    // No length and no chunking: the close delimits the
                    // body.
                    core.keep_alive_count = 0;
                }
                core.write_headers(&mut packet);
            }
            if packet.entity_len() > 0 && packet.content().is_none() {
                if !send_open(core, &mut packet, q) {
                    return;
                }
            }
            if packet.is_end() {
                core.queues[q].eof = true;
            }
            let written = packet.len() as u64;
            if let Some(prefix) = packet.prefix.take() {
                core.write_buf.push(prefix);
            }
            if let Some(content) = packet.content.take() {
                core.write_buf.push(content.freeze());
            }
            if let Some(tx) = core.tx.as_mut() {
                tx.bytes_written += written;
            }
        }
        trace!(staged = core.write_buf.slots(), "net connector staged output");
        if core.queues[q].is_empty() && core.queues[q].eof {
            core.complete_writing();
        }
    }
}

/// Materialize a pre-declared entity region from the send file.
///
/// The region is read in packet-size pieces; the unread remainder is put
/// back so back-pressure applies to file delivery too.
fn send_open(core: &mut ConnCore, packet: &mut Packet, q: Qid) -> bool {
    if core.tx_ref().file.is_none() {
        let path = match core.tx_ref().filename.clone() {
            Some(path) => path,
            None => {
                core.error(500, ErrorFlags::default(), "No send file designated");
                return false;
            }
        };
        match std::fs::File::open(&path) {
            Ok(file) => core.tx_mut().file = Some(file),
            Err(e) => {
                core.error(
                    404,
                    ErrorFlags::default(),
                    format!("Can't open document: {}", e),
                );
                return false;
            }
        }
    }
    let want = packet
        .entity_len()
        .min(core.queues[q].packet_size as u64) as usize;
    if (packet.entity_len() as usize) > want {
        let tail = packet.split_at(want);
        core.put_back(q, tail);
    }
    let mut buf = BytesMut::new();
    buf.resize(want, 0);
    let (read, failed) = {
        let file = core.tx_mut().file.as_mut().expect("send file");
        let mut read = 0;
        let mut failed = None;
        while read < want {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        (read, failed)
    };
    if let Some(e) = failed {
        core.error(500, ErrorFlags::default(), format!("Can't read document: {}", e));
        return false;
    }
    buf.truncate(read);
    *packet.content_mut() = buf;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_buf_advance_partial() {
        let mut wb = WriteBuf::new();
        wb.push(Bytes::from_static(b"hello"));
        wb.push(Bytes::from_static(b"world"));
        assert_eq!(wb.slots(), 2);
        wb.advance(7);
        assert!(wb.has_remaining());
        let slices = wb.io_slices();
        assert_eq!(&*slices[0], b"rld");
        wb.advance(3);
        assert!(!wb.has_remaining());
        assert_eq!(wb.slots(), 0);
    }

    #[test]
    fn write_buf_skips_empty() {
        let mut wb = WriteBuf::new();
        wb.push(Bytes::new());
        assert_eq!(wb.slots(), 0);
    }
}
