use bytes::Bytes;
use tracing::trace;

use crate::conn::{ConnCore, ErrorFlags};
use crate::packet::Packet;
use crate::queue::{Dir, Qid};
use crate::rx::ChunkState;
use crate::stage::{Stage, StageKind, StageName};
use crate::tx::Chunking;

/// Transfer chunk encoding filter.
///
/// Inbound, decodes `Transfer-Encoding: chunked` framing; the connection
/// sizes input packets so a packet never straddles a chunk boundary.
/// Outbound, frames data packets with size-line prefixes unless the body
/// length is known before the first service, in which case chunking is
/// bypassed entirely.
pub struct ChunkFilter;

impl Stage for ChunkFilter {
    fn name(&self) -> StageName {
        "chunk"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, core: &ConnCore, dir: Dir) -> bool {
        match dir {
            Dir::Rx => core.rx().map_or(false, |rx| rx.chunked),
            Dir::Tx => core.tx().map_or(true, |tx| tx.length.is_none()),
        }
    }

    fn open(&self, core: &mut ConnCore, q: Qid) {
        let size = core.limits.chunk_size.min(core.queues[q].max);
        core.queues[q].packet_size = size;
        if let Some(rx) = core.rx_mut_opt() {
            rx.chunk_state = ChunkState::Start;
        }
    }

    fn incoming(&self, core: &mut ConnCore, q: Qid, packet: Packet) {
        if !core.rx_ref().chunked {
            core.send_to_next(q, packet);
            return;
        }
        if packet.content().is_none() || packet.is_end() {
            if core.rx_ref().chunk_state == ChunkState::Data {
                core.error(400, ErrorFlags::default(), "Bad chunk state");
                return;
            }
            core.rx_mut().chunk_state = ChunkState::Eof;
            core.send_to_next(q, packet);
            return;
        }
        match core.rx_ref().chunk_state {
            ChunkState::Start => {
                // Expect "\r\nHEX[;ext]\r\n"; the connection guaranteed a
                // complete spec line.
                let size = match parse_chunk_spec(&packet.content().expect("content")[..]) {
                    Some(size) => size,
                    None => {
                        core.error(400, ErrorFlags::default(), "Bad chunk specification");
                        return;
                    }
                };
                trace!(size, "incoming chunk");
                let rx = core.rx_mut();
                rx.chunk_size = size;
                rx.remaining_content = size;
                if size == 0 {
                    rx.chunk_state = ChunkState::Eof;
                } else {
                    rx.chunk_state = ChunkState::Data;
                }
                // The spec line is consumed with the packet.
            }
            ChunkState::Data => {
                debug_assert!(packet.len() as u64 <= core.rx_ref().chunk_size);
                core.send_to_next(q, packet);
                let rx = core.rx_mut();
                if rx.remaining_content == 0 {
                    rx.chunk_state = ChunkState::Start;
                    // Nonzero until the zero chunk arrives, so content
                    // processing does not finish early.
                    rx.remaining_content = u64::MAX;
                }
            }
            ChunkState::Eof => {
                core.send_to_next(q, packet);
            }
        }
    }

    fn outgoing_service(&self, core: &mut ConnCore, q: Qid) {
        if !core.queues[q].serviced {
            let all_buffered = core.queues[q].last().map_or(false, |p| p.is_end());
            if all_buffered {
                // The entire body is buffered, so the content length is
                // known and chunking can be bypassed.
                let count = core.queues[q].count as u64;
                let tx = core.tx_mut();
                if matches!(tx.chunk_size, Chunking::Auto) && tx.length.is_none() {
                    tx.length = Some(count);
                }
            } else if matches!(core.tx_ref().chunk_size, Chunking::Auto) {
                let size = core.limits.chunk_size.min(core.queues[q].max);
                core.tx_mut().chunk_size = Chunking::Size(size);
            }
        }
        let chunking = match core.tx_ref().chunk_size {
            Chunking::Size(size) if core.tx_ref().alt_body.is_none() => Some(size),
            _ => None,
        };
        match chunking {
            None => crate::pipeline::default_outgoing_service(core, q),
            Some(chunk_size) => {
                while let Some(mut packet) = core.take_packet(q) {
                    if !packet.is_header() {
                        core.join_packets(q, chunk_size);
                        if packet.len() > chunk_size {
                            core.resize_packet(q, &mut packet, chunk_size);
                        }
                    }
                    if !core.will_next_accept(q, &mut packet) {
                        core.put_back(q, packet);
                        return;
                    }
                    if !packet.is_header() {
                        set_chunk_prefix(&mut packet);
                    }
                    core.send_to_next(q, packet);
                }
            }
        }
    }
}

/// Parse a complete "\r\nHEX[;ext]\r\n" chunk spec packet. Returns the
/// chunk size, or `None` when malformed.
fn parse_chunk_spec(buf: &[u8]) -> Option<u64> {
    if buf.len() < 5 || buf[0] != b'\r' || buf[1] != b'\n' {
        return None;
    }
    let nl = memchr::memchr(b'\n', &buf[2..]).map(|i| 2 + i)?;
    if buf[nl - 1] != b'\r' {
        return None;
    }
    if !buf[2].is_ascii_hexdigit() {
        return None;
    }
    let mut size: u64 = 0;
    for &b in &buf[2..nl - 1] {
        let value = match b {
            b'0'..=b'9' => (b - b'0') as u64,
            b'a'..=b'f' => (b - b'a' + 10) as u64,
            b'A'..=b'F' => (b - b'A' + 10) as u64,
            _ => break,
        };
        size = size.checked_mul(16)?.checked_add(value)?;
    }
    Some(size)
}

/// Prepend the chunk size line, or the terminator on the end packet.
/// Prefixes do not count against the queue budget.
fn set_chunk_prefix(packet: &mut Packet) {
    if packet.has_prefix() {
        return;
    }
    let prefix = if packet.len() > 0 {
        Bytes::from(format!("\r\n{:x}\r\n", packet.len()))
    } else {
        Bytes::from_static(b"\r\n0\r\n\r\n")
    };
    packet.set_prefix(prefix);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_spec_parse() {
        assert_eq!(parse_chunk_spec(b"\r\n4\r\n"), Some(4));
        assert_eq!(parse_chunk_spec(b"\r\nff\r\n"), Some(255));
        assert_eq!(parse_chunk_spec(b"\r\n10;name=value\r\n"), Some(16));
        assert_eq!(parse_chunk_spec(b"\r\n0\r\n\r\n"), Some(0));
        assert_eq!(parse_chunk_spec(b"4\r\n"), None);
        assert_eq!(parse_chunk_spec(b"\r\nzz\r\n"), None);
    }

    #[test]
    fn prefix_framing() {
        let mut packet = Packet::data_from(&b"AAAA"[..]);
        set_chunk_prefix(&mut packet);
        assert_eq!(packet.prefix.as_deref(), Some(&b"\r\n4\r\n"[..]));

        let mut end = Packet::end();
        set_chunk_prefix(&mut end);
        assert_eq!(end.prefix.as_deref(), Some(&b"\r\n0\r\n\r\n"[..]));
    }
}
