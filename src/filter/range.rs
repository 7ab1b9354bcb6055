use bytes::Buf;

use crate::conn::ConnCore;
use crate::packet::Packet;
use crate::queue::{Dir, Qid};
use crate::rx::resolve_ranges;
use crate::stage::{Stage, StageKind, StageName};

/// Ranged response filter.
///
/// Consumes the outgoing packet stream and, for each packet overlapping
/// the current range, trims leading bytes, splits trailing bytes and
/// inserts boundary marker packets when the response carries multiple
/// ranges. The status is rewritten to 206 on entry.
pub struct RangeFilter;

impl Stage for RangeFilter {
    fn name(&self) -> StageName {
        "range"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, core: &ConnCore, dir: Dir) -> bool {
        dir == Dir::Tx && core.rx().map_or(false, |rx| !rx.ranges.is_empty())
    }

    fn outgoing_service(&self, core: &mut ConnCore, q: Qid) {
        if !core.queues[q].serviced && !prepare_ranges(core, q) {
            // Not applicable: step aside and emit the entity as-is.
            core.send_all(q);
            core.remove_queue(q);
            return;
        }
        range_service(core, q);
    }
}

/// First-service fixup: resolve ranges against the entity length, create
/// the multipart boundary when needed and rewrite the status.
fn prepare_ranges(core: &mut ConnCore, q: Qid) -> bool {
    if core.tx_ref().entity_length.is_none()
        && core.queues[q].last().map_or(false, |p| p.is_end())
    {
        // All data buffered: compute the entity length so suffix ranges
        // resolve.
        let count = core.queues[q].count as u64;
        core.tx_mut().entity_length = Some(count);
    }
    if core.tx_ref().status != 200 {
        return false;
    }
    let specs = core.rx_ref().ranges.clone();
    let resolved = match resolve_ranges(&specs, core.tx_ref().entity_length) {
        Some(resolved) if !resolved.is_empty() => resolved,
        _ => return false,
    };
    let multiple = resolved.len() > 1;
    {
        let tx = core.tx_mut();
        tx.ranges = resolved;
        tx.current_range = 0;
        tx.pos = 0;
        // Ranged delivery replaces the whole-entity length.
        tx.length = None;
    }
    if multiple {
        let boundary = format!(
            "{:08x}{:08x}",
            rand::random::<u32>(),
            rand::random::<u32>()
        );
        core.tx_mut().range_boundary = Some(boundary);
    } else {
        let (start, end) = core.tx_ref().ranges[0];
        core.tx_mut().length = Some(end - start);
    }
    core.tx_mut().status = 206;
    true
}

fn range_service(core: &mut ConnCore, q: Qid) {
    while let Some(mut packet) = core.take_packet(q) {
        if !packet.is_data() {
            if packet.is_end() && core.tx_ref().range_boundary.is_some() {
                let final_packet = create_final_range_packet(core);
                core.send_to_next(q, final_packet);
            }
            if !core.will_next_accept(q, &mut packet) {
                core.put_back(q, packet);
                return;
            }
            core.send_to_next(q, packet);
            continue;
        }
        // Apply the current packet across ranges until its bytes are
        // delivered or discarded.
        loop {
            let range_idx = core.tx_ref().current_range;
            if range_idx >= core.tx_ref().ranges.len() {
                // Past the final range: discard.
                core.tx_mut().pos += packet.body_len();
                break;
            }
            let (start, end) = core.tx_ref().ranges[range_idx];
            let pos = core.tx_ref().pos;
            let bytes = packet.body_len();
            if bytes == 0 {
                break;
            }
            if pos + bytes <= start {
                // Entirely before the range.
                core.tx_mut().pos += bytes;
                break;
            }
            if pos < start {
                // Trim the leading bytes before the range start.
                let skip = (start - pos) as usize;
                if packet.content().is_some() {
                    packet.content_mut().advance(skip);
                } else {
                    packet.entity_length -= skip as u64;
                }
                core.tx_mut().pos += skip as u64;
                continue;
            }
            // In range.
            let count = bytes.min(end - pos);
            if count < bytes {
                let tail = packet.split_at(count as usize);
                core.put_back(q, tail);
            }
            if !core.will_next_accept(q, &mut packet) {
                core.put_back(q, packet);
                return;
            }
            if core.tx_ref().range_boundary.is_some() {
                let marker = create_range_packet(core, start, end);
                core.send_to_next(q, marker);
            }
            core.send_to_next(q, packet);
            let tx = core.tx_mut();
            tx.pos += count;
            if tx.pos >= end {
                tx.current_range += 1;
            }
            break;
        }
    }
}

/// A boundary marker packet bearing the part's `Content-Range`.
fn create_range_packet(core: &ConnCore, start: u64, end: u64) -> Packet {
    let tx = core.tx_ref();
    let total = match tx.entity_length {
        Some(len) => len.to_string(),
        None => "*".to_string(),
    };
    let boundary = tx.range_boundary.as_deref().expect("range boundary");
    Packet::range_marker(
        format!(
            "\r\n--{}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
            boundary,
            start,
            end - 1,
            total
        )
        .as_bytes(),
    )
}

/// The closing boundary after all range parts.
fn create_final_range_packet(core: &ConnCore) -> Packet {
    let boundary = core.tx_ref().range_boundary.as_deref().expect("range boundary");
    Packet::range_marker(format!("\r\n--{}--\r\n", boundary).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rx::RangeSpec;

    #[test]
    fn resolve_clamps_and_drops_empty() {
        let specs = vec![RangeSpec::FromTo(0, 4), RangeSpec::FromTo(20, 30)];
        let resolved = resolve_ranges(&specs, Some(10)).unwrap();
        assert_eq!(resolved, vec![(0, 4)]);
    }
}
