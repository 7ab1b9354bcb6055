use bytes::{Bytes, BytesMut};

/// What a packet stands for on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Message head; the connector serializes it on first emission.
    Header,
    /// Entity data.
    Data,
    /// End of stream. Carries no content.
    End,
    /// A range boundary marker bearing a `Content-Range` part header.
    RangeMarker,
}

/// The unit of data movement between queues.
///
/// A packet carries at most one of: buffered content, or an
/// `entity_length` pre-declaration standing in for a body region that has
/// not been materialized yet (the send-file path). The optional prefix is
/// used by the chunk filter to prepend size lines without counting against
/// the queue budget; a suffix, when present, migrates to the trailing
/// packet on a split.
#[derive(Debug)]
pub struct Packet {
    kind: PacketKind,
    pub(crate) prefix: Option<Bytes>,
    pub(crate) content: Option<BytesMut>,
    pub(crate) suffix: Option<Bytes>,
    pub(crate) entity_length: u64,
}

impl Packet {
    fn new(kind: PacketKind, content: Option<BytesMut>) -> Packet {
        Packet {
            kind,
            prefix: None,
            content,
            suffix: None,
            entity_length: 0,
        }
    }

    /// An empty header packet.
    pub fn header() -> Packet {
        Packet::new(PacketKind::Header, Some(BytesMut::new()))
    }

    /// An empty data packet.
    pub fn data() -> Packet {
        Packet::new(PacketKind::Data, Some(BytesMut::new()))
    }

    /// A data packet holding `content`.
    pub fn data_from(content: impl Into<BytesMut>) -> Packet {
        Packet::new(PacketKind::Data, Some(content.into()))
    }

    /// A data packet pre-declaring `len` bytes of not-yet-read entity.
    pub fn entity(len: u64) -> Packet {
        let mut packet = Packet::new(PacketKind::Data, None);
        packet.entity_length = len;
        packet
    }

    /// An end-of-stream packet.
    pub fn end() -> Packet {
        Packet::new(PacketKind::End, None)
    }

    /// A range marker packet holding a part header.
    pub fn range_marker(content: impl Into<BytesMut>) -> Packet {
        Packet::new(PacketKind::RangeMarker, Some(content.into()))
    }

    /// The packet kind.
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Buffered content length. Prefixes and suffixes do not count.
    pub fn len(&self) -> usize {
        self.content.as_ref().map_or(0, |c| c.len())
    }

    /// True when the packet buffers no content bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content length, or the entity pre-declaration when content is
    /// absent.
    pub fn body_len(&self) -> u64 {
        match self.content {
            Some(ref content) => content.len() as u64,
            None => self.entity_length,
        }
    }

    /// True for data packets.
    pub fn is_data(&self) -> bool {
        self.kind == PacketKind::Data
    }

    /// True for the end-of-stream packet.
    pub fn is_end(&self) -> bool {
        self.kind == PacketKind::End
    }

    /// True for the header packet.
    pub fn is_header(&self) -> bool {
        self.kind == PacketKind::Header
    }

    /// True for range boundary markers.
    pub fn is_range_marker(&self) -> bool {
        self.kind == PacketKind::RangeMarker
    }

    /// Borrow the content buffer.
    pub fn content(&self) -> Option<&BytesMut> {
        self.content.as_ref()
    }

    /// Mutably borrow the content buffer, creating it if absent.
    pub fn content_mut(&mut self) -> &mut BytesMut {
        self.content.get_or_insert_with(BytesMut::new)
    }

    /// The undelivered entity pre-declaration.
    pub fn entity_len(&self) -> u64 {
        self.entity_length
    }

    /// Set the framing prefix. Replaces any existing prefix.
    pub fn set_prefix(&mut self, prefix: Bytes) {
        self.prefix = Some(prefix);
    }

    /// True when a framing prefix is attached.
    pub fn has_prefix(&self) -> bool {
        self.prefix.is_some()
    }

    /// Split at `offset`, returning the trailing packet.
    ///
    /// The leading packet keeps content bytes `[0, offset)`; the trailing
    /// packet inherits the suffix and, for entity packets, the remaining
    /// pre-declared length.
    pub fn split_at(&mut self, offset: usize) -> Packet {
        let mut tail = Packet::new(self.kind, None);
        tail.suffix = self.suffix.take();
        match self.content {
            Some(ref mut content) => {
                debug_assert!(offset < content.len());
                tail.content = Some(content.split_off(offset));
            }
            None => {
                debug_assert!((offset as u64) < self.entity_length);
                tail.entity_length = self.entity_length - offset as u64;
                self.entity_length = offset as u64;
            }
        }
        tail
    }

    /// Pull the content of `other` onto the end of this packet.
    pub fn join(&mut self, other: Packet) {
        if let Some(content) = other.content {
            self.content_mut().extend_from_slice(&content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_moves_tail_content() {
        let mut packet = Packet::data_from(&b"hello world"[..]);
        let tail = packet.split_at(5);
        assert_eq!(&packet.content().unwrap()[..], b"hello");
        assert_eq!(&tail.content().unwrap()[..], b" world");
        assert_eq!(tail.kind(), PacketKind::Data);
    }

    #[test]
    fn split_entity_partitions_length() {
        let mut packet = Packet::entity(100);
        let tail = packet.split_at(30);
        assert_eq!(packet.entity_len(), 30);
        assert_eq!(tail.entity_len(), 70);
    }

    #[test]
    fn suffix_migrates_on_split() {
        let mut packet = Packet::data_from(&b"abcdef"[..]);
        packet.suffix = Some(Bytes::from_static(b"\r\n"));
        let tail = packet.split_at(3);
        assert!(packet.suffix.is_none());
        assert_eq!(tail.suffix.as_deref(), Some(&b"\r\n"[..]));
    }

    #[test]
    fn join_appends_content() {
        let mut packet = Packet::data_from(&b"foo"[..]);
        packet.join(Packet::data_from(&b"bar"[..]));
        assert_eq!(&packet.content().unwrap()[..], b"foobar");
    }

    #[test]
    fn end_packet_has_no_content() {
        let packet = Packet::end();
        assert!(packet.is_end());
        assert_eq!(packet.len(), 0);
        assert!(packet.content().is_none());
    }
}
