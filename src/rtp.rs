//! RTP framing for A2DP media packets.

/// Size of the fixed RTP header in bytes.
pub const HEADER_LEN: usize = 12;

/// Dynamic payload type used for A2DP media packets.
pub const PAYLOAD_TYPE_MEDIA: u8 = 96;

/// RTP packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit.
    pub marker: bool,
    /// Payload type.
    pub payload_type: u8,
    /// Sequence number, incremented per packet.
    pub seq: u16,
    /// Media timestamp in frames.
    pub timestamp: u32,
    /// Synchronization source.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Create a header for a new outbound stream.
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self { marker: false, payload_type, seq: 0, timestamp: 0, ssrc }
    }

    /// Serialize into the 12-byte wire format.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0] = 2 << 6;
        b[1] = (self.payload_type & 0x7f) | if self.marker { 0x80 } else { 0 };
        b[2..4].copy_from_slice(&self.seq.to_be_bytes());
        b[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        b[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        b
    }

    /// Parse a packet, returning the header and the payload slice.
    ///
    /// Packets that are not RTP version 2 or are shorter than the fixed
    /// header are rejected.
    pub fn parse(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() < HEADER_LEN || packet[0] >> 6 != 2 {
            return None;
        }
        let csrc_count = (packet[0] & 0x0f) as usize;
        let payload_start = HEADER_LEN + 4 * csrc_count;
        if packet.len() < payload_start {
            return None;
        }
        let header = Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            seq: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        };
        Some((header, &packet[payload_start..]))
    }

    /// Advance sequence number and timestamp for the next packet.
    pub fn advance(&mut self, frames: u32) {
        self.seq = self.seq.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(frames);
    }
}

/// A packet delivered by the reorder window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordered {
    /// Sequence number of the packet.
    pub seq: u16,
    /// Media timestamp of the packet.
    pub timestamp: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Reorder window for the A2DP sink direction.
///
/// Packets arriving out of order are held back until their predecessors
/// arrive or fall out of the window; packets older than the delivery
/// point are dropped as duplicates.
#[derive(Debug)]
pub struct SeqWindow {
    window: usize,
    expected: Option<u16>,
    pending: Vec<Ordered>,
}

impl SeqWindow {
    /// Create a window holding at most `window` out-of-order packets.
    pub fn new(window: usize) -> Self {
        Self { window, expected: None, pending: Vec::new() }
    }

    /// Reset the delivery point, e.g. after the stream restarts.
    pub fn reset(&mut self) {
        self.expected = None;
        self.pending.clear();
    }

    /// Offer a packet; returns the packets that became deliverable, in
    /// sequence order. Sequence gaps are visible to the caller through
    /// the timestamps of consecutive deliveries.
    pub fn push(&mut self, seq: u16, timestamp: u32, payload: Vec<u8>) -> Vec<Ordered> {
        let expected = match self.expected {
            None => {
                self.expected = Some(seq.wrapping_add(1));
                return vec![Ordered { seq, timestamp, payload }];
            }
            Some(e) => e,
        };

        let ahead = seq.wrapping_sub(expected);
        if ahead as i16 <= -1 {
            // Late duplicate, delivery point has moved past it.
            log::debug!("RTP: dropping late packet {seq} (expected {expected})");
            return Vec::new();
        }

        self.pending.push(Ordered { seq, timestamp, payload });
        self.pending.sort_by_key(|p| p.seq.wrapping_sub(expected));

        let mut out = Vec::new();
        // Deliver the in-order head of the queue.
        while let Some(first) = self.pending.first() {
            if first.seq == self.expected.unwrap() {
                let p = self.pending.remove(0);
                self.expected = Some(p.seq.wrapping_add(1));
                out.push(p);
            } else {
                break;
            }
        }

        // Window overflow: give up on the missing packets and resume at
        // the oldest queued one; the timestamp jump tells the decoder
        // how much silence the loss represents.
        while self.pending.len() > self.window {
            let p = self.pending.remove(0);
            log::debug!("RTP: sequence gap, resuming at {}", p.seq);
            self.expected = Some(p.seq.wrapping_add(1));
            out.push(p);
            while let Some(first) = self.pending.first() {
                if first.seq == self.expected.unwrap() {
                    let p = self.pending.remove(0);
                    self.expected = Some(p.seq.wrapping_add(1));
                    out.push(p);
                } else {
                    break;
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut hdr = RtpHeader::new(PAYLOAD_TYPE_MEDIA, 0xdeadbeef);
        hdr.seq = 4242;
        hdr.timestamp = 123456;
        hdr.marker = true;

        let mut packet = hdr.to_bytes().to_vec();
        packet.extend_from_slice(&[1, 2, 3]);

        let (parsed, payload) = RtpHeader::parse(&packet).unwrap();
        assert_eq!(parsed, hdr);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut packet = RtpHeader::new(96, 1).to_bytes().to_vec();
        packet[0] = 0x40;
        assert!(RtpHeader::parse(&packet).is_none());
        assert!(RtpHeader::parse(&[0x80, 0x60]).is_none());
    }

    #[test]
    fn advance_wraps() {
        let mut hdr = RtpHeader::new(96, 1);
        hdr.seq = u16::MAX;
        hdr.advance(128);
        assert_eq!(hdr.seq, 0);
        assert_eq!(hdr.timestamp, 128);
    }

    fn packet(seq: u16) -> (u16, u32, Vec<u8>) {
        (seq, seq as u32 * 128, vec![seq as u8])
    }

    #[test]
    fn in_order_passthrough() {
        let mut win = SeqWindow::new(4);
        for seq in 10..14 {
            let (s, t, p) = packet(seq);
            let out = win.push(s, t, p);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].seq, seq);
        }
    }

    #[test]
    fn swapped_pair_is_reordered() {
        let mut win = SeqWindow::new(4);
        let _ = win.push(1, 128, vec![1]);

        let (s, t, p) = packet(3);
        assert!(win.push(s, t, p).is_empty());
        let (s, t, p) = packet(2);
        let out = win.push(s, t, p);
        assert_eq!(out.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn late_duplicate_dropped() {
        let mut win = SeqWindow::new(4);
        let _ = win.push(5, 0, vec![]);
        let _ = win.push(6, 0, vec![]);
        assert!(win.push(5, 0, vec![]).is_empty());
    }

    #[test]
    fn window_overflow_skips_gap() {
        let mut win = SeqWindow::new(2);
        let _ = win.push(0, 0, vec![]);
        // Packet 1 is lost; 2, 3, 4 queue up and overflow the window.
        assert!(win.push(2, 256, vec![]).is_empty());
        assert!(win.push(3, 384, vec![]).is_empty());
        let out = win.push(4, 512, vec![]);
        assert_eq!(out.iter().map(|p| p.seq).collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn sequence_wraparound() {
        let mut win = SeqWindow::new(4);
        let _ = win.push(u16::MAX, 0, vec![]);
        let out = win.push(0, 128, vec![]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 0);
    }
}
