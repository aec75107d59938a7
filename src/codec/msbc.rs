//! mSBC: wideband voice over SCO.
//!
//! mSBC is SBC with a fixed configuration (16 kHz mono, 15 blocks,
//! 8 subbands, bit pool 26) framed for the synchronous channel: each
//! 7.5 ms audio block becomes a 2-byte H2 header, a 57-byte frame and one
//! padding byte, so exactly one frame fits a 60-byte SCO packet.

use crate::{ffb::FixedBuffer, Result};

use super::{
    sbc::{Sbc, SbcConfig, SYNCWORD_MSBC},
    StreamCodec,
};

/// H2 header length.
const H2_LEN: usize = 2;
/// Encoded mSBC frame length.
const FRAME_LEN: usize = 57;
/// Total wire length of one framed block, padding included.
const PACKET_LEN: usize = H2_LEN + FRAME_LEN + 1;

/// H2 synchronization byte.
const H2_SYNC: u8 = 0x01;
/// Second H2 byte for sequence numbers 0..3: the 2-bit number encoded
/// twice bitwise.
const H2_SEQ: [u8; 4] = [0x08, 0x38, 0xc8, 0xf8];

/// mSBC stream codec with H2 framing.
#[derive(Debug)]
pub struct Msbc {
    sbc: Sbc,
    seq: u8,
}

impl Msbc {
    /// Create an mSBC codec.
    pub fn new() -> Self {
        Self { sbc: Sbc::new(SbcConfig::msbc()), seq: 0 }
    }
}

impl Default for Msbc {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCodec for Msbc {
    fn id(&self) -> u16 {
        crate::codec_id::MSBC
    }

    fn frame_pcm_bytes(&self) -> usize {
        // 120 samples of 16 kHz mono, 7.5 ms.
        SbcConfig::msbc().frame_pcm_frames() * 2
    }

    fn frame_samples(&self) -> usize {
        SbcConfig::msbc().frame_pcm_frames()
    }

    fn frame_wire_bytes(&self) -> usize {
        PACKET_LEN
    }

    fn encode(&mut self, pcm: &mut FixedBuffer, wire: &mut FixedBuffer) -> Result<usize> {
        let pcm_bytes = self.frame_pcm_bytes();
        let mut frames = 0;

        while pcm.len_out() >= pcm_bytes && wire.len_in() >= PACKET_LEN {
            let samples: Vec<i16> = pcm.head()[..pcm_bytes]
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();

            {
                let out = wire.tail_mut();
                out[0] = H2_SYNC;
                out[1] = H2_SEQ[self.seq as usize];
                let n = self.sbc.encode_frame(&samples, &mut out[H2_LEN..])?;
                debug_assert_eq!(n, FRAME_LEN);
                out[H2_LEN + FRAME_LEN] = 0;
            }
            wire.seek(PACKET_LEN);
            pcm.shift(pcm_bytes);
            self.seq = (self.seq + 1) & 0x03;
            frames += 1;
        }
        Ok(frames)
    }

    fn decode(&mut self, wire: &mut FixedBuffer, pcm: &mut FixedBuffer) -> Result<usize> {
        let pcm_bytes = self.frame_pcm_bytes();
        let mut frames = 0;

        loop {
            // Resynchronize on the H2 header; SCO routinely loses bytes.
            let head = wire.head();
            let start = match head
                .windows(3)
                .position(|w| w[0] == H2_SYNC && H2_SEQ.contains(&w[1]) && w[2] == SYNCWORD_MSBC)
            {
                Some(pos) => pos,
                None => {
                    // Keep the last two bytes, they may be a header split
                    // across packets.
                    let keep = head.len().min(2);
                    let drop = head.len() - keep;
                    if drop > 0 {
                        log::debug!("mSBC: dropping {drop} unsynchronized bytes");
                        wire.shift(drop);
                    }
                    break;
                }
            };
            if start > 0 {
                log::debug!("mSBC: dropping {start} unsynchronized bytes");
                wire.shift(start);
            }
            if wire.len_out() < H2_LEN + FRAME_LEN || pcm.len_in() < pcm_bytes {
                break;
            }

            let mut samples = vec![0i16; pcm_bytes / 2];
            self.sbc.decode_frame(&wire.head()[H2_LEN..H2_LEN + FRAME_LEN], &mut samples)?;
            let out = pcm.tail_mut();
            for (chunk, sample) in out[..pcm_bytes].chunks_exact_mut(2).zip(&samples) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
            pcm.seek(pcm_bytes);
            wire.shift(H2_LEN + FRAME_LEN);
            // Skip the padding byte when it already arrived.
            if wire.len_out() > 0 && wire.head()[0] == 0 {
                wire.shift(1);
            }
            frames += 1;
        }
        Ok(frames)
    }

    fn reset(&mut self) {
        self.sbc.reset();
        self.seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h2_sequence_cycles() {
        let mut codec = Msbc::new();
        let pcm_bytes = codec.frame_pcm_bytes();
        let mut pcm = FixedBuffer::new(pcm_bytes * 4);
        let mut wire = FixedBuffer::new(PACKET_LEN * 4);
        pcm.append(&vec![0u8; pcm_bytes * 4]);

        assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 4);
        let head = wire.head();
        for (i, &seq) in H2_SEQ.iter().enumerate() {
            assert_eq!(head[i * PACKET_LEN], H2_SYNC);
            assert_eq!(head[i * PACKET_LEN + 1], seq);
            assert_eq!(head[i * PACKET_LEN + 2], SYNCWORD_MSBC);
        }
    }

    #[test]
    fn decode_resynchronizes_after_garbage() {
        let mut codec = Msbc::new();
        let pcm_bytes = codec.frame_pcm_bytes();

        let mut pcm = FixedBuffer::new(pcm_bytes);
        let mut wire = FixedBuffer::new(PACKET_LEN * 2);
        pcm.append(&vec![0u8; pcm_bytes]);
        codec.encode(&mut pcm, &mut wire).unwrap();

        let mut dirty = FixedBuffer::new(PACKET_LEN * 2);
        dirty.append(&[0x55, 0xaa, 0x55]);
        dirty.append(wire.head());

        let mut out = FixedBuffer::new(pcm_bytes * 2);
        assert_eq!(codec.decode(&mut dirty, &mut out).unwrap(), 1);
        assert_eq!(out.len_out(), pcm_bytes);
        assert!(out.head().iter().all(|&b| b == 0));
    }

    #[test]
    fn partial_frame_waits_for_more_input() {
        let mut codec = Msbc::new();
        let pcm_bytes = codec.frame_pcm_bytes();

        let mut pcm = FixedBuffer::new(pcm_bytes);
        let mut wire = FixedBuffer::new(PACKET_LEN);
        pcm.append(&vec![0u8; pcm_bytes]);
        codec.encode(&mut pcm, &mut wire).unwrap();

        let mut partial = FixedBuffer::new(PACKET_LEN);
        partial.append(&wire.head()[..30]);
        let mut out = FixedBuffer::new(pcm_bytes);
        assert_eq!(codec.decode(&mut partial, &mut out).unwrap(), 0);
        assert_eq!(partial.len_out(), 30);
    }
}
