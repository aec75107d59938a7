//! CVSD voice transport.
//!
//! With the CVSD voice setting the controller performs the actual CVSD
//! transcoding; the host side carries raw signed 16-bit PCM and only has
//! to repackage it to the SCO MTU. The adapter is therefore a
//! byte-for-byte passthrough with MTU-sized framing.

use crate::{ffb::FixedBuffer, Result};

use super::StreamCodec;

/// CVSD passthrough codec.
#[derive(Debug)]
pub struct Cvsd {
    mtu: usize,
}

impl Cvsd {
    /// Create a passthrough codec framing packets of `mtu` bytes.
    pub fn new(mtu: usize) -> Self {
        // 48 bytes is the ubiquitous SCO MTU; guard against a zero from
        // an unconfigured socket.
        Self { mtu: if mtu == 0 { 48 } else { mtu } }
    }
}

impl StreamCodec for Cvsd {
    fn id(&self) -> u16 {
        crate::codec_id::CVSD
    }

    fn frame_pcm_bytes(&self) -> usize {
        self.mtu
    }

    fn frame_samples(&self) -> usize {
        self.mtu / 2
    }

    fn frame_wire_bytes(&self) -> usize {
        self.mtu
    }

    fn encode(&mut self, pcm: &mut FixedBuffer, wire: &mut FixedBuffer) -> Result<usize> {
        let mut frames = 0;
        while pcm.len_out() >= self.mtu && wire.len_in() >= self.mtu {
            wire.append(&pcm.head()[..self.mtu]);
            pcm.shift(self.mtu);
            frames += 1;
        }
        Ok(frames)
    }

    fn decode(&mut self, wire: &mut FixedBuffer, pcm: &mut FixedBuffer) -> Result<usize> {
        let mut frames = 0;
        while wire.len_out() >= self.mtu && pcm.len_in() >= self.mtu {
            pcm.append(&wire.head()[..self.mtu]);
            wire.shift(self.mtu);
            frames += 1;
        }
        Ok(frames)
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_bit_identical() {
        let mut codec = Cvsd::new(48);
        let data: Vec<u8> = (0..144).map(|i| i as u8).collect();

        let mut pcm = FixedBuffer::new(256);
        let mut wire = FixedBuffer::new(256);
        let mut out = FixedBuffer::new(256);
        pcm.append(&data);

        assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 3);
        assert_eq!(codec.decode(&mut wire, &mut out).unwrap(), 3);
        assert_eq!(out.head(), &data[..]);
    }

    #[test]
    fn partial_packet_is_held_back() {
        let mut codec = Cvsd::new(48);
        let mut pcm = FixedBuffer::new(256);
        let mut wire = FixedBuffer::new(256);
        pcm.append(&[0u8; 47]);
        assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 0);
        assert_eq!(pcm.len_out(), 47);
    }
}
