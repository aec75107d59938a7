//! Codec adapters.
//!
//! Every codec used by a transport is driven through the [StreamCodec]
//! contract: whole frames are consumed from one side and produced on the
//! other, calls never block, and `encode`/`decode` returning zero frames
//! means more input is needed. Codec state is rebuilt whenever the
//! transport loses its Bluetooth socket.

use crate::{ffb::FixedBuffer, Error, ErrorKind, Result};

pub mod caps;
pub mod cvsd;
pub mod msbc;
pub mod sbc;

/// Frame-oriented encoder/decoder pair driven by the transport I/O task.
pub trait StreamCodec: Send + std::fmt::Debug {
    /// Codec identifier exposed in the transport's `Codec` property.
    fn id(&self) -> u16;

    /// PCM bytes consumed per codec frame.
    fn frame_pcm_bytes(&self) -> usize;

    /// PCM frames (samples per channel) represented by one codec frame.
    fn frame_samples(&self) -> usize;

    /// Wire bytes produced per codec frame.
    ///
    /// Variable-rate codecs report their worst case; the actual length
    /// of each frame is visible through the wire buffer cursor.
    fn frame_wire_bytes(&self) -> usize;

    /// Encode whole frames from `pcm` into `wire`.
    ///
    /// Returns the number of frames produced; zero means more input is
    /// needed.
    fn encode(&mut self, pcm: &mut FixedBuffer, wire: &mut FixedBuffer) -> Result<usize>;

    /// Decode whole frames from `wire` into `pcm`.
    ///
    /// Returns the number of frames produced; zero means more input is
    /// needed. Trailing bytes that do not form a whole frame stay in
    /// `wire`.
    fn decode(&mut self, wire: &mut FixedBuffer, pcm: &mut FixedBuffer) -> Result<usize>;

    /// Drop all internal state, e.g. after the Bluetooth socket is lost.
    fn reset(&mut self);
}

/// A2DP codec known to the daemon, for capability listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecInfo {
    /// Canonical name, e.g. `SBC`.
    pub name: &'static str,
    /// Identifier for the `Codec` property.
    pub id: u16,
    /// Whether an encoder/decoder pair is built in.
    pub has_stream: bool,
}

/// A2DP codecs the daemon knows about.
///
/// Codecs without a built-in stream implementation are listed so that
/// clients see the full capability set, but selecting them fails with
/// `NotSupported`.
pub const A2DP_CODECS: &[CodecInfo] = &[
    CodecInfo { name: "SBC", id: crate::codec_id::SBC, has_stream: true },
    CodecInfo { name: "MPEG", id: crate::codec_id::MPEG12, has_stream: false },
    CodecInfo { name: "AAC", id: crate::codec_id::AAC, has_stream: false },
    CodecInfo { name: "aptX", id: crate::codec_id::VENDOR, has_stream: false },
    CodecInfo { name: "LDAC", id: crate::codec_id::VENDOR, has_stream: false },
];

/// Look up an A2DP codec by its canonical name.
pub fn a2dp_codec_by_name(name: &str) -> Option<&'static CodecInfo> {
    A2DP_CODECS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Create the stream codec for an A2DP transport from its configuration
/// element.
pub fn new_a2dp_stream(codec: u16, configuration: &[u8]) -> Result<Box<dyn StreamCodec>> {
    match codec {
        crate::codec_id::SBC => {
            let config = sbc::SbcConfig::from_a2dp_element(configuration)?;
            Ok(Box::new(sbc::Sbc::new(config)))
        }
        _ => Err(Error::with_message(ErrorKind::NotSupported, format!("no stream support for codec {codec:#06x}"))),
    }
}

/// Create the stream codec for an SCO transport.
///
/// `mtu` is the SCO write MTU; CVSD forwards PCM in MTU-sized packets.
pub fn new_sco_stream(codec: u16, mtu: usize) -> Result<Box<dyn StreamCodec>> {
    match codec {
        crate::codec_id::CVSD => Ok(Box::new(cvsd::Cvsd::new(mtu))),
        crate::codec_id::MSBC => Ok(Box::new(msbc::Msbc::new())),
        _ => Err(Error::with_message(ErrorKind::NotSupported, format!("no stream support for codec {codec:#06x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_lookup() {
        assert_eq!(a2dp_codec_by_name("sbc").unwrap().id, crate::codec_id::SBC);
        assert!(a2dp_codec_by_name("opus").is_none());
    }

    #[test]
    fn unsupported_codecs_rejected() {
        assert_eq!(
            new_a2dp_stream(crate::codec_id::AAC, &[]).unwrap_err().kind,
            ErrorKind::NotSupported
        );
        assert_eq!(new_sco_stream(0x0004, 48).unwrap_err().kind, ErrorKind::NotSupported);
    }
}
