//! Capability elements of codecs without a built-in stream
//! implementation.
//!
//! The daemon still has to understand these elements: clients list them
//! through `GetCodecs` and remote endpoints present them during
//! configuration. Selecting one of these codecs for streaming fails with
//! `NotSupported`.

use crate::{Error, ErrorKind, Result};

/// MPEG-2/4 AAC capability element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacCaps {
    /// Object type mask: bit 7 = MPEG-2 AAC LC, bit 6 = MPEG-4 AAC LC.
    pub object_types: u8,
    /// Sampling frequency mask over the 12 defined rates, 8 kHz down to
    /// 96 kHz, MSB first.
    pub frequencies: u16,
    /// Channel mask: bit 3 = 1 channel, bit 2 = 2 channels.
    pub channels: u8,
    /// Variable bit rate supported.
    pub vbr: bool,
    /// Peak bit rate in bits per second.
    pub bitrate: u32,
}

impl AacCaps {
    /// Parse a 6-byte AAC element.
    pub fn parse(element: &[u8]) -> Result<Self> {
        if element.len() < 6 {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "AAC element too short"));
        }
        Ok(Self {
            object_types: element[0],
            frequencies: ((element[1] as u16) << 4) | (element[2] as u16 >> 4),
            channels: element[2] & 0x0c,
            vbr: element[3] & 0x80 != 0,
            bitrate: (((element[3] & 0x7f) as u32) << 16) | ((element[4] as u32) << 8) | element[5] as u32,
        })
    }

    /// Serialize as a 6-byte AAC element.
    pub fn to_bytes(&self) -> [u8; 6] {
        [
            self.object_types,
            (self.frequencies >> 4) as u8,
            ((self.frequencies << 4) as u8 & 0xf0) | self.channels,
            (if self.vbr { 0x80 } else { 0 }) | ((self.bitrate >> 16) as u8 & 0x7f),
            (self.bitrate >> 8) as u8,
            self.bitrate as u8,
        ]
    }
}

/// A2DP vendor codec element header: vendor and codec identifiers
/// followed by codec-specific bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorCaps {
    /// Bluetooth SIG company identifier.
    pub vendor_id: u32,
    /// Vendor-assigned codec identifier.
    pub codec_id: u16,
    /// Codec-specific capability bytes.
    pub data: Vec<u8>,
}

/// aptX vendor and codec identifiers.
pub const APTX_VENDOR_ID: u32 = 0x0000004f;
/// aptX codec identifier.
pub const APTX_CODEC_ID: u16 = 0x0001;
/// LDAC vendor identifier (Sony).
pub const LDAC_VENDOR_ID: u32 = 0x0000012d;
/// LDAC codec identifier.
pub const LDAC_CODEC_ID: u16 = 0x00aa;

impl VendorCaps {
    /// Parse a vendor element.
    pub fn parse(element: &[u8]) -> Result<Self> {
        if element.len() < 6 {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "vendor element too short"));
        }
        Ok(Self {
            vendor_id: u32::from_le_bytes([element[0], element[1], element[2], element[3]]),
            codec_id: u16::from_le_bytes([element[4], element[5]]),
            data: element[6..].to_vec(),
        })
    }

    /// Serialize the element.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(6 + self.data.len());
        v.extend_from_slice(&self.vendor_id.to_le_bytes());
        v.extend_from_slice(&self.codec_id.to_le_bytes());
        v.extend_from_slice(&self.data);
        v
    }

    /// Canonical name when the vendor/codec pair is known.
    pub fn name(&self) -> Option<&'static str> {
        match (self.vendor_id, self.codec_id) {
            (APTX_VENDOR_ID, APTX_CODEC_ID) => Some("aptX"),
            (LDAC_VENDOR_ID, LDAC_CODEC_ID) => Some("LDAC"),
            _ => None,
        }
    }
}

/// MPEG-1/2 audio capability element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpegCaps {
    /// Layer mask: bit 7 = layer I, bit 6 = layer II, bit 5 = layer III.
    pub layers: u8,
    /// CRC protection supported.
    pub crc: bool,
    /// Channel mode mask, same layout as SBC.
    pub modes: u8,
    /// Sampling frequency mask: bit 5 = 16 kHz .. bit 0 = 48 kHz.
    pub frequencies: u8,
    /// Bit rate index mask.
    pub bitrates: u16,
}

impl MpegCaps {
    /// Parse a 4-byte MPEG element.
    pub fn parse(element: &[u8]) -> Result<Self> {
        if element.len() < 4 {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "MPEG element too short"));
        }
        Ok(Self {
            layers: element[0] & 0xe0,
            crc: element[0] & 0x10 != 0,
            modes: element[0] & 0x0f,
            frequencies: element[1] & 0x3f,
            bitrates: (((element[2] & 0x7f) as u16) << 8) | element[3] as u16,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aac_round_trip() {
        let caps = AacCaps {
            object_types: 0xc0,
            frequencies: 0x0ffc,
            channels: 0x0c,
            vbr: true,
            bitrate: 320_000,
        };
        assert_eq!(AacCaps::parse(&caps.to_bytes()).unwrap(), caps);
    }

    #[test]
    fn vendor_identifies_known_codecs() {
        let aptx = VendorCaps { vendor_id: APTX_VENDOR_ID, codec_id: APTX_CODEC_ID, data: vec![0x32] };
        assert_eq!(aptx.name(), Some("aptX"));
        assert_eq!(VendorCaps::parse(&aptx.to_bytes()).unwrap(), aptx);

        let unknown = VendorCaps { vendor_id: 0x1234, codec_id: 0x01, data: vec![] };
        assert_eq!(unknown.name(), None);
    }

    #[test]
    fn short_elements_rejected() {
        assert_eq!(AacCaps::parse(&[0; 3]).unwrap_err().kind, ErrorKind::InvalidArguments);
        assert_eq!(VendorCaps::parse(&[0; 5]).unwrap_err().kind, ErrorKind::InvalidArguments);
        assert_eq!(MpegCaps::parse(&[0; 2]).unwrap_err().kind, ErrorKind::InvalidArguments);
    }
}
