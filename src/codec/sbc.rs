//! SBC subband codec: encoder, decoder and A2DP capability element.

use crate::{ffb::FixedBuffer, Error, ErrorKind, Result};

use super::StreamCodec;

const MAX_SUBBANDS: usize = 8;
const MAX_BLOCKS: usize = 16;
const MAX_CHANNELS: usize = 2;
/// Filter history depth, in blocks of `subbands` samples.
const FILTER_DEPTH: usize = 10;

/// SBC frame sync word.
const SYNCWORD: u8 = 0x9c;
/// mSBC frame sync word.
pub(crate) const SYNCWORD_MSBC: u8 = 0xad;

/// Largest possible SBC frame.
pub const MAX_FRAME_LEN: usize = 512;

// Prototype filter coefficients for 8-subband analysis, 10 taps per
// subband phase.
const PROTO_8_80: [i32; 80] = [
    0, 131, -2877, 5705, -9735, 25068, -36987, 108810, -212481, 706833,
    1, -127, 2919, -5704, 9870, -15248, 40855, -107119, 229395, -664312,
    2, -238, 1440, -3217, 3227, -6530, 16155, -29167, 57133, -203322,
    1, -26, 272, -955, -15, -1322, -1722, 822, -10336, 11269,
    0, 0, -15, 48, -166, 349, -1252, 2385, -7316, 18146,
    0, 1, -11, 43, -130, 216, -417, 937, -2481, 5366,
    0, 0, -3, 10, -37, 45, -82, 105, -147, 153,
    0, 0, 0, 1, -4, 6, -7, 9, -3, 3,
];

// Prototype filter coefficients for 4-subband analysis.
const PROTO_4_40: [i32; 40] = [
    0, 358, -5779, 11413, -19470, 50139, -73976, 217238, -424964, 1415458,
    2, -253, 5821, -11408, 19757, -30496, 81807, -214238, 458696, -1328624,
    0, 0, -15, 97, -332, 698, -2504, 4762, -14631, 36302,
    0, 0, -3, 9, -43, 59, -104, 122, -67, 70,
];

/// Q-format shift of the prototype filter tables.
const PROTO_SHIFT: u32 = 19;

// Cosine modulation matrix, Q14.
const COS_8: [[i32; 8]; 8] = [
    [0x2d41, 0x2d41, 0x2d41, 0x2d41, 0x2d41, 0x2d41, 0x2d41, 0x2d41],
    [0x3b21, 0x3b21, 0x187e, -0x187e, -0x3b21, -0x3b21, -0x187e, 0x187e],
    [0x3b21, 0, -0x3b21, -0x3b21, 0, 0x3b21, 0x3b21, 0],
    [0x3b21, -0x187e, -0x3b21, 0x187e, 0x3b21, -0x187e, -0x3b21, 0x187e],
    [0x2d41, -0x2d41, -0x2d41, 0x2d41, 0x2d41, -0x2d41, -0x2d41, 0x2d41],
    [0x187e, -0x3b21, 0x187e, 0x187e, -0x3b21, 0x187e, 0x187e, -0x3b21],
    [0, -0x3b21, 0x3b21, 0, -0x3b21, 0x3b21, 0, -0x3b21],
    [-0x187e, -0x187e, 0x3b21, -0x3b21, 0x187e, 0x187e, -0x3b21, 0x3b21],
];

const COS_4: [[i32; 4]; 4] = [
    [0x2d41, 0x2d41, 0x2d41, 0x2d41],
    [0x3b21, 0x187e, -0x187e, -0x3b21],
    [0x2d41, -0x2d41, -0x2d41, 0x2d41],
    [0x187e, -0x3b21, 0x3b21, -0x187e],
];

// Psychoacoustic loudness offsets, [frequency][subband].
const LOUDNESS_8: [[i8; 8]; 4] = [
    [-1, 0, 0, 0, 0, 0, 0, 1],
    [-2, 0, 0, 0, 0, 0, 1, 2],
    [-2, 0, 0, 0, 0, 0, 1, 2],
    [-2, 0, 0, 0, 0, 0, 1, 2],
];

const LOUDNESS_4: [[i8; 4]; 4] = [
    [-1, 0, 0, 1],
    [-2, 0, 0, 2],
    [-2, 0, 0, 2],
    [-2, 0, 0, 2],
];

/// 2^(scale_factor + 1), the dequantization range per scale factor.
const SCALE_LEVELS: [i32; 16] =
    [2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

/// Sampling frequency of an SBC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Frequency {
    /// 16 kHz.
    Hz16000 = 0,
    /// 32 kHz.
    Hz32000 = 1,
    /// 44.1 kHz.
    Hz44100 = 2,
    /// 48 kHz.
    Hz48000 = 3,
}

impl Frequency {
    /// Frequency in Hertz.
    pub const fn hz(self) -> u32 {
        match self {
            Self::Hz16000 => 16000,
            Self::Hz32000 => 32000,
            Self::Hz44100 => 44100,
            Self::Hz48000 => 48000,
        }
    }
}

/// Channel mode of an SBC stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelMode {
    /// One channel.
    Mono = 0,
    /// Two independently coded channels.
    DualChannel = 1,
    /// Two channels, shared bit pool.
    Stereo = 2,
    /// Two channels with mid/side coding of correlated subbands.
    JointStereo = 3,
}

impl ChannelMode {
    /// Number of audio channels.
    pub const fn channels(self) -> usize {
        match self {
            Self::Mono => 1,
            _ => 2,
        }
    }
}

/// Bit allocation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Allocation {
    /// Allocation proportional to signal level.
    Snr = 0,
    /// Psychoacoustically weighted allocation.
    Loudness = 1,
}

/// SBC stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcConfig {
    /// Sampling frequency.
    pub frequency: Frequency,
    /// Channel mode.
    pub mode: ChannelMode,
    /// Blocks per frame: 4, 8, 12 or 16 (15 for the mSBC variant).
    pub blocks: usize,
    /// Subbands: 4 or 8.
    pub subbands: usize,
    /// Bit allocation method.
    pub allocation: Allocation,
    /// Bit pool.
    pub bitpool: u8,
    /// Whether this is the mSBC variant (0xAD sync word, implied
    /// parameters).
    pub msbc: bool,
}

impl SbcConfig {
    /// The fixed mSBC configuration: 16 kHz mono, 15 blocks, 8 subbands,
    /// loudness allocation, bit pool 26.
    pub const fn msbc() -> Self {
        Self {
            frequency: Frequency::Hz16000,
            mode: ChannelMode::Mono,
            blocks: 15,
            subbands: 8,
            allocation: Allocation::Loudness,
            bitpool: 26,
            msbc: true,
        }
    }

    /// Number of audio channels.
    pub const fn channels(&self) -> usize {
        self.mode.channels()
    }

    /// PCM frames (samples per channel) per SBC frame.
    pub const fn frame_pcm_frames(&self) -> usize {
        self.blocks * self.subbands
    }

    /// Encoded frame length in bytes.
    pub fn frame_len(&self) -> usize {
        let join_bits = if self.mode == ChannelMode::JointStereo { self.subbands } else { 0 };
        let sf_bits = 4 * self.subbands * self.channels();
        let audio_bits = match self.mode {
            ChannelMode::Mono | ChannelMode::DualChannel => {
                self.blocks * self.bitpool as usize * self.channels()
            }
            ChannelMode::Stereo | ChannelMode::JointStereo => self.blocks * self.bitpool as usize,
        };
        4 + (join_bits + sf_bits + audio_bits + 7) / 8
    }

    /// Validate parameter combinations.
    pub fn is_valid(&self) -> bool {
        if !matches!(self.subbands, 4 | 8) {
            return false;
        }
        if self.msbc {
            return *self == Self::msbc();
        }
        if !matches!(self.blocks, 4 | 8 | 12 | 16) {
            return false;
        }
        let max_bitpool = match self.mode {
            ChannelMode::Mono | ChannelMode::DualChannel => 16 * self.subbands,
            ChannelMode::Stereo | ChannelMode::JointStereo => 32 * self.subbands,
        };
        (2..=250.min(max_bitpool)).contains(&(self.bitpool as usize))
    }

    /// Parse a configured A2DP SBC element (exactly one bit per field).
    pub fn from_a2dp_element(element: &[u8]) -> Result<Self> {
        let caps = SbcCaps::parse(element)?;
        caps.configured()
    }

    /// Serialize as a configured A2DP SBC element.
    pub fn to_a2dp_element(&self) -> [u8; 4] {
        let freq_bit = 0x80u8 >> self.frequency as u8;
        let mode_bit = 0x08u8 >> self.mode as u8;
        let blocks_bit = match self.blocks {
            4 => 0x80,
            8 => 0x40,
            12 => 0x20,
            _ => 0x10,
        };
        let subbands_bit = if self.subbands == 4 { 0x08 } else { 0x04 };
        let alloc_bit = if self.allocation == Allocation::Snr { 0x02 } else { 0x01 };
        [freq_bit | mode_bit, blocks_bit | subbands_bit | alloc_bit, self.bitpool, self.bitpool]
    }
}

/// A2DP SBC capability element: bit masks over the configuration space
/// plus the supported bit pool range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcCaps {
    /// Sampling frequency mask, bit 7 = 16 kHz .. bit 4 = 48 kHz.
    pub frequencies: u8,
    /// Channel mode mask, bit 3 = mono .. bit 0 = joint stereo.
    pub modes: u8,
    /// Block length mask, bit 7 = 4 blocks .. bit 4 = 16 blocks.
    pub blocks: u8,
    /// Subband mask, bit 3 = 4 subbands, bit 2 = 8 subbands.
    pub subbands: u8,
    /// Allocation mask, bit 1 = SNR, bit 0 = loudness.
    pub allocations: u8,
    /// Minimum bit pool.
    pub min_bitpool: u8,
    /// Maximum bit pool.
    pub max_bitpool: u8,
}

impl SbcCaps {
    /// Everything the built-in codec supports.
    pub const LOCAL: SbcCaps = SbcCaps {
        frequencies: 0xf0,
        modes: 0x0f,
        blocks: 0xf0,
        subbands: 0x0c,
        allocations: 0x03,
        min_bitpool: 2,
        max_bitpool: 250,
    };

    /// Parse a 4-byte SBC element.
    pub fn parse(element: &[u8]) -> Result<Self> {
        if element.len() < 4 {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "SBC element too short"));
        }
        Ok(Self {
            frequencies: element[0] & 0xf0,
            modes: element[0] & 0x0f,
            blocks: element[1] & 0xf0,
            subbands: element[1] & 0x0c,
            allocations: element[1] & 0x03,
            min_bitpool: element[2],
            max_bitpool: element[3],
        })
    }

    /// Serialize as a 4-byte SBC element.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            self.frequencies | self.modes,
            self.blocks | self.subbands | self.allocations,
            self.min_bitpool,
            self.max_bitpool,
        ]
    }

    /// Intersect with another capability set.
    pub fn intersect(&self, other: &SbcCaps) -> SbcCaps {
        SbcCaps {
            frequencies: self.frequencies & other.frequencies,
            modes: self.modes & other.modes,
            blocks: self.blocks & other.blocks,
            subbands: self.subbands & other.subbands,
            allocations: self.allocations & other.allocations,
            min_bitpool: self.min_bitpool.max(other.min_bitpool),
            max_bitpool: self.max_bitpool.min(other.max_bitpool),
        }
    }

    /// Choose the best configuration from this capability set.
    ///
    /// Preference order follows stream quality: 44.1/48 kHz before the
    /// low rates, joint stereo before mono, 16 blocks and 8 subbands,
    /// loudness allocation. `bitpool` is clamped into the supported
    /// range.
    pub fn select(&self, bitpool: u8) -> Result<SbcConfig> {
        let frequency = [Frequency::Hz44100, Frequency::Hz48000, Frequency::Hz32000, Frequency::Hz16000]
            .into_iter()
            .find(|f| self.frequencies & (0x80 >> *f as u8) != 0)
            .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "no common SBC frequency"))?;
        let mode = [
            ChannelMode::JointStereo,
            ChannelMode::Stereo,
            ChannelMode::DualChannel,
            ChannelMode::Mono,
        ]
        .into_iter()
        .find(|m| self.modes & (0x08 >> *m as u8) != 0)
        .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "no common SBC channel mode"))?;
        let blocks = [(16, 0x10u8), (12, 0x20), (8, 0x40), (4, 0x80)]
            .into_iter()
            .find(|(_, bit)| self.blocks & bit != 0)
            .map(|(n, _)| n)
            .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "no common SBC block length"))?;
        let subbands = if self.subbands & 0x04 != 0 {
            8
        } else if self.subbands & 0x08 != 0 {
            4
        } else {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "no common SBC subbands"));
        };
        let allocation = if self.allocations & 0x01 != 0 {
            Allocation::Loudness
        } else if self.allocations & 0x02 != 0 {
            Allocation::Snr
        } else {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "no common SBC allocation"));
        };
        if self.min_bitpool > self.max_bitpool {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "empty SBC bitpool range"));
        }

        let config = SbcConfig {
            frequency,
            mode,
            blocks,
            subbands,
            allocation,
            bitpool: bitpool.clamp(self.min_bitpool, self.max_bitpool),
            msbc: false,
        };
        if !config.is_valid() {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "invalid SBC configuration"));
        }
        Ok(config)
    }

    /// Interpret this element as a configured one: exactly one bit per
    /// field.
    pub fn configured(&self) -> Result<SbcConfig> {
        let one_bit = |v: u8| v != 0 && v & (v - 1) == 0;
        if !(one_bit(self.frequencies)
            && one_bit(self.modes)
            && one_bit(self.blocks)
            && one_bit(self.subbands)
            && one_bit(self.allocations))
        {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "SBC element is not a configuration"));
        }
        // Min and max bitpool coincide in a configuration; be lenient and
        // take the maximum.
        self.select(self.max_bitpool)
    }
}

type SubbandSamples = [[[i32; MAX_SUBBANDS]; MAX_BLOCKS]; MAX_CHANNELS];
type ScaleFactors = [[u8; MAX_SUBBANDS]; MAX_CHANNELS];
type BitsPerSubband = [[u8; MAX_SUBBANDS]; MAX_CHANNELS];

fn proto(subbands: usize, idx: usize) -> i64 {
    if subbands == 8 {
        PROTO_8_80[idx] as i64
    } else {
        PROTO_4_40[idx] as i64
    }
}

fn cos_mod(subbands: usize, k: usize, i: usize) -> i64 {
    if subbands == 8 {
        COS_8[k][i] as i64
    } else {
        COS_4[k][i] as i64
    }
}

/// Polyphase analysis filter state for both channels.
#[derive(Debug)]
struct Analyzer {
    x: [[i32; MAX_SUBBANDS * FILTER_DEPTH]; MAX_CHANNELS],
}

impl Analyzer {
    fn new() -> Self {
        Self { x: [[0; MAX_SUBBANDS * FILTER_DEPTH]; MAX_CHANNELS] }
    }

    fn reset(&mut self) {
        self.x = [[0; MAX_SUBBANDS * FILTER_DEPTH]; MAX_CHANNELS];
    }

    /// Run one frame of interleaved PCM through the filterbank.
    fn process(&mut self, pcm: &[i16], config: &SbcConfig) -> SubbandSamples {
        let sb_count = config.subbands;
        let channels = config.channels();
        let mut out: SubbandSamples = [[[0; MAX_SUBBANDS]; MAX_BLOCKS]; MAX_CHANNELS];

        for blk in 0..config.blocks {
            for ch in 0..channels {
                let history = &mut self.x[ch];
                let depth = sb_count * FILTER_DEPTH;
                for i in (sb_count..depth).rev() {
                    history[i] = history[i - sb_count];
                }
                let base = blk * sb_count * channels + ch;
                for i in 0..sb_count {
                    history[i] = pcm[base + (sb_count - 1 - i) * channels] as i32;
                }

                // Window, then cosine modulation.
                let mut y = [0i64; MAX_SUBBANDS];
                for j in 0..FILTER_DEPTH {
                    for (i, y) in y.iter_mut().enumerate().take(sb_count) {
                        let idx = j * sb_count + i;
                        *y += (history[idx] as i64 * proto(sb_count, idx)) >> PROTO_SHIFT;
                    }
                }
                for k in 0..sb_count {
                    let mut sum = 0i64;
                    for (i, y) in y.iter().enumerate().take(sb_count) {
                        sum += (*y * cos_mod(sb_count, k, i)) >> 14;
                    }
                    out[ch][blk][k] = sum.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                }
            }
        }
        out
    }
}

/// Synthesis filter state, the adjoint of [Analyzer].
#[derive(Debug)]
struct Synthesizer {
    v: [[i64; MAX_SUBBANDS * FILTER_DEPTH]; MAX_CHANNELS],
}

impl Synthesizer {
    fn new() -> Self {
        Self { v: [[0; MAX_SUBBANDS * FILTER_DEPTH]; MAX_CHANNELS] }
    }

    fn reset(&mut self) {
        self.v = [[0; MAX_SUBBANDS * FILTER_DEPTH]; MAX_CHANNELS];
    }

    /// Synthesize one frame of interleaved PCM from subband samples.
    fn process(&mut self, samples: &SubbandSamples, config: &SbcConfig, pcm: &mut [i16]) {
        let sb_count = config.subbands;
        let channels = config.channels();
        // Compensates the transform gain of the modulation matrix pair.
        let mod_shift = 14 + sb_count.trailing_zeros() - 1;

        for blk in 0..config.blocks {
            for ch in 0..channels {
                let mut u = [0i64; MAX_SUBBANDS];
                for (i, u) in u.iter_mut().enumerate().take(sb_count) {
                    let mut sum = 0i64;
                    for k in 0..sb_count {
                        sum += samples[ch][blk][k] as i64 * cos_mod(sb_count, k, i);
                    }
                    *u = sum >> mod_shift;
                }

                let history = &mut self.v[ch];
                for j in 0..FILTER_DEPTH {
                    for (i, u) in u.iter().enumerate().take(sb_count) {
                        let idx = j * sb_count + i;
                        history[idx] += (*u * proto(sb_count, idx)) >> PROTO_SHIFT;
                    }
                }

                let base = blk * sb_count * channels + ch;
                for i in 0..sb_count {
                    let sample = history[i].clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                    pcm[base + (sb_count - 1 - i) * channels] = sample;
                }

                let depth = sb_count * FILTER_DEPTH;
                for i in 0..depth - sb_count {
                    history[i] = history[i + sb_count];
                }
                for i in depth - sb_count..depth {
                    history[i] = 0;
                }
            }
        }
    }
}

fn scale_factor_for(max_val: i32) -> u8 {
    if max_val == 0 {
        return 0;
    }
    let bits_needed = 32 - max_val.leading_zeros();
    (bits_needed.saturating_sub(1) as u8).min(15)
}

fn calc_scale_factors(samples: &SubbandSamples, config: &SbcConfig) -> ScaleFactors {
    let mut sf: ScaleFactors = [[0; MAX_SUBBANDS]; MAX_CHANNELS];
    for ch in 0..config.channels() {
        for sb in 0..config.subbands {
            let mut max_val = 0i32;
            for blk in 0..config.blocks {
                max_val = max_val.max(samples[ch][blk][sb].abs());
            }
            sf[ch][sb] = scale_factor_for(max_val);
        }
    }
    sf
}

/// Decide per-subband mid/side coding and rewrite the samples.
///
/// Returns the join flags, one bit per subband with the highest subband
/// in the most significant position.
fn joint_stereo_encode(samples: &mut SubbandSamples, sf: &ScaleFactors, config: &SbcConfig) -> u8 {
    if config.mode != ChannelMode::JointStereo {
        return 0;
    }
    let sb_count = config.subbands;
    // The highest subband stays L/R so the flag bits fit the frame field.
    let join_limit = if sb_count == 8 { 7 } else { 4 };
    let mut join_flags = 0u8;

    for sb in 0..join_limit {
        let sf_diff = sf[0][sb].abs_diff(sf[1][sb]);
        if sf_diff > 4 {
            continue;
        }

        let mut product = 0i64;
        let mut left_sq = 0i64;
        let mut right_sq = 0i64;
        for blk in 0..config.blocks {
            let l = samples[0][blk][sb] as i64;
            let r = samples[1][blk][sb] as i64;
            product += l * r;
            left_sq += l * l;
            right_sq += r * r;
        }
        if left_sq == 0 || right_sq == 0 {
            continue;
        }
        // Mid/side pays off when the channels correlate.
        let threshold = (left_sq >> 2) * (right_sq >> 2);
        let product_sq = (product >> 2) * (product >> 2);
        if product_sq < threshold {
            continue;
        }

        join_flags |= 1 << (sb_count - 1 - sb);
        for blk in 0..config.blocks {
            let l = samples[0][blk][sb];
            let r = samples[1][blk][sb];
            samples[0][blk][sb] = (l + r) >> 1;
            samples[1][blk][sb] = (l - r) >> 1;
        }
    }
    join_flags
}

fn joint_stereo_decode(samples: &mut SubbandSamples, join_flags: u8, config: &SbcConfig) {
    if config.mode != ChannelMode::JointStereo {
        return;
    }
    let sb_count = config.subbands;
    for sb in 0..sb_count {
        if join_flags & (1 << (sb_count - 1 - sb)) == 0 {
            continue;
        }
        for blk in 0..config.blocks {
            let mid = samples[0][blk][sb];
            let side = samples[1][blk][sb];
            samples[0][blk][sb] = mid + side;
            samples[1][blk][sb] = mid - side;
        }
    }
}

/// Distribute the bit pool over subbands.
///
/// Deterministic in `(scale factors, configuration, join flags)` only, so
/// encoder and decoder always agree.
fn allocate_bits(sf: &ScaleFactors, config: &SbcConfig, join_flags: u8) -> BitsPerSubband {
    let sb_count = config.subbands;
    let channels = config.channels();
    let freq_idx = config.frequency as usize;

    let mut bitneed = [[0i32; MAX_SUBBANDS]; MAX_CHANNELS];
    for ch in 0..channels {
        for sb in 0..sb_count {
            let v = sf[ch][sb] as i32;
            bitneed[ch][sb] = match config.allocation {
                Allocation::Snr => v,
                Allocation::Loudness => {
                    if v == 0 {
                        -5
                    } else {
                        let offset = if sb_count == 8 {
                            LOUDNESS_8[freq_idx][sb] as i32
                        } else {
                            LOUDNESS_4[freq_idx][sb] as i32
                        };
                        if v > offset {
                            v - offset
                        } else {
                            (v - offset) / 2
                        }
                    }
                }
            };
        }
    }

    let mut bits: BitsPerSubband = [[0; MAX_SUBBANDS]; MAX_CHANNELS];
    let mut remaining = config.bitpool as i32;

    let max_bitneed = (0..channels)
        .flat_map(|ch| bitneed[ch][..sb_count].iter().copied())
        .max()
        .unwrap_or(0);

    // Slice from the loudest level downwards.
    let mut bitslice = max_bitneed + 1;
    while bitslice > 0 && remaining > 0 {
        bitslice -= 1;
        let mut needed = 0i32;
        for ch in 0..channels {
            for sb in 0..sb_count {
                if bitneed[ch][sb] == bitslice + 1 {
                    needed += 2;
                } else if bitneed[ch][sb] > bitslice && bits[ch][sb] > 0 {
                    needed += 1;
                }
            }
        }
        if needed > remaining {
            continue;
        }
        for ch in 0..channels {
            for sb in 0..sb_count {
                if bitneed[ch][sb] == bitslice + 1 {
                    bits[ch][sb] = 2;
                } else if bitneed[ch][sb] > bitslice && bits[ch][sb] > 0 {
                    bits[ch][sb] += 1;
                }
            }
        }
        remaining -= needed;
    }

    // Spread any leftovers over subbands that still have headroom.
    loop {
        let mut allocated = false;
        for ch in 0..channels {
            for sb in 0..sb_count {
                if remaining <= 0 {
                    break;
                }
                if bits[ch][sb] >= 16 || bitneed[ch][sb] <= 0 {
                    continue;
                }
                if bits[ch][sb] == 0 {
                    if remaining >= 2 {
                        bits[ch][sb] = 2;
                        remaining -= 2;
                        allocated = true;
                    }
                } else {
                    bits[ch][sb] += 1;
                    remaining -= 1;
                    allocated = true;
                }
            }
        }
        if remaining <= 0 || !allocated {
            break;
        }
    }

    // Joined subbands are coded against a shared quantization grid.
    if config.mode == ChannelMode::JointStereo {
        for sb in 0..sb_count {
            if join_flags & (1 << (sb_count - 1 - sb)) != 0 {
                let max_bits = bits[0][sb].max(bits[1][sb]);
                bits[0][sb] = max_bits;
                bits[1][sb] = max_bits;
            }
        }
    }

    bits
}

fn quantize_sample(sample: i32, bits: u8, level: i32) -> u16 {
    let levels = (1u32 << bits) - 1;
    let normalized = ((sample as i64) << 15) / level as i64;
    let offset = normalized + 32768;
    let q = (offset * levels as i64) >> 16;
    q.clamp(0, levels as i64) as u16
}

fn dequantize_sample(q: u16, bits: u8, level: i32) -> i32 {
    let levels = (1u32 << bits) - 1;
    let normalized = (((q as i64) << 16) + (1 << 15)) / levels as i64 - 32768;
    ((normalized * level as i64) >> 15) as i32
}

/// CRC-8 over the frame with polynomial 0x1D, skipping the sync word and
/// the CRC byte itself.
fn frame_crc(data: &[u8]) -> u8 {
    const POLY: u8 = 0x1d;
    let mut crc: u8 = 0x0f;
    for (i, byte) in data.iter().enumerate() {
        if i == 0 || i == 3 {
            continue;
        }
        for bit in 0..8 {
            let msb = (crc >> 7) & 1;
            crc <<= 1;
            if ((byte >> (7 - bit)) & 1) ^ msb == 1 {
                crc ^= POLY;
            }
        }
    }
    crc
}

struct BitWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
    acc: u32,
    acc_bits: u8,
}

impl<'a> BitWriter<'a> {
    fn new(out: &'a mut [u8], pos: usize) -> Self {
        Self { out, pos, acc: 0, acc_bits: 0 }
    }

    fn write(&mut self, value: u32, bits: u8) {
        self.acc = (self.acc << bits) | (value & ((1u32 << bits) - 1));
        self.acc_bits += bits;
        while self.acc_bits >= 8 {
            self.acc_bits -= 8;
            self.out[self.pos] = ((self.acc >> self.acc_bits) & 0xff) as u8;
            self.pos += 1;
        }
    }

    fn flush(&mut self) -> usize {
        if self.acc_bits > 0 {
            let pad = 8 - self.acc_bits;
            self.out[self.pos] = ((self.acc << pad) & 0xff) as u8;
            self.pos += 1;
            self.acc = 0;
            self.acc_bits = 0;
        }
        self.pos
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8], byte_offset: usize) -> Self {
        Self { data, bit: byte_offset * 8 }
    }

    fn read(&mut self, bits: u8) -> Option<u32> {
        let mut v = 0u32;
        for _ in 0..bits {
            let byte = self.data.get(self.bit / 8)?;
            let b = (byte >> (7 - self.bit % 8)) & 1;
            v = (v << 1) | b as u32;
            self.bit += 1;
        }
        Some(v)
    }
}

fn pack_frame(
    config: &SbcConfig, join_flags: u8, sf: &ScaleFactors, bits: &BitsPerSubband,
    quantized: &[[[u16; MAX_SUBBANDS]; MAX_BLOCKS]; MAX_CHANNELS], out: &mut [u8],
) -> usize {
    let frame_len = config.frame_len();
    debug_assert!(out.len() >= frame_len);

    if config.msbc {
        out[0] = SYNCWORD_MSBC;
        out[1] = 0;
        out[2] = 0;
    } else {
        out[0] = SYNCWORD;
        let blocks_bits = match config.blocks {
            4 => 0u8,
            8 => 1,
            12 => 2,
            _ => 3,
        };
        let subband_bit = if config.subbands == 8 { 1 } else { 0 };
        out[1] = ((config.frequency as u8) << 6)
            | (blocks_bits << 4)
            | ((config.mode as u8) << 2)
            | ((config.allocation as u8) << 1)
            | subband_bit;
        out[2] = config.bitpool;
    }
    out[3] = 0;

    let mut w = BitWriter::new(&mut out[..], 4);
    if config.mode == ChannelMode::JointStereo {
        w.write(join_flags as u32, config.subbands as u8);
    }
    for ch in 0..config.channels() {
        for sb in 0..config.subbands {
            w.write(sf[ch][sb] as u32, 4);
        }
    }
    for blk in 0..config.blocks {
        for ch in 0..config.channels() {
            for sb in 0..config.subbands {
                if bits[ch][sb] > 0 {
                    w.write(quantized[ch][blk][sb] as u32, bits[ch][sb]);
                }
            }
        }
    }
    let packed = w.flush();
    debug_assert!(packed <= frame_len);
    // Unused reserved audio bits are zero so frames are deterministic.
    for byte in out[packed..frame_len].iter_mut() {
        *byte = 0;
    }
    out[3] = frame_crc(&out[..frame_len]);
    frame_len
}

fn unpack_frame(config: &SbcConfig, frame: &[u8]) -> Result<(u8, ScaleFactors, SubbandSamples)> {
    let expected_sync = if config.msbc { SYNCWORD_MSBC } else { SYNCWORD };
    if frame.len() < config.frame_len() || frame[0] != expected_sync {
        return Err(Error::with_message(ErrorKind::InvalidArguments, "malformed SBC frame"));
    }
    let crc = frame_crc(&frame[..config.frame_len()]);
    if crc != frame[3] {
        // Keep decoding: a flipped bit in the payload is preferable to a
        // dropped frame on a voice link.
        log::debug!("SBC frame CRC mismatch: {:#04x} != {:#04x}", crc, frame[3]);
    }

    let mut r = BitReader::new(frame, 4);
    let truncated = || Error::with_message(ErrorKind::InvalidArguments, "truncated SBC frame");

    let join_flags = if config.mode == ChannelMode::JointStereo {
        r.read(config.subbands as u8).ok_or_else(truncated)? as u8
    } else {
        0
    };

    let mut sf: ScaleFactors = [[0; MAX_SUBBANDS]; MAX_CHANNELS];
    for ch in 0..config.channels() {
        for sb in 0..config.subbands {
            sf[ch][sb] = r.read(4).ok_or_else(truncated)? as u8;
        }
    }

    let bits = allocate_bits(&sf, config, join_flags);
    let mut samples: SubbandSamples = [[[0; MAX_SUBBANDS]; MAX_BLOCKS]; MAX_CHANNELS];
    for blk in 0..config.blocks {
        for ch in 0..config.channels() {
            for sb in 0..config.subbands {
                if bits[ch][sb] > 0 {
                    let q = r.read(bits[ch][sb]).ok_or_else(truncated)? as u16;
                    samples[ch][blk][sb] =
                        dequantize_sample(q, bits[ch][sb], SCALE_LEVELS[sf[ch][sb] as usize]);
                }
            }
        }
    }
    Ok((join_flags, sf, samples))
}

/// SBC stream codec.
#[derive(Debug)]
pub struct Sbc {
    config: SbcConfig,
    analyzer: Analyzer,
    synthesizer: Synthesizer,
}

impl Sbc {
    /// Create a codec for the given configuration.
    pub fn new(config: SbcConfig) -> Self {
        Self { config, analyzer: Analyzer::new(), synthesizer: Synthesizer::new() }
    }

    /// Stream configuration.
    pub fn config(&self) -> &SbcConfig {
        &self.config
    }

    /// Encode exactly one frame of interleaved PCM.
    pub fn encode_frame(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let needed = self.config.frame_pcm_frames() * self.config.channels();
        if pcm.len() < needed {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "not enough PCM for one frame"));
        }
        if out.len() < self.config.frame_len() {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "output buffer too small"));
        }

        let mut samples = self.analyzer.process(pcm, &self.config);
        let sf_pre = calc_scale_factors(&samples, &self.config);
        let join_flags = joint_stereo_encode(&mut samples, &sf_pre, &self.config);
        let sf = calc_scale_factors(&samples, &self.config);
        let bits = allocate_bits(&sf, &self.config, join_flags);

        let mut quantized = [[[0u16; MAX_SUBBANDS]; MAX_BLOCKS]; MAX_CHANNELS];
        for ch in 0..self.config.channels() {
            for sb in 0..self.config.subbands {
                if bits[ch][sb] == 0 {
                    continue;
                }
                let level = SCALE_LEVELS[sf[ch][sb] as usize];
                for blk in 0..self.config.blocks {
                    quantized[ch][blk][sb] = quantize_sample(samples[ch][blk][sb], bits[ch][sb], level);
                }
            }
        }

        Ok(pack_frame(&self.config, join_flags, &sf, &bits, &quantized, out))
    }

    /// Decode exactly one frame into interleaved PCM.
    pub fn decode_frame(&mut self, frame: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let produced = self.config.frame_pcm_frames() * self.config.channels();
        if pcm.len() < produced {
            return Err(Error::with_message(ErrorKind::InvalidArguments, "PCM buffer too small"));
        }
        let (join_flags, _sf, mut samples) = unpack_frame(&self.config, frame)?;
        joint_stereo_decode(&mut samples, join_flags, &self.config);
        self.synthesizer.process(&samples, &self.config, pcm);
        Ok(produced)
    }
}

impl StreamCodec for Sbc {
    fn id(&self) -> u16 {
        if self.config.msbc {
            crate::codec_id::MSBC
        } else {
            crate::codec_id::SBC
        }
    }

    fn frame_pcm_bytes(&self) -> usize {
        self.config.frame_pcm_frames() * self.config.channels() * 2
    }

    fn frame_samples(&self) -> usize {
        self.config.frame_pcm_frames()
    }

    fn frame_wire_bytes(&self) -> usize {
        self.config.frame_len()
    }

    fn encode(&mut self, pcm: &mut FixedBuffer, wire: &mut FixedBuffer) -> Result<usize> {
        let pcm_bytes = self.frame_pcm_bytes();
        let frame_len = self.config.frame_len();
        let mut frames = 0;

        while pcm.len_out() >= pcm_bytes && wire.len_in() >= frame_len {
            let samples: Vec<i16> = pcm.head()[..pcm_bytes]
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect();
            let n = {
                let out = wire.tail_mut();
                self.encode_frame(&samples, out)?
            };
            wire.seek(n);
            pcm.shift(pcm_bytes);
            frames += 1;
        }
        Ok(frames)
    }

    fn decode(&mut self, wire: &mut FixedBuffer, pcm: &mut FixedBuffer) -> Result<usize> {
        let pcm_bytes = self.frame_pcm_bytes();
        let frame_len = self.config.frame_len();
        let mut frames = 0;

        while wire.len_out() >= frame_len && pcm.len_in() >= pcm_bytes {
            let mut samples = vec![0i16; pcm_bytes / 2];
            self.decode_frame(&wire.head()[..frame_len], &mut samples)?;
            let out = pcm.tail_mut();
            for (chunk, sample) in out[..pcm_bytes].chunks_exact_mut(2).zip(&samples) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
            pcm.seek(pcm_bytes);
            wire.shift(frame_len);
            frames += 1;
        }
        Ok(frames)
    }

    fn reset(&mut self) {
        self.analyzer.reset();
        self.synthesizer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_config() -> SbcConfig {
        SbcConfig {
            frequency: Frequency::Hz44100,
            mode: ChannelMode::JointStereo,
            blocks: 16,
            subbands: 8,
            allocation: Allocation::Loudness,
            bitpool: 53,
            msbc: false,
        }
    }

    #[test]
    fn element_round_trip() {
        let config = stereo_config();
        let element = config.to_a2dp_element();
        assert_eq!(SbcConfig::from_a2dp_element(&element).unwrap(), config);
    }

    #[test]
    fn caps_intersection_and_select() {
        // Peer supports only 44.1 kHz stereo modes, 8 subbands, 16 blocks.
        let peer = SbcCaps {
            frequencies: 0x20,
            modes: 0x03,
            blocks: 0x10,
            subbands: 0x04,
            allocations: 0x01,
            min_bitpool: 2,
            max_bitpool: 35,
        };
        let config = SbcCaps::LOCAL.intersect(&peer).select(53).unwrap();
        assert_eq!(config.frequency, Frequency::Hz44100);
        assert_eq!(config.mode, ChannelMode::JointStereo);
        assert_eq!(config.blocks, 16);
        assert_eq!(config.subbands, 8);
        // Clamped to the peer maximum.
        assert_eq!(config.bitpool, 35);
    }

    #[test]
    fn caps_no_common_frequency() {
        let peer = SbcCaps { frequencies: 0, ..SbcCaps::LOCAL };
        assert_eq!(peer.select(53).unwrap_err().kind, ErrorKind::InvalidArguments);
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(stereo_config().frame_len(), 4 + 9 + (16 * 53 + 7) / 8);
        // The mSBC frame is exactly 57 bytes.
        assert_eq!(SbcConfig::msbc().frame_len(), 57);
    }

    #[test]
    fn silence_round_trip_is_silent() {
        let config = stereo_config();
        let mut codec = Sbc::new(config);
        let samples = vec![0i16; config.frame_pcm_frames() * 2];
        let mut frame = [0u8; MAX_FRAME_LEN];
        let n = codec.encode_frame(&samples, &mut frame).unwrap();
        assert_eq!(n, config.frame_len());
        assert_eq!(frame[0], 0x9c);

        let mut out = vec![0i16; samples.len()];
        codec.decode_frame(&frame[..n], &mut out).unwrap();
        assert!(out.iter().all(|&s| s == 0), "silence must decode to silence");
    }

    #[test]
    fn sine_round_trip_is_bounded() {
        let config = stereo_config();
        let mut codec = Sbc::new(config);
        let frames = config.frame_pcm_frames();
        let mut out = vec![0i16; frames * 2];
        let mut frame = [0u8; MAX_FRAME_LEN];

        // Push several frames so the filter history fills up; the codec
        // must neither panic nor produce out-of-range garbage.
        for f in 0..8 {
            let pcm: Vec<i16> = (0..frames * 2)
                .map(|i| {
                    let t = (f * frames + i / 2) as f32 / 44100.0;
                    ((2.0 * std::f32::consts::PI * 1000.0 * t).sin() * 8000.0) as i16
                })
                .collect();
            let n = codec.encode_frame(&pcm, &mut frame).unwrap();
            codec.decode_frame(&frame[..n], &mut out).unwrap();
        }
        let energy: i64 = out.iter().map(|&s| s.abs() as i64).sum();
        assert!(energy > 0, "steady sine must decode to non-silence");
    }

    #[test]
    fn stream_codec_consumes_whole_frames() {
        let config = stereo_config();
        let mut codec = Sbc::new(config);
        let pcm_bytes = codec.frame_pcm_bytes();

        let mut pcm = FixedBuffer::new(pcm_bytes * 2);
        let mut wire = FixedBuffer::new(MAX_FRAME_LEN * 2);

        // Half a frame: not enough input yet.
        pcm.append(&vec![0u8; pcm_bytes / 2]);
        assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 0);

        pcm.append(&vec![0u8; pcm_bytes / 2 + pcm_bytes]);
        assert_eq!(codec.encode(&mut pcm, &mut wire).unwrap(), 2);
        assert_eq!(wire.len_out(), 2 * config.frame_len());
        assert!(pcm.is_empty());

        let mut decoded = FixedBuffer::new(pcm_bytes * 4);
        assert_eq!(codec.decode(&mut wire, &mut decoded).unwrap(), 2);
        assert!(wire.is_empty());
        assert_eq!(decoded.len_out(), 2 * pcm_bytes);
    }

    #[test]
    fn quantizer_round_trip_monotone() {
        for sf in 0..16 {
            let level = SCALE_LEVELS[sf];
            for bits in [2u8, 4, 8, 16] {
                let sample = level / 2;
                let q = quantize_sample(sample, bits, level);
                let d = dequantize_sample(q, bits, level);
                let err = (sample - d).abs();
                // Quantization error is bounded by one step.
                assert!(err <= 2 * level / ((1 << bits) - 1) + 1, "sf={sf} bits={bits} err={err}");
            }
        }
    }

    #[test]
    fn allocator_is_deterministic_and_bounded() {
        let config = stereo_config();
        let sf: ScaleFactors = [[7, 5, 3, 9, 0, 2, 11, 1], [7, 5, 3, 9, 0, 2, 11, 1]];
        let a = allocate_bits(&sf, &config, 0);
        let b = allocate_bits(&sf, &config, 0);
        assert_eq!(a, b);
        for ch in a.iter() {
            for &bits in ch.iter() {
                assert!(bits <= 16);
            }
        }
        let total: u32 = a.iter().flatten().map(|&b| b as u32).sum();
        assert!(total <= config.bitpool as u32 + 2 * 8 * 2);
    }
}
