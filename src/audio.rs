//! Audio helpers: sample formats, volume scaling and the pacing clock.

use std::time::{Duration, Instant};

/// PCM sample format word.
///
/// Layout of the 16-bit word: bit 15 signedness, bit 14 endianness
/// (set = big), bits 13..8 physical width in bytes, bits 7..0 sample
/// bit depth.
pub mod format {
    /// Signedness flag.
    pub const SIGN: u16 = 0x8000;
    /// Big-endian flag.
    pub const BIG_ENDIAN: u16 = 0x4000;

    /// Unsigned 8-bit.
    pub const U8: u16 = 0x0108;
    /// Signed 16-bit little-endian.
    pub const S16_LE: u16 = 0x8210;
    /// Signed 24-bit in 4 bytes, little-endian.
    pub const S24_4LE: u16 = 0x8418;
    /// Signed 32-bit little-endian.
    pub const S32_LE: u16 = 0x8420;

    /// Whether samples are signed.
    pub fn is_signed(word: u16) -> bool {
        word & SIGN != 0
    }

    /// Whether samples are big-endian.
    pub fn is_big_endian(word: u16) -> bool {
        word & BIG_ENDIAN != 0
    }

    /// Physical width of one sample in bytes.
    pub fn width_bytes(word: u16) -> usize {
        ((word >> 8) & 0x3f) as usize
    }

    /// Sample bit depth.
    pub fn depth_bits(word: u16) -> usize {
        (word & 0xff) as usize
    }

    /// Construct a format word.
    pub fn make(signed: bool, big_endian: bool, width: usize, depth: usize) -> u16 {
        let mut w = ((width as u16) << 8) | depth as u16 & 0xff;
        if signed {
            w |= SIGN;
        }
        if big_endian {
            w |= BIG_ENDIAN;
        }
        w
    }
}

/// Packed 16-bit PCM volume: upper byte channel 1, lower byte channel 2;
/// the top bit of each byte mutes the channel, the remaining 7 bits are
/// the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Volume(pub u16);

impl Volume {
    /// Maximum level on the A2DP scale.
    pub const A2DP_MAX: u8 = 127;
    /// Maximum level on the SCO (HFP/HSP) scale.
    pub const SCO_MAX: u8 = 15;

    /// Pack per-channel levels and mute flags.
    pub fn pack(levels: [u8; 2], mutes: [bool; 2]) -> Self {
        let hi = (levels[0] & 0x7f) | if mutes[0] { 0x80 } else { 0 };
        let lo = (levels[1] & 0x7f) | if mutes[1] { 0x80 } else { 0 };
        Self(((hi as u16) << 8) | lo as u16)
    }

    /// Per-channel levels.
    pub fn levels(self) -> [u8; 2] {
        [((self.0 >> 8) & 0x7f) as u8, (self.0 & 0x7f) as u8]
    }

    /// Per-channel mute flags.
    pub fn mutes(self) -> [bool; 2] {
        [self.0 & 0x8000 != 0, self.0 & 0x0080 != 0]
    }

    /// Volume with both channels at the given level, unmuted.
    pub fn from_level(level: u8) -> Self {
        Self::pack([level, level], [false, false])
    }

    /// Amplitude gain of a channel in Q15, zero when muted.
    ///
    /// The level steers attenuation on a cubic curve: the distance from
    /// full scale is cubed and spread over a 48 dB range, which makes
    /// the level the cube root of the attenuation. Half level lands at
    /// about -6 dB; level zero is silent.
    pub fn gain_q15(self, channel: usize, max_level: u8) -> i32 {
        if self.mutes()[channel] {
            return 0;
        }
        let level = self.levels()[channel].min(max_level);
        if level == 0 {
            return 0;
        }
        if level == max_level {
            return 1 << 15;
        }
        let missing = 1.0 - level as f64 / max_level as f64;
        let db = -48.0 * missing.powi(3);
        let amplitude = 10f64.powf(db / 20.0);
        (amplitude * f64::from(1 << 15)).round() as i32
    }
}

/// Per-channel soft volume scaler for interleaved signed 16-bit PCM.
///
/// Gain changes slew over a few hundred samples so that level and mute
/// transitions are click-free.
#[derive(Debug)]
pub struct SoftVolume {
    current: [i32; 2],
    target: [i32; 2],
}

/// Q15 gain change per sample while slewing.
const GAIN_SLEW_STEP: i32 = 1 << 7;

impl SoftVolume {
    /// Create a scaler with unity gain on both channels.
    pub fn new() -> Self {
        Self { current: [1 << 15; 2], target: [1 << 15; 2] }
    }

    /// Set the target gain from a packed volume word.
    pub fn set_volume(&mut self, volume: Volume, max_level: u8) {
        self.target = [volume.gain_q15(0, max_level), volume.gain_q15(1, max_level)];
    }

    /// Whether scaling is currently a no-op.
    pub fn is_unity(&self) -> bool {
        self.current == [1 << 15; 2] && self.target == [1 << 15; 2]
    }

    /// Scale interleaved samples in place.
    pub fn apply(&mut self, samples: &mut [i16], channels: usize) {
        if self.is_unity() {
            return;
        }
        for frame in samples.chunks_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let ch = ch.min(1);
                let cur = &mut self.current[ch];
                let tgt = self.target[ch];
                if *cur < tgt {
                    *cur = (*cur + GAIN_SLEW_STEP).min(tgt);
                } else if *cur > tgt {
                    *cur = (*cur - GAIN_SLEW_STEP).max(tgt);
                }
                *sample = ((*sample as i32 * *cur) >> 15) as i16;
            }
        }
    }
}

impl Default for SoftVolume {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a buffer of samples in the given format to signed 16-bit
/// native-endian.
///
/// Returns `None` when the format is not one of the supported client
/// formats.
pub fn to_s16(word: u16, data: &[u8]) -> Option<Vec<i16>> {
    match word {
        format::U8 => Some(data.iter().map(|&b| ((b as i16) - 128) << 8).collect()),
        format::S16_LE => {
            Some(data.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect())
        }
        format::S24_4LE => Some(
            data.chunks_exact(4)
                .map(|c| {
                    let v = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                    (v >> 8) as i16
                })
                .collect(),
        ),
        format::S32_LE => Some(
            data.chunks_exact(4)
                .map(|c| (i32::from_le_bytes([c[0], c[1], c[2], c[3]]) >> 16) as i16)
                .collect(),
        ),
        _ => None,
    }
}

/// Audio stream rate synchronizer.
///
/// An explicit pacing clock for encoder loops: after processing `n`
/// frames the loop asks the clock to sleep for the remainder of the
/// wall-clock budget those frames represent, keeping the output bitrate
/// constant regardless of encoder jitter. The busy time of each
/// iteration is recorded and exposed for delay reporting.
#[derive(Debug)]
pub struct AsrSync {
    sample_rate: u32,
    origin: Instant,
    frames: u64,
    busy: Duration,
    last_resume: Instant,
}

impl AsrSync {
    /// Create a synchronizer for the given sampling rate.
    ///
    /// The clock starts at the first [sync](Self::sync) call.
    pub fn new(sample_rate: u32) -> Self {
        let now = Instant::now();
        Self { sample_rate, origin: now, frames: 0, busy: Duration::ZERO, last_resume: now }
    }

    /// Restart the clock, e.g. after a pause.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.origin = now;
        self.frames = 0;
        self.last_resume = now;
    }

    /// Account for `frames` processed frames and sleep until their
    /// wall-clock time has elapsed since stream start.
    pub async fn sync(&mut self, frames: usize) {
        let now = Instant::now();
        self.busy = now.saturating_duration_since(self.last_resume);

        self.frames += frames as u64;
        let due = self.origin + Duration::from_micros(self.frames * 1_000_000 / self.sample_rate as u64);
        if due > now {
            tokio::time::sleep(due - now).await;
        }
        self.last_resume = Instant::now();
    }

    /// Busy time of the last iteration in 0.1 ms units.
    pub fn busy_tenths_ms(&self) -> u16 {
        (self.busy.as_micros() / 100).min(u16::MAX as u128) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_word_examples() {
        // Unsigned 16-bit 2-byte big-endian.
        assert!(!format::is_signed(0x4210));
        assert!(format::is_big_endian(0x4210));
        assert_eq!(format::width_bytes(0x4210), 2);
        assert_eq!(format::depth_bits(0x4210), 16);

        // Signed 24-bit 4-byte little-endian.
        assert!(format::is_signed(0x8418));
        assert!(!format::is_big_endian(0x8418));
        assert_eq!(format::width_bytes(0x8418), 4);
        assert_eq!(format::depth_bits(0x8418), 24);

        assert_eq!(format::make(true, false, 2, 16), format::S16_LE);
    }

    #[test]
    fn volume_word_round_trip() {
        let v = Volume::pack([100, 50], [true, false]);
        assert_eq!(v.levels(), [100, 50]);
        assert_eq!(v.mutes(), [true, false]);
        assert_eq!(Volume(v.0), v);
    }

    fn gain_db(level: u8) -> f64 {
        let v = Volume::from_level(level);
        let gain = v.gain_q15(0, Volume::A2DP_MAX) as f64 / (1 << 15) as f64;
        20.0 * gain.log10()
    }

    #[test]
    fn half_level_is_about_minus_6_db() {
        let db = gain_db(64);
        assert!((-6.5..-5.5).contains(&db), "gain at half level is {db} dB");
    }

    #[test]
    fn gain_curve_is_cubic_not_linear() {
        // Away from the half-level point a linear amplitude map and the
        // cubic attenuation curve are far apart: at level 32 linear
        // would be about -12 dB, at level 96 about -2.4 dB.
        let db32 = gain_db(32);
        assert!((-22.0..-18.0).contains(&db32), "gain at level 32 is {db32} dB");
        let db96 = gain_db(96);
        assert!((-1.5..-0.3).contains(&db96), "gain at level 96 is {db96} dB");

        // Endpoints: full scale is exactly unity, zero is silent.
        let full = Volume::from_level(127);
        assert_eq!(full.gain_q15(0, Volume::A2DP_MAX), 1 << 15);
        let zero = Volume::from_level(0);
        assert_eq!(zero.gain_q15(0, Volume::A2DP_MAX), 0);
    }

    #[test]
    fn muted_channel_is_silent() {
        let v = Volume::pack([127, 127], [true, false]);
        assert_eq!(v.gain_q15(0, Volume::A2DP_MAX), 0);
        assert_eq!(v.gain_q15(1, Volume::A2DP_MAX), 1 << 15);
    }

    #[test]
    fn soft_volume_slews_to_target() {
        let mut sv = SoftVolume::new();
        sv.set_volume(Volume::pack([0, 0], [true, true]), Volume::A2DP_MAX);

        let mut samples = vec![i16::MAX; 2 * 4096];
        sv.apply(&mut samples, 2);
        // The ramp must reach full mute before the end of the buffer.
        assert_eq!(samples[samples.len() - 1], 0);
        assert_eq!(samples[samples.len() - 2], 0);
        // And must not jump straight to zero at the start.
        assert_ne!(samples[0], 0);
    }

    #[test]
    fn s16_conversions() {
        assert_eq!(to_s16(format::S16_LE, &[0x34, 0x12]).unwrap(), vec![0x1234]);
        assert_eq!(to_s16(format::U8, &[128]).unwrap(), vec![0]);
        assert_eq!(to_s16(format::S32_LE, &[0, 0, 0x34, 0x12]).unwrap(), vec![0x1234]);
        assert!(to_s16(0x4210, &[0, 0]).is_none());
    }

    #[tokio::test]
    async fn asrsync_paces_frames() {
        let mut asr = AsrSync::new(8000);
        let start = Instant::now();
        // 4 * 400 frames at 8 kHz is 200 ms of audio.
        for _ in 0..4 {
            asr.sync(400).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(180), "elapsed {elapsed:?}");
    }
}
