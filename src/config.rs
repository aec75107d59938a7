//! Daemon configuration.
//!
//! All options are resolved once at startup into an immutable [Config]
//! record that is passed to every component constructor.

use clap::{Parser, ValueEnum};

use crate::{Error, ErrorKind, Profile, Result};

/// SBC encoder quality presets, mapped to bit pool values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SbcQuality {
    /// Bit pool 33.
    Low,
    /// Bit pool 40.
    Medium,
    /// Bit pool 53, the A2DP high-quality recommendation.
    High,
    /// Bit pool 76.
    Xq,
}

impl SbcQuality {
    /// Target bit pool for this preset.
    pub fn bitpool(self) -> u8 {
        match self {
            Self::Low => 33,
            Self::Medium => 40,
            Self::High => 53,
            Self::Xq => 76,
        }
    }
}

/// Command line options.
#[derive(Debug, Parser)]
#[command(name = "bluealsad", about = "Bluetooth audio daemon", version)]
struct Cli {
    /// Register the service as org.bluealsa.NAME instead of
    /// org.bluealsa, allowing multiple daemons side by side.
    #[arg(short = 'B', long = "dbus", value_name = "NAME")]
    dbus: Option<String>,

    /// Serve only the given HCI devices, e.g. hci0. May be repeated;
    /// the default is every adapter present.
    #[arg(short = 'i', long = "device", value_name = "HCI")]
    devices: Vec<String>,

    /// Enable a profile: a2dp-source, a2dp-sink, hfp-ag, hfp-hf,
    /// hsp-ag or hsp-hs. May be repeated; the default is both A2DP
    /// directions.
    #[arg(short = 'p', long = "profile", value_name = "NAME")]
    profiles: Vec<String>,

    /// SBC encoder quality.
    #[arg(long = "sbc-quality", value_enum, default_value_t = SbcQuality::High)]
    sbc_quality: SbcQuality,

    /// Apply volume in software by default.
    #[arg(long = "softvol", value_name = "BOOL", default_value_t = true,
          action = clap::ArgAction::Set)]
    softvol: bool,

    /// Initial volume of new PCMs in percent.
    #[arg(long = "initial-volume", value_name = "PERCENT", default_value_t = 100)]
    initial_volume: u8,
}

/// Immutable daemon configuration.
#[derive(Debug)]
pub struct Config {
    /// Optional service name suffix.
    pub dbus_suffix: Option<String>,
    /// Adapter name filter; empty serves every adapter.
    pub adapters: Vec<String>,
    /// Enabled profiles.
    pub profiles: Vec<Profile>,
    /// SBC encoder quality.
    pub sbc_quality: SbcQuality,
    /// Software volume default for new PCMs.
    pub soft_volume: bool,
    /// Initial volume percentage for new PCMs.
    pub initial_volume: u8,
}

impl Config {
    /// Parse the command line into a configuration.
    pub fn from_args() -> Result<Self> {
        let cli = Cli::try_parse().map_err(|err| {
            Error::with_message(ErrorKind::InvalidArguments, err.to_string())
        })?;
        Self::from_cli(cli)
    }

    fn from_cli(cli: Cli) -> Result<Self> {
        let mut profiles = Vec::new();
        for name in &cli.profiles {
            let profile: Profile = name.parse().map_err(|_| {
                Error::with_message(ErrorKind::InvalidArguments, format!("unknown profile: {name}"))
            })?;
            if !profiles.contains(&profile) {
                profiles.push(profile);
            }
        }
        if profiles.is_empty() {
            profiles = vec![Profile::A2dpSource, Profile::A2dpSink];
        }

        if cli.initial_volume > 100 {
            return Err(Error::with_message(
                ErrorKind::InvalidArguments,
                "initial volume must be 0-100",
            ));
        }

        Ok(Self {
            dbus_suffix: cli.dbus,
            adapters: cli.devices,
            profiles,
            sbc_quality: cli.sbc_quality,
            soft_volume: cli.softvol,
            initial_volume: cli.initial_volume,
        })
    }

    /// Whether the daemon serves the named adapter.
    pub fn serves_adapter(&self, name: &str) -> bool {
        self.adapters.is_empty() || self.adapters.iter().any(|a| a == name)
    }

    /// Target SBC bit pool.
    pub fn sbc_bitpool(&self) -> u8 {
        self.sbc_quality.bitpool()
    }

    /// Initial volume as a level on the given scale.
    pub fn initial_volume_level(&self, max_level: u8) -> u8 {
        (self.initial_volume as u16 * max_level as u16 / 100) as u8
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dbus_suffix: None,
            adapters: Vec::new(),
            profiles: vec![Profile::A2dpSource, Profile::A2dpSink],
            sbc_quality: SbcQuality::High,
            soft_volume: true,
            initial_volume: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_parsing() {
        let cli = Cli::parse_from(["bluealsad", "-p", "a2dp-sink", "-p", "hfp-ag", "-p", "a2dp-sink"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.profiles, vec![Profile::A2dpSink, Profile::HfpAg]);
    }

    #[test]
    fn unknown_profile_is_a_configuration_error() {
        let cli = Cli::parse_from(["bluealsad", "-p", "a3dp"]);
        assert_eq!(Config::from_cli(cli).unwrap_err().kind, ErrorKind::InvalidArguments);
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["bluealsad"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.profiles, vec![Profile::A2dpSource, Profile::A2dpSink]);
        assert!(config.soft_volume);
        assert!(config.serves_adapter("hci7"));
        assert_eq!(config.sbc_bitpool(), 53);
    }

    #[test]
    fn adapter_filter() {
        let cli = Cli::parse_from(["bluealsad", "-i", "hci1"]);
        let config = Config::from_cli(cli).unwrap();
        assert!(config.serves_adapter("hci1"));
        assert!(!config.serves_adapter("hci0"));
    }

    #[test]
    fn volume_scaling() {
        let config = Config { initial_volume: 50, ..Default::default() };
        assert_eq!(config.initial_volume_level(127), 63);
        assert_eq!(config.initial_volume_level(15), 7);
    }
}
