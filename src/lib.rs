//! # bluealsad, the Bluetooth audio daemon
//!
//! This crate implements the application layer of the Bluetooth A2DP and
//! HFP/HSP profiles. It registers itself with the system Bluetooth daemon
//! as a media endpoint and profile handler, owns every audio transport a
//! remote device exposes, and brokers audio between those transports and
//! local PCM clients over D-Bus.
//!
//! The crate is organised around a reference-counted object graph:
//!
//! * [Adapter](adapter::Adapter): one per local controller, runs the SCO
//!   connection dispatcher.
//! * [Device](device::Device): one per remote peer, owns its RFCOMM
//!   worker.
//! * [Transport](transport::Transport): a codec-and-direction specific
//!   audio endpoint, owns the I/O task moving audio between the Bluetooth
//!   socket and the client PCMs.
//! * [Pcm](pcm::Pcm): the client-facing end, an audio pipe plus a
//!   datagram control socket, exported on the bus as `org.bluealsa.PCM1`.
//!
//! All I/O runs on the [tokio] runtime; Bluetooth sockets are non-blocking
//! and multiplexed through `AsyncFd`. The D-Bus surface is served with
//! [dbus_crossroads].

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("bluealsad only supports the Linux operating system.");

use dbus::arg::AppendAll;
use dbus_crossroads::{Context, Crossroads};
use futures::Future;
use macaddr::MacAddr6;
use std::{
    fmt::{self, Debug, Display, Formatter},
    marker::PhantomData,
    ops::{Deref, DerefMut},
    str::FromStr,
    sync::Arc,
};
use strum::{Display, EnumString};
use tokio::task::JoinError;

pub(crate) const SERVICE_NAME: &str = "org.bluealsa";
pub(crate) const SERVICE_PATH: &str = "/org/bluealsa";
pub(crate) const ERR_PREFIX: &str = "org.bluealsa.Error.";

pub mod sock;

pub mod a2dp;
pub mod adapter;
pub mod at;
pub mod audio;
pub mod bluez;
pub mod codec;
pub mod config;
pub mod device;
pub mod engine;
pub mod ffb;
pub mod hci;
pub mod pcm;
pub mod rfcomm;
pub mod rpc;
pub mod rtp;
pub mod sco;
mod sys;
pub mod transport;

/// Bluetooth audio daemon error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Bluetooth audio daemon error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, EnumString)]
#[non_exhaustive]
pub enum ErrorKind {
    /// invalid arguments
    InvalidArguments,
    /// operation not supported
    NotSupported,
    /// transport not connected
    NotConnected,
    /// resource not available
    NotAvailable,
    /// object not found
    NotFound,
    /// operation failed
    Failed,
    /// operation in progress
    InProgress,
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal error kind.
///
/// These indicate faults in the environment rather than in the request:
/// kernel interfaces, the D-Bus connection or the runtime.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// IO error {0:?}
    Io(std::io::ErrorKind),
    /// D-Bus error {0}
    DBus(String),
    /// lost connection to D-Bus
    DBusConnectionLost,
    /// join error
    JoinError,
    /// invalid value
    InvalidValue,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// D-Bus error name for this error.
    ///
    /// Error names on the bus use the CamelCase kind, not its display text.
    pub fn dbus_name(&self) -> String {
        let kind_name = match &self.kind {
            ErrorKind::InvalidArguments => "InvalidArguments",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::NotConnected => "NotConnected",
            ErrorKind::NotAvailable => "NotAvailable",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Failed => "Failed",
            ErrorKind::InProgress => "InProgress",
            ErrorKind::Internal(_) => "Failed",
        };
        format!("{ERR_PREFIX}{kind_name}")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<dbus::Error> for Error {
    fn from(err: dbus::Error) -> Self {
        log::trace!("D-Bus error {}: {}", err.name().unwrap_or_default(), err.message().unwrap_or_default());
        Self {
            kind: ErrorKind::Internal(InternalErrorKind::DBus(err.name().unwrap_or_default().to_string())),
            message: err.message().unwrap_or_default().to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<Error> for dbus::MethodErr {
    fn from(err: Error) -> Self {
        Self::from((err.dbus_name(), &err.to_string()))
    }
}

/// Bluetooth audio daemon result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth device address.
///
/// The string representation is colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }

    /// D-Bus object path fragment, `dev_XX_XX_XX_XX_XX_XX`.
    pub fn to_path_fragment(self) -> String {
        format!(
            "dev_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}_{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }

    /// Parse a `dev_XX_XX_XX_XX_XX_XX` object path fragment.
    pub fn from_path_fragment(s: &str) -> Option<Self> {
        let s = s.strip_prefix("dev_")?;
        s.replace('_', ":").parse().ok()
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<sys::bdaddr_t> for Address {
    fn from(mut addr: sys::bdaddr_t) -> Self {
        addr.b.reverse();
        Self(addr.b)
    }
}

impl From<Address> for sys::bdaddr_t {
    fn from(mut addr: Address) -> Self {
        addr.0.reverse();
        sys::bdaddr_t { b: addr.0 }
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

/// Bluetooth audio profile of a transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
pub enum Profile {
    /// A2DP source: local audio is encoded and streamed to the peer.
    #[strum(serialize = "a2dp-source")]
    A2dpSource,
    /// A2DP sink: the peer streams encoded audio to us.
    #[strum(serialize = "a2dp-sink")]
    A2dpSink,
    /// HFP audio gateway.
    #[strum(serialize = "hfp-ag")]
    HfpAg,
    /// HFP hands-free unit.
    #[strum(serialize = "hfp-hf")]
    HfpHf,
    /// HSP audio gateway.
    #[strum(serialize = "hsp-ag")]
    HspAg,
    /// HSP headset.
    #[strum(serialize = "hsp-hs")]
    HspHs,
}

impl Profile {
    /// Whether this profile streams over A2DP (L2CAP) rather than SCO.
    pub fn is_a2dp(self) -> bool {
        matches!(self, Self::A2dpSource | Self::A2dpSink)
    }

    /// Whether this profile streams voice over SCO.
    pub fn is_sco(self) -> bool {
        !self.is_a2dp()
    }

    /// Whether the local side acts as the audio gateway.
    ///
    /// The gateway owns the SCO bandwidth decision, which enables the
    /// linger phase of the SCO transport lifecycle.
    pub fn is_ag(self) -> bool {
        matches!(self, Self::HfpAg | Self::HspAg)
    }

    /// Object path fragment for transports of this profile.
    ///
    /// Transports are published under the role of the *remote* endpoint:
    /// a local source streams to the peer's sink, so its objects live
    /// under `a2dpsnk`.
    pub fn path_fragment(self) -> &'static str {
        match self {
            Self::A2dpSource => "a2dpsnk",
            Self::A2dpSink => "a2dpsrc",
            Self::HfpAg => "hfphf",
            Self::HfpHf => "hfpag",
            Self::HspAg => "hsphs",
            Self::HspHs => "hspag",
        }
    }

    /// Value of the `Transport` D-Bus property: the remote endpoint's
    /// role, matching [path_fragment](Self::path_fragment).
    pub fn transport_property(self) -> &'static str {
        match self {
            Self::A2dpSource => "A2DP-sink",
            Self::A2dpSink => "A2DP-source",
            Self::HfpAg => "HFP-HF",
            Self::HfpHf => "HFP-AG",
            Self::HspAg => "HSP-HS",
            Self::HspHs => "HSP-AG",
        }
    }

    /// UUID of the local role registered with the Bluetooth daemon.
    pub fn uuid(self) -> uuid::Uuid {
        let s = match self {
            Self::A2dpSource => "0000110a-0000-1000-8000-00805f9b34fb",
            Self::A2dpSink => "0000110b-0000-1000-8000-00805f9b34fb",
            Self::HfpAg => "0000111f-0000-1000-8000-00805f9b34fb",
            Self::HfpHf => "0000111e-0000-1000-8000-00805f9b34fb",
            Self::HspAg => "00001112-0000-1000-8000-00805f9b34fb",
            Self::HspHs => "00001108-0000-1000-8000-00805f9b34fb",
        };
        s.parse().unwrap()
    }
}

/// Transport codec identifiers as exposed in the `Codec` property.
///
/// A2DP transports use the AVDTP media codec identifier, SCO transports
/// the HFP codec identifier. The two spaces overlap by design of the
/// profiles; the `Transport` property disambiguates.
pub mod codec_id {
    /// A2DP SBC.
    pub const SBC: u16 = 0x0000;
    /// A2DP MPEG-1/2 audio.
    pub const MPEG12: u16 = 0x0001;
    /// A2DP MPEG-2/4 AAC.
    pub const AAC: u16 = 0x0002;
    /// A2DP vendor codec (aptX, LDAC).
    pub const VENDOR: u16 = 0x00ff;
    /// SCO CVSD.
    pub const CVSD: u16 = 0x0001;
    /// SCO mSBC.
    pub const MSBC: u16 = 0x0002;
}

/// Result of calling one of our D-Bus methods.
pub(crate) type DbusResult<T> = std::result::Result<T, dbus::MethodErr>;

/// Call method on Arc D-Bus object we are serving.
pub(crate) fn method_call<
    T: Send + Sync + 'static,
    R: AppendAll + fmt::Debug,
    F: Future<Output = DbusResult<R>> + Send + 'static,
>(
    mut ctx: Context, cr: &mut Crossroads, f: impl FnOnce(Arc<T>) -> F,
) -> impl Future<Output = PhantomData<R>> {
    let data_ref: &mut Arc<T> = cr.data_mut(ctx.path()).unwrap();
    let data: Arc<T> = data_ref.clone();
    async move {
        let result = f(data).await;
        log::trace!(
            "{}: {}.{} (...) -> {:?}",
            ctx.path(),
            ctx.interface().map(|i| i.to_string()).unwrap_or_default(),
            ctx.method(),
            &result
        );
        ctx.reply(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_round_trip() {
        let addr: Address = "12:34:56:78:9A:BC".parse().unwrap();
        assert_eq!(addr.to_string(), "12:34:56:78:9A:BC");
        assert_eq!(addr.to_path_fragment(), "dev_12_34_56_78_9A_BC");
        assert_eq!(Address::from_path_fragment("dev_12_34_56_78_9A_BC"), Some(addr));
    }

    #[test]
    fn profile_names() {
        assert_eq!("a2dp-sink".parse::<Profile>().unwrap(), Profile::A2dpSink);
        assert_eq!(Profile::HfpAg.to_string(), "hfp-ag");
        assert!(Profile::HfpAg.is_ag());
        assert!(!Profile::HfpHf.is_ag());
        assert!(Profile::A2dpSource.is_a2dp());
        assert!(Profile::HspHs.is_sco());
        // Objects are published under the remote endpoint's role.
        assert_eq!(Profile::A2dpSource.path_fragment(), "a2dpsnk");
        assert_eq!(Profile::HfpAg.transport_property(), "HFP-HF");
    }

    #[test]
    fn error_dbus_names() {
        assert_eq!(Error::new(ErrorKind::NotConnected).dbus_name(), "org.bluealsa.Error.NotConnected");
        assert_eq!(
            Error::new(ErrorKind::Internal(InternalErrorKind::InvalidValue)).dbus_name(),
            "org.bluealsa.Error.Failed"
        );
    }
}
