//! Audio transports: codec-and-direction specific endpoints of a device.

use std::{
    os::unix::io::AsRawFd,
    sync::{Arc, Mutex, Weak},
};
use tokio::{
    io::unix::AsyncFd,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    a2dp,
    audio::{format, Volume},
    codec::sbc::SbcConfig,
    config::Config,
    device::Device,
    engine::{GraphEvent, GraphEvents},
    pcm::{Pcm, PcmMode},
    sco,
    sock::{self, OwnedFd},
    Profile, Result,
};

/// Position of a PCM on its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmTag {
    /// The single PCM of an A2DP transport.
    Main,
    /// Speaker path of an SCO transport: client audio towards the peer.
    Spk,
    /// Microphone path of an SCO transport: peer audio towards the
    /// client.
    Mic,
}

/// Control messages consumed by the transport I/O task.
///
/// Every externally triggered descriptor or state transition is followed
/// by one of these, so the task re-reads shared state before it polls
/// again.
#[derive(Debug)]
pub enum TransportSignal {
    /// Shared state changed, e.g. a new Bluetooth socket was installed.
    Ping,
    /// A client opened the given PCM.
    PcmOpened(PcmTag),
    /// A client closed the given PCM.
    PcmClosed(PcmTag),
    /// Stop forwarding but keep the socket open.
    Pause,
    /// Resume forwarding.
    Resume,
    /// Flush the encoder and acknowledge once all residual audio left.
    Drain(oneshot::Sender<()>),
    /// Discard audio buffered from the client.
    DropBuffers,
}

/// Mutable transport state, guarded by the transport mutex.
pub struct TransportState {
    /// Active codec id (`Codec` property value).
    pub codec: u16,
    /// Codec configuration element (A2DP only).
    pub configuration: Vec<u8>,
    /// The Bluetooth socket, when connected.
    pub bt: Option<Arc<AsyncFd<OwnedFd>>>,
    /// Read MTU of the socket.
    pub read_mtu: usize,
    /// Write MTU of the socket.
    pub write_mtu: usize,
    /// BlueZ `MediaTransport1` object backing an A2DP transport.
    pub media_transport: Option<String>,
}

/// A codec-and-direction specific audio endpoint on a device.
pub struct Transport {
    /// Local profile role of this transport.
    pub profile: Profile,
    /// Owning device.
    pub device: Weak<Device>,
    /// Base object path of this transport's PCMs.
    pub path: String,
    state: Mutex<TransportState>,
    pcms: Vec<Arc<Pcm>>,
    ctrl: Mutex<Option<mpsc::UnboundedSender<TransportSignal>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: GraphEvents,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Transport {{ {} }}", self.path)
    }
}

impl Transport {
    /// Create an A2DP transport with its single PCM and start the parked
    /// I/O task.
    ///
    /// `configuration` is the configured codec element as negotiated
    /// with the remote endpoint; `media_transport` the BlueZ transport
    /// object used to acquire the socket.
    pub fn new_a2dp(
        device: &Arc<Device>, profile: Profile, codec: u16, configuration: Vec<u8>,
        media_transport: Option<String>, config: &Arc<Config>, events: GraphEvents,
    ) -> Result<Arc<Self>> {
        debug_assert!(profile.is_a2dp());
        let sbc = SbcConfig::from_a2dp_element(&configuration)?;
        let path = format!("{}/{}", device.path(), profile.path_fragment());
        log::debug!("{path}: configuration {}", hex::encode(&configuration));
        let mode = if profile == Profile::A2dpSource { PcmMode::Sink } else { PcmMode::Source };

        let events_pcm = events.clone();
        let soft_volume = config.soft_volume;
        let initial_level = config.initial_volume_level(Volume::A2DP_MAX);
        let transport = Arc::new_cyclic(|weak: &Weak<Transport>| {
            let pcm = Pcm::new(
                weak.clone(),
                PcmTag::Main,
                mode,
                format!("{path}/{}", mode.as_str()),
                Volume::A2DP_MAX,
                format::S16_LE,
                sbc.channels() as u8,
                sbc.frequency.hz(),
                soft_volume,
                initial_level,
                events_pcm,
            );
            Self {
                profile,
                device: Arc::downgrade(device),
                path,
                state: Mutex::new(TransportState {
                    codec,
                    configuration,
                    bt: None,
                    read_mtu: 0,
                    write_mtu: 0,
                    media_transport,
                }),
                pcms: vec![pcm],
                ctrl: Mutex::new(None),
                task: Mutex::new(None),
                events,
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        *transport.ctrl.lock().unwrap() = Some(tx);
        *transport.task.lock().unwrap() = Some(a2dp::spawn(transport.clone(), rx));

        for pcm in &transport.pcms {
            let _ = transport.events.send(GraphEvent::PcmAdded(pcm.clone()));
        }
        Ok(transport)
    }

    /// Create an SCO transport with its speaker and microphone PCMs and
    /// start the parked I/O task. The initial codec is CVSD.
    pub fn new_sco(
        device: &Arc<Device>, profile: Profile, config: &Arc<Config>, events: GraphEvents,
    ) -> Arc<Self> {
        debug_assert!(profile.is_sco());
        let path = format!("{}/{}", device.path(), profile.path_fragment());

        let events_pcm = events.clone();
        let soft_volume = config.soft_volume;
        let initial_level = config.initial_volume_level(Volume::SCO_MAX);
        let transport = Arc::new_cyclic(|weak: &Weak<Transport>| {
            let mk_pcm = |tag, mode: PcmMode| {
                Pcm::new(
                    weak.clone(),
                    tag,
                    mode,
                    format!("{path}/{}", mode.as_str()),
                    Volume::SCO_MAX,
                    format::S16_LE,
                    1,
                    8000,
                    soft_volume,
                    initial_level,
                    events_pcm.clone(),
                )
            };
            let pcms = vec![mk_pcm(PcmTag::Spk, PcmMode::Sink), mk_pcm(PcmTag::Mic, PcmMode::Source)];
            Self {
                profile,
                device: Arc::downgrade(device),
                path,
                state: Mutex::new(TransportState {
                    codec: crate::codec_id::CVSD,
                    configuration: Vec::new(),
                    bt: None,
                    read_mtu: 0,
                    write_mtu: 0,
                    media_transport: None,
                }),
                pcms,
                ctrl: Mutex::new(None),
                task: Mutex::new(None),
                events,
            }
        });

        let (tx, rx) = mpsc::unbounded_channel();
        *transport.ctrl.lock().unwrap() = Some(tx);
        *transport.task.lock().unwrap() = Some(sco::spawn(transport.clone(), rx));

        for pcm in &transport.pcms {
            let _ = transport.events.send(GraphEvent::PcmAdded(pcm.clone()));
        }
        transport
    }

    /// All PCMs of this transport.
    pub fn pcms(&self) -> &[Arc<Pcm>] {
        &self.pcms
    }

    /// PCM at the given position.
    pub fn pcm(&self, tag: PcmTag) -> Option<&Arc<Pcm>> {
        self.pcms.iter().find(|p| p.tag == tag)
    }

    /// Run a closure under the transport state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut TransportState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Active codec id.
    pub fn codec(&self) -> u16 {
        self.state.lock().unwrap().codec
    }

    /// Send a control message to the I/O task.
    pub fn signal(&self, signal: TransportSignal) {
        if let Some(tx) = &*self.ctrl.lock().unwrap() {
            let _ = tx.send(signal);
        }
    }

    /// Install a connected Bluetooth socket.
    ///
    /// Any previous socket is closed by the swap; the I/O task is pinged
    /// so it re-reads the descriptor before polling again.
    pub fn install_bt(&self, fd: OwnedFd, read_mtu: usize, write_mtu: usize) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            log::debug!("{}: installing bt socket fd {}", self.path, fd.as_raw_fd());
            state.bt = Some(Arc::new(AsyncFd::new(fd)?));
            state.read_mtu = read_mtu;
            state.write_mtu = write_mtu;
        }
        self.signal(TransportSignal::Ping);
        Ok(())
    }

    /// Close the Bluetooth socket, leaving the transport unconfigured.
    pub fn release_bt(&self) {
        let released = {
            let mut state = self.state.lock().unwrap();
            state.bt.take().is_some()
        };
        if released {
            log::debug!("{}: released bt socket", self.path);
            self.signal(TransportSignal::Ping);
        }
    }

    /// Whether a Bluetooth socket is installed.
    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().bt.is_some()
    }

    /// Switch the transport codec.
    ///
    /// On SCO transports an existing link is torn down so the next open
    /// uses the new settings. Stream parameter changes propagate to the
    /// PCMs, property signals included.
    pub fn set_codec(&self, codec: u16, configuration: Vec<u8>) {
        let teardown = {
            let mut state = self.state.lock().unwrap();
            if state.codec == codec && state.configuration == configuration {
                return;
            }
            state.codec = codec;
            state.configuration = configuration.clone();
            self.profile.is_sco() && state.bt.take().is_some()
        };
        if teardown {
            log::info!("{}: codec changed to {codec:#06x}, releasing SCO link", self.path);
        } else {
            log::debug!("{}: codec {codec:#06x} [{}]", self.path, hex::encode(&configuration));
        }
        self.signal(TransportSignal::Ping);

        let (fmt, channels, sampling) = if self.profile.is_sco() {
            match codec {
                crate::codec_id::MSBC => (format::S16_LE, 1, 16000),
                _ => (format::S16_LE, 1, 8000),
            }
        } else {
            match SbcConfig::from_a2dp_element(&configuration) {
                Ok(sbc) => (format::S16_LE, sbc.channels() as u8, sbc.frequency.hz()),
                Err(_) => (format::S16_LE, 2, 44100),
            }
        };
        for pcm in &self.pcms {
            pcm.set_stream_params(fmt, channels, sampling, codec);
        }
    }

    /// Remove the transport from the bus and stop its I/O task.
    ///
    /// Removal events are emitted while the object is still alive, so
    /// they precede the final unref on the server side.
    pub fn teardown(&self) {
        for pcm in &self.pcms {
            pcm.close();
            let _ = self.events.send(GraphEvent::PcmRemoved(pcm.path.clone()));
        }
        // Closing the control channel lets the task run down cleanly.
        *self.ctrl.lock().unwrap() = None;
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.release_bt_quiet();
    }

    fn release_bt_quiet(&self) {
        self.state.lock().unwrap().bt = None;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Service the control socket of an open PCM.
///
/// Datagram request/response: `Drain`, `Drop`, `Pause` and `Resume`,
/// each answered with `OK` or `ERR:<text>`. The task ends when the
/// client closes the socket, which also closes the PCM.
pub(crate) fn spawn_pcm_ctrl(pcm: Arc<Pcm>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some((_, ctrl)) = pcm.fds() else { return };
        let mut buf = [0u8; 64];
        loop {
            // A reopened PCM gets a fresh control task; this one ends.
            match pcm.fds() {
                Some((_, current)) if Arc::ptr_eq(&current, &ctrl) => {}
                _ => return,
            }

            let mut guard = match ctrl.readable().await {
                Ok(guard) => guard,
                Err(_) => break,
            };
            let n = match guard.try_io(|fd| sock::read(fd.get_ref(), &mut buf)) {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(err)) => {
                    log::debug!("{}: control socket error: {err}", pcm.path);
                    break;
                }
                Err(_would_block) => continue,
            };

            let command = String::from_utf8_lossy(&buf[..n]).trim().to_string();
            log::trace!("{}: control command {command:?}", pcm.path);
            let result = match command.as_str() {
                "Drain" => pcm.drain().await,
                "Drop" => pcm.drop_buffers(),
                "Pause" => {
                    pcm.set_paused(true);
                    Ok(())
                }
                "Resume" => {
                    pcm.set_paused(false);
                    Ok(())
                }
                _ => Err(crate::Error::with_message(
                    crate::ErrorKind::InvalidArguments,
                    format!("unknown command: {command}"),
                )),
            };

            let reply = match result {
                Ok(()) => "OK".to_string(),
                Err(err) => format!("ERR:{err}"),
            };
            let _ = sock::write(ctrl.get_ref(), reply.as_bytes());
        }
        pcm.close();
    })
}
