//! Client-facing PCM endpoints.

use std::{
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{
    io::unix::AsyncFd,
    sync::{oneshot, Notify},
};

use crate::{
    audio::Volume,
    engine::{GraphEvent, GraphEvents, PcmProperty},
    sock::{self, OwnedFd},
    transport::{PcmTag, Transport, TransportSignal},
    Error, ErrorKind, Result,
};

static SEQUENCE: AtomicU32 = AtomicU32::new(1);

/// Direction of a PCM from the transport's point of view.
///
/// A `Sink` PCM is fed by the local client and its audio flows towards
/// the remote device; a `Source` PCM carries audio captured from the
/// link for the local client to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmMode {
    /// Local client produces audio.
    Sink,
    /// Local client consumes audio.
    Source,
}

impl PcmMode {
    /// String form used in object paths and the `Mode` property.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sink => "sink",
            Self::Source => "source",
        }
    }
}

/// Engine-side descriptors of an open PCM.
pub struct PcmFds {
    /// Engine end of the audio pipe.
    pub pipe: Arc<AsyncFd<OwnedFd>>,
    /// Engine end of the control socket.
    pub ctrl: Arc<AsyncFd<OwnedFd>>,
}

impl std::fmt::Debug for PcmFds {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PcmFds")
            .field("pipe", &self.pipe.get_ref().as_raw_fd())
            .field("ctrl", &self.ctrl.get_ref().as_raw_fd())
            .finish()
    }
}

/// Mutable PCM state, guarded by the PCM mutex.
#[derive(Debug)]
pub struct PcmState {
    /// Sample format word.
    pub format: u16,
    /// Channel count.
    pub channels: u8,
    /// Sampling frequency in Hz.
    pub sampling: u32,
    /// Packed volume word.
    pub volume: Volume,
    /// Whether volume is applied in software.
    pub soft_volume: bool,
    /// Reported delay in 0.1 ms units.
    pub delay: u16,
    /// Client descriptors while open.
    pub fds: Option<PcmFds>,
    /// Paused by the control socket.
    pub paused: bool,
}

/// A client-facing PCM endpoint of a transport.
pub struct Pcm {
    /// Owning transport.
    pub transport: Weak<Transport>,
    /// Position of this PCM on the transport.
    pub tag: PcmTag,
    /// Direction.
    pub mode: PcmMode,
    /// D-Bus object path.
    pub path: String,
    /// Monotonic creation sequence number.
    pub sequence: u32,
    /// Maximum volume level of the profile's scale.
    pub max_level: u8,
    state: Mutex<PcmState>,
    drained: Notify,
    events: GraphEvents,
}

impl std::fmt::Debug for Pcm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Pcm {{ {} }}", self.path)
    }
}

impl Pcm {
    pub(crate) fn new(
        transport: Weak<Transport>, tag: PcmTag, mode: PcmMode, path: String, max_level: u8,
        format: u16, channels: u8, sampling: u32, soft_volume: bool, initial_level: u8,
        events: GraphEvents,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            tag,
            mode,
            path,
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            max_level,
            state: Mutex::new(PcmState {
                format,
                channels,
                sampling,
                volume: Volume::from_level(initial_level.min(max_level)),
                soft_volume,
                delay: 0,
                fds: None,
                paused: false,
            }),
            drained: Notify::new(),
            events,
        })
    }

    /// Whether the local client writes audio into this PCM.
    pub fn client_writes(&self) -> bool {
        self.mode == PcmMode::Sink
    }

    /// Run a closure under the PCM state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut PcmState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Whether a client currently holds this PCM open.
    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().fds.is_some()
    }

    /// Engine-side descriptors, when open.
    pub fn fds(&self) -> Option<(Arc<AsyncFd<OwnedFd>>, Arc<AsyncFd<OwnedFd>>)> {
        let state = self.state.lock().unwrap();
        state.fds.as_ref().map(|fds| (fds.pipe.clone(), fds.ctrl.clone()))
    }

    /// Open the PCM for exactly one client.
    ///
    /// Returns the client ends: the audio pipe and the control socket.
    /// The transport I/O task is signalled before this returns, so it
    /// observes the descriptor transition before polling again.
    pub fn open(self: &Arc<Self>) -> Result<(OwnedFd, OwnedFd)> {
        let transport =
            self.transport.upgrade().ok_or_else(|| Error::new(ErrorKind::NotFound))?;

        let (client_pipe, client_ctrl) = {
            let mut state = self.state.lock().unwrap();
            if state.fds.is_some() {
                return Err(Error::with_message(ErrorKind::NotAvailable, "PCM is already open"));
            }

            let (pipe_rd, pipe_wr) = sock::pipe()?;
            let (ctrl_engine, ctrl_client) = sock::seqpacket_pair()?;
            let (engine_pipe, client_pipe) =
                if self.client_writes() { (pipe_rd, pipe_wr) } else { (pipe_wr, pipe_rd) };
            sock::set_blocking(&client_pipe)?;
            sock::set_blocking(&ctrl_client)?;

            state.fds = Some(PcmFds {
                pipe: Arc::new(AsyncFd::new(engine_pipe)?),
                ctrl: Arc::new(AsyncFd::new(ctrl_engine)?),
            });
            state.paused = false;
            (client_pipe, ctrl_client)
        };

        transport.signal(TransportSignal::PcmOpened(self.tag));
        let _ = crate::transport::spawn_pcm_ctrl(self.clone());
        Ok((client_pipe, client_ctrl))
    }

    /// Close the PCM, dropping the engine-side descriptors.
    pub fn close(&self) {
        let had_fds = {
            let mut state = self.state.lock().unwrap();
            state.fds.take().is_some()
        };
        if had_fds {
            if let Some(transport) = self.transport.upgrade() {
                transport.signal(TransportSignal::PcmClosed(self.tag));
            }
        }
    }

    /// Update the volume word.
    ///
    /// Returns whether the value changed; a property-changed event is
    /// emitted only for actual changes.
    pub fn set_volume(&self, volume: Volume) -> bool {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.volume == volume {
                false
            } else {
                state.volume = volume;
                true
            }
        };
        if changed {
            let _ = self.events.send(GraphEvent::PcmChanged {
                path: self.path.clone(),
                properties: vec![PcmProperty::Volume(volume.0)],
            });
        }
        changed
    }

    /// Update the soft-volume flag.
    pub fn set_soft_volume(&self, soft: bool) -> bool {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.soft_volume == soft {
                false
            } else {
                state.soft_volume = soft;
                true
            }
        };
        if changed {
            let _ = self.events.send(GraphEvent::PcmChanged {
                path: self.path.clone(),
                properties: vec![PcmProperty::SoftVolume(soft)],
            });
        }
        changed
    }

    /// Update the reported delay.
    pub fn set_delay(&self, delay: u16) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            // Delay jitters constantly; only whole-millisecond changes
            // are worth a signal.
            if state.delay / 10 == delay / 10 {
                state.delay = delay;
                false
            } else {
                state.delay = delay;
                true
            }
        };
        if changed {
            let _ = self.events.send(GraphEvent::PcmChanged {
                path: self.path.clone(),
                properties: vec![PcmProperty::Delay(delay)],
            });
        }
    }

    /// Update the stream parameters after a codec change.
    pub fn set_stream_params(&self, format: u16, channels: u8, sampling: u32, codec: u16) {
        {
            let mut state = self.state.lock().unwrap();
            state.format = format;
            state.channels = channels;
            state.sampling = sampling;
        }
        let _ = self.events.send(GraphEvent::PcmChanged {
            path: self.path.clone(),
            properties: vec![
                PcmProperty::Codec(codec),
                PcmProperty::Format(format),
                PcmProperty::Channels(channels),
                PcmProperty::Sampling(sampling),
            ],
        });
    }

    /// Pause or resume forwarding.
    pub fn set_paused(&self, paused: bool) {
        self.state.lock().unwrap().paused = paused;
        if let Some(transport) = self.transport.upgrade() {
            transport.signal(if paused { TransportSignal::Pause } else { TransportSignal::Resume });
        }
    }

    /// Drain: wait until all client audio has left the encoder.
    pub async fn drain(&self) -> Result<()> {
        let transport =
            self.transport.upgrade().ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        transport.signal(TransportSignal::Drain(ack_tx));

        match tokio::time::timeout(Duration::from_secs(3), ack_rx).await {
            Ok(Ok(())) => {
                self.drained.notify_waiters();
                Ok(())
            }
            Ok(Err(_)) => Err(Error::with_message(ErrorKind::Failed, "transport gone while draining")),
            Err(_) => Err(Error::with_message(ErrorKind::Failed, "drain timed out")),
        }
    }

    /// Discard audio buffered on the client side.
    pub fn drop_buffers(&self) -> Result<()> {
        let transport =
            self.transport.upgrade().ok_or_else(|| Error::new(ErrorKind::NotFound))?;
        transport.signal(TransportSignal::DropBuffers);
        Ok(())
    }

    /// Completion notifier for drains, signalled each time a drain
    /// finishes.
    pub fn drained(&self) -> &Notify {
        &self.drained
    }
}
