//! SCO engine: connection dispatcher and voice link I/O.

use std::{sync::Arc, time::Duration};
use tokio::{
    io::unix::AsyncFd,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    adapter::Adapter,
    audio::SoftVolume,
    codec::{self, StreamCodec},
    ffb::FixedBuffer,
    hci,
    pcm::Pcm,
    sock::{self, OwnedFd},
    sys::{BT_VOICE_CVSD_16BIT, BT_VOICE_TRANSPARENT},
    transport::{PcmTag, Transport, TransportSignal},
};

/// Time the encoder gets to flush residual audio on drain.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
/// Grace period an idle gateway keeps the SCO link up after the last
/// PCM closes.
const LINGER_TIMEOUT: Duration = Duration::from_millis(1000);
/// Settle time between releasing the socket and accepting a new open.
const CLOSING_TIMEOUT: Duration = Duration::from_millis(600);

/// Run the SCO connection-acceptance dispatcher for an adapter.
///
/// The dispatcher owns the listening socket with deferred setup enabled
/// and routes every accepted link to the SCO transport of the
/// originating device.
pub(crate) fn spawn_dispatcher(adapter: Arc<Adapter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match hci::sco_listen(adapter.info.address).and_then(AsyncFd::new) {
            Ok(fd) => fd,
            Err(err) => {
                log::error!("{}: cannot listen for SCO connections: {err}", adapter.info.name);
                return;
            }
        };
        log::info!("{}: SCO dispatcher started", adapter.info.name);

        loop {
            let mut guard = match listener.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    log::error!("{}: SCO dispatcher failed: {err}", adapter.info.name);
                    return;
                }
            };
            let (fd, peer) = match guard.try_io(|l| hci::sco_accept(l.get_ref())) {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(err)) => {
                    log::warn!("{}: SCO accept failed: {err}", adapter.info.name);
                    continue;
                }
                Err(_would_block) => continue,
            };

            if let Err(err) = dispatch(&adapter, fd, peer).await {
                log::warn!("{}: dropping SCO connection from {}: {err}", adapter.info.name, peer);
            }
        }
    })
}

async fn dispatch(adapter: &Arc<Adapter>, fd: OwnedFd, peer: crate::Address) -> crate::Result<()> {
    let device = adapter
        .lookup_device(peer)
        .ok_or_else(|| crate::Error::with_message(crate::ErrorKind::NotFound, "unknown device"))?;
    let transport = device
        .sco_transport()
        .ok_or_else(|| crate::Error::with_message(crate::ErrorKind::NotFound, "no SCO transport"))?;

    // For mSBC the controller must hand us the transparent air frames;
    // the one-byte read completes the deferred setup.
    if transport.codec() == crate::codec_id::MSBC {
        hci::set_voice(&fd, BT_VOICE_TRANSPARENT)?;
        let afd = AsyncFd::new(fd)?;
        let mut byte = [0u8; 1];
        loop {
            let mut guard = afd.readable().await?;
            match guard.try_io(|f| sock::read(f.get_ref(), &mut byte)) {
                Ok(_) => break,
                Err(_would_block) => continue,
            }
        }
        let fd = afd.into_inner();
        install(&transport, fd, adapter.info.sco_mtu as usize)?;
    } else {
        install(&transport, fd, adapter.info.sco_mtu as usize)?;
    }

    log::info!("{}: SCO link established with {}", adapter.info.name, peer);
    Ok(())
}

fn install(transport: &Arc<Transport>, fd: OwnedFd, fallback_mtu: usize) -> crate::Result<()> {
    let (read_mtu, write_mtu) = hci::sco_mtu(&fd).unwrap_or((fallback_mtu, fallback_mtu));
    transport.install_bt(fd, read_mtu.max(1), write_mtu.max(1))?;
    Ok(())
}

/// Establish an outbound SCO link; gateways initiate when a client opens
/// a PCM while no link exists.
pub(crate) async fn connect(transport: &Arc<Transport>) -> crate::Result<()> {
    let device = transport
        .device
        .upgrade()
        .ok_or_else(|| crate::Error::new(crate::ErrorKind::NotFound))?;
    let adapter = device
        .adapter
        .upgrade()
        .ok_or_else(|| crate::Error::new(crate::ErrorKind::NotFound))?;

    let voice = if transport.codec() == crate::codec_id::MSBC {
        BT_VOICE_TRANSPARENT
    } else {
        BT_VOICE_CVSD_16BIT
    };
    let fd = hci::sco_connect(adapter.info.address, device.address, voice)?;
    let afd = AsyncFd::new(fd)?;
    loop {
        let mut guard = afd.writable().await?;
        match guard.try_io(|f| hci::finish_connect(f.get_ref())) {
            Ok(Ok(())) => break,
            Ok(Err(err)) => return Err(err.into()),
            Err(_would_block) => continue,
        }
    }

    install(transport, afd.into_inner(), adapter.info.sco_mtu as usize)?;
    log::info!("{}: outbound SCO link established", transport.path);
    Ok(())
}

/// SCO transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoState {
    /// Both PCMs closed, nothing flows.
    Idle,
    /// Audio is being forwarded.
    Running,
    /// A drain was requested; the flush timer is armed.
    Draining,
    /// Gateway only: PCMs closed, link kept up for a quick re-open.
    Linger,
    /// Socket released, settle period before the next open.
    Closing,
}

pub(crate) fn spawn(
    transport: Arc<Transport>, rx: mpsc::UnboundedReceiver<TransportSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = rx;
        Worker::new(transport).run(&mut rx).await;
    })
}

struct Worker {
    transport: Arc<Transport>,
    spk: Arc<Pcm>,
    mic: Arc<Pcm>,
    codec: Option<Box<dyn StreamCodec>>,
    codec_id: u16,
    bt: Option<Arc<AsyncFd<OwnedFd>>>,
    write_mtu: usize,
    read_mtu: usize,
    state: ScoState,
    deadline: Option<Instant>,
    drain_ack: Option<oneshot::Sender<()>>,
}

impl Worker {
    fn new(transport: Arc<Transport>) -> Self {
        let spk = transport.pcm(PcmTag::Spk).expect("SCO transport has a spk PCM").clone();
        let mic = transport.pcm(PcmTag::Mic).expect("SCO transport has a mic PCM").clone();
        Self {
            transport,
            spk,
            mic,
            codec: None,
            codec_id: 0,
            bt: None,
            write_mtu: 0,
            read_mtu: 0,
            state: ScoState::Idle,
            deadline: None,
            drain_ack: None,
        }
    }

    fn reload(&mut self) {
        let (codec_id, bt, read_mtu, write_mtu) =
            self.transport.with_state(|s| (s.codec, s.bt.clone(), s.read_mtu, s.write_mtu));
        self.bt = bt;
        self.read_mtu = read_mtu.max(1);
        self.write_mtu = write_mtu.max(1);

        // Codec state does not survive the loss of the socket.
        if self.bt.is_none() {
            if let Some(codec) = &mut self.codec {
                codec.reset();
            }
        }

        if self.codec.is_none() || self.codec_id != codec_id {
            match codec::new_sco_stream(codec_id, self.write_mtu) {
                Ok(codec) => {
                    self.codec = Some(codec);
                    self.codec_id = codec_id;
                }
                Err(err) => {
                    log::error!("{}: cannot initialise codec: {err}", self.transport.path);
                    self.codec = None;
                }
            }
        }
    }

    fn any_pcm_open(&self) -> bool {
        self.spk.is_open() || self.mic.is_open()
    }

    fn arm(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    fn enter(&mut self, state: ScoState) {
        if self.state != state {
            log::trace!("{}: {:?} -> {:?}", self.transport.path, self.state, state);
            self.state = state;
        }
        match state {
            ScoState::Draining => self.arm(DRAIN_TIMEOUT),
            ScoState::Linger => self.arm(LINGER_TIMEOUT),
            ScoState::Closing => self.arm(CLOSING_TIMEOUT),
            ScoState::Idle | ScoState::Running => self.deadline = None,
        }
    }

    /// Timer expiry is the only place timed transitions happen, so they
    /// always run on the I/O task.
    fn on_timer(&mut self) {
        self.deadline = None;
        match self.state {
            ScoState::Draining => {
                if let Some(ack) = self.drain_ack.take() {
                    let _ = ack.send(());
                }
                self.spk.drained().notify_waiters();
                self.enter(ScoState::Running);
            }
            ScoState::Linger => {
                log::debug!("{}: linger expired, releasing SCO socket", self.transport.path);
                self.bt = None;
                self.transport.release_bt();
                self.enter(ScoState::Closing);
            }
            ScoState::Closing => self.enter(ScoState::Idle),
            ScoState::Idle | ScoState::Running => {}
        }
    }

    fn handle_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::Ping => {
                self.reload();
                if self.bt.is_some() && self.any_pcm_open() && self.state != ScoState::Draining {
                    self.enter(ScoState::Running);
                }
                if self.bt.is_none()
                    && matches!(self.state, ScoState::Running | ScoState::Draining)
                {
                    // Link lost; stay alive and wait for the dispatcher
                    // to reinstall a socket.
                    if let Some(ack) = self.drain_ack.take() {
                        let _ = ack.send(());
                    }
                }
            }
            TransportSignal::PcmOpened(_) => {
                self.reload();
                if matches!(self.state, ScoState::Idle | ScoState::Linger | ScoState::Closing) {
                    self.enter(ScoState::Running);
                }
            }
            TransportSignal::PcmClosed(_) => {
                if !self.any_pcm_open() && self.state != ScoState::Idle {
                    if self.transport.profile.is_ag() {
                        self.enter(ScoState::Linger);
                    } else {
                        // The remote retains the bandwidth decision.
                        self.enter(ScoState::Idle);
                    }
                }
            }
            TransportSignal::Pause => {
                if self.state == ScoState::Running {
                    self.enter(ScoState::Idle);
                }
            }
            TransportSignal::Resume => {
                if self.any_pcm_open() {
                    self.enter(ScoState::Running);
                }
            }
            TransportSignal::Drain(ack) => {
                if self.state == ScoState::Running {
                    self.drain_ack = Some(ack);
                    self.enter(ScoState::Draining);
                } else {
                    let _ = ack.send(());
                }
            }
            TransportSignal::DropBuffers => {}
        }
    }

    async fn run(mut self, rx: &mut mpsc::UnboundedReceiver<TransportSignal>) {
        let mut spk_buf = FixedBuffer::new(8 * 1024);
        let mut wire_out = FixedBuffer::new(4 * 1024);
        let mut wire_in = FixedBuffer::new(4 * 1024);
        let mut mic_stash = FixedBuffer::new(8 * 1024);
        let mut spk_vol = SoftVolume::new();
        let mut mic_vol = SoftVolume::new();
        let mut carry: Option<u8> = None;

        loop {
            // Connect on demand: a gateway with an open PCM and no link
            // dials out.
            if matches!(self.state, ScoState::Running | ScoState::Draining)
                && self.bt.is_none()
                && self.transport.profile.is_ag()
                && self.any_pcm_open()
            {
                if let Err(err) = connect(&self.transport).await {
                    log::warn!("{}: outbound SCO connect failed: {err}", self.transport.path);
                    self.enter(ScoState::Idle);
                }
                self.reload();
            }

            let forwarding = matches!(self.state, ScoState::Running | ScoState::Draining);
            let bt = self.bt.clone();
            let bt_ok = forwarding && bt.is_some();
            let spk_pipe = self.spk.fds().map(|(pipe, _)| pipe);
            let spk_ok = bt_ok && spk_pipe.is_some();

            tokio::select! {
                signal = rx.recv() => {
                    let Some(signal) = signal else { return };
                    if let TransportSignal::DropBuffers = signal {
                        spk_buf.rewind();
                        wire_out.rewind();
                        carry = None;
                        if let Some(pipe) = &spk_pipe {
                            let mut chunk = [0u8; 1024];
                            while matches!(sock::read(pipe.get_ref(), &mut chunk), Ok(n) if n > 0) {}
                        }
                    } else {
                        self.handle_signal(signal);
                    }
                }
                _ = tokio::time::sleep_until(self.deadline.unwrap_or_else(Instant::now)),
                    if self.deadline.is_some() =>
                {
                    self.on_timer();
                }
                data = read_fd(bt.clone(), self.read_mtu), if bt_ok => {
                    match data {
                        Ok(data) if data.is_empty() => {
                            log::debug!("{}: SCO hangup", self.transport.path);
                            self.bt = None;
                            self.transport.release_bt();
                        }
                        Ok(data) => {
                            self.incoming(&data, &mut wire_in, &mut mic_stash, &mut mic_vol);
                        }
                        Err(err) => {
                            log::debug!("{}: SCO read failed: {err}", self.transport.path);
                            self.bt = None;
                            self.transport.release_bt();
                        }
                    }
                }
                data = read_fd(spk_pipe.clone(), 1024), if spk_ok => {
                    match data {
                        Ok(data) if data.is_empty() => {
                            self.spk.close();
                        }
                        Ok(data) => {
                            self.outgoing(&data, &mut spk_buf, &mut wire_out, &mut carry, &mut spk_vol)
                                .await;
                        }
                        Err(err) => {
                            log::debug!("{}: spk pipe failed: {err}", self.spk.path);
                            self.spk.close();
                        }
                    }
                }
            }
        }
    }

    /// Peer-to-client path: decode and forward to the microphone PCM.
    fn incoming(
        &mut self, data: &[u8], wire_in: &mut FixedBuffer, stash: &mut FixedBuffer,
        softvol: &mut SoftVolume,
    ) {
        let Some(codec) = self.codec.as_mut() else { return };
        wire_in.append(data);

        let mut decoded = FixedBuffer::new(4 * 1024);
        match codec.decode(wire_in, &mut decoded) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                log::warn!("{}: decoder failed: {err}", self.transport.path);
                wire_in.rewind();
                return;
            }
        }

        let Some((pipe, _)) = self.mic.fds() else {
            // No client on the microphone side; the link still has to be
            // drained.
            return;
        };

        let (volume, soft) = self.mic.with_state(|s| (s.volume, s.soft_volume));
        if soft {
            softvol.set_volume(volume, self.mic.max_level);
            let mut samples: Vec<i16> =
                decoded.head().chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
            softvol.apply(&mut samples, 1);
            for (chunk, sample) in decoded.head_mut().chunks_exact_mut(2).zip(&samples) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
        }

        stash.append(decoded.head());
        while stash.len_out() > 0 {
            match sock::write(pipe.get_ref(), stash.head()) {
                Ok(n) if n > 0 => stash.shift(n),
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if stash.len_in() == 0 {
                        stash.rewind();
                    }
                    break;
                }
                Err(_) => break,
            }
        }
    }

    /// Client-to-peer path: encode and write to the SCO socket.
    async fn outgoing(
        &mut self, data: &[u8], spk_buf: &mut FixedBuffer, wire_out: &mut FixedBuffer,
        carry: &mut Option<u8>, softvol: &mut SoftVolume,
    ) {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        if let Some(b) = carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(data);
        if bytes.len() % 2 != 0 {
            *carry = bytes.pop();
        }

        let (volume, soft) = self.spk.with_state(|s| (s.volume, s.soft_volume));
        if soft {
            softvol.set_volume(volume, self.spk.max_level);
            let mut samples: Vec<i16> =
                bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
            softvol.apply(&mut samples, 1);
            for (chunk, sample) in bytes.chunks_exact_mut(2).zip(&samples) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
        }
        spk_buf.append(&bytes);

        let Some(codec) = self.codec.as_mut() else { return };
        if let Err(err) = codec.encode(spk_buf, wire_out) {
            log::warn!("{}: encoder failed: {err}", self.transport.path);
            spk_buf.rewind();
            return;
        }
        let frame_len = codec.frame_wire_bytes().max(1);

        // One codec frame per socket write, further split to the MTU
        // when the link cannot carry a whole frame.
        while wire_out.len_out() > 0 {
            let Some(bt) = self.bt.clone() else { break };
            let n = wire_out.len_out().min(self.write_mtu).min(frame_len);
            let packet = wire_out.head()[..n].to_vec();
            let result = async {
                loop {
                    let mut guard = bt.writable().await?;
                    match guard.try_io(|f| sock::write(f.get_ref(), &packet)) {
                        Ok(result) => return result,
                        Err(_would_block) => continue,
                    }
                }
            }
            .await;
            match result {
                Ok(_) => wire_out.shift(n),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("{}: SCO write failed: {err}", self.transport.path);
                    self.bt = None;
                    self.transport.release_bt();
                    wire_out.rewind();
                    break;
                }
            }
        }
    }
}

/// Wait for readability and read one packet, returning the bytes.
///
/// An empty vector signals end of file. The descriptor is optional so
/// that disabled select branches can be constructed safely; polling a
/// `None` future is a logic error.
async fn read_fd(fd: Option<Arc<AsyncFd<OwnedFd>>>, max: usize) -> std::io::Result<Vec<u8>> {
    let fd = fd.expect("read_fd polled without descriptor");
    let mut buf = vec![0u8; max.max(1)];
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|f| sock::read(f.get_ref(), &mut buf)) {
            Ok(Ok(n)) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
}
