//! A2DP transport I/O tasks.
//!
//! Each A2DP transport runs exactly one task. The source direction reads
//! client PCM, encodes, wraps the wire frames in RTP and paces the
//! stream with the rate synchronizer; the sink direction reorders
//! incoming RTP, decodes and feeds the client pipe. Both directions park
//! on the control channel whenever no client is attached.

use std::sync::Arc;
use tokio::{io::unix::AsyncFd, sync::mpsc, task::JoinHandle};

use crate::{
    audio::{AsrSync, SoftVolume},
    codec::{self, StreamCodec},
    ffb::FixedBuffer,
    pcm::Pcm,
    rtp::{RtpHeader, SeqWindow, PAYLOAD_TYPE_MEDIA},
    sock::{self, OwnedFd},
    transport::{PcmTag, Transport, TransportSignal},
    Profile,
};

/// Reorder window of the sink direction, in packets.
const SINK_REORDER_WINDOW: usize = 8;
/// RTP media payload header carried in front of SBC frames.
const MEDIA_HEADER_LEN: usize = 1;
/// Upper bound on a silence gap repaired from RTP timestamps, in frames.
const MAX_GAP_FRAMES: u32 = 48000;

pub(crate) fn spawn(
    transport: Arc<Transport>, rx: mpsc::UnboundedReceiver<TransportSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = rx;
        let result = match transport.profile {
            Profile::A2dpSource => Worker::new(transport.clone()).run_source(&mut rx).await,
            Profile::A2dpSink => Worker::new(transport.clone()).run_sink(&mut rx).await,
            profile => {
                log::error!("{}: not an A2DP profile: {profile}", transport.path);
                return;
            }
        };
        if let Err(err) = result {
            log::error!("{}: I/O task failed: {err}", transport.path);
            transport.release_bt();
        }
    })
}

struct Worker {
    transport: Arc<Transport>,
    pcm: Arc<Pcm>,
    codec: Option<Box<dyn StreamCodec>>,
    codec_key: (u16, Vec<u8>),
    bt: Option<Arc<AsyncFd<OwnedFd>>>,
    write_mtu: usize,
    read_mtu: usize,
    open: bool,
    paused: bool,
}

impl Worker {
    fn new(transport: Arc<Transport>) -> Self {
        let pcm = transport.pcm(PcmTag::Main).expect("A2DP transport has a main PCM").clone();
        Self {
            transport,
            pcm,
            codec: None,
            codec_key: (0, Vec::new()),
            bt: None,
            write_mtu: 0,
            read_mtu: 0,
            open: false,
            paused: false,
        }
    }

    /// Re-read shared transport state after a control message.
    fn reload(&mut self) {
        let (codec_id, configuration, bt, read_mtu, write_mtu) = self.transport.with_state(|s| {
            (s.codec, s.configuration.clone(), s.bt.clone(), s.read_mtu, s.write_mtu)
        });
        self.bt = bt;
        self.read_mtu = read_mtu.max(64);
        self.write_mtu = write_mtu.max(64);

        // Codec state does not survive the loss of the socket.
        if self.bt.is_none() {
            if let Some(codec) = &mut self.codec {
                codec.reset();
            }
        }

        let key = (codec_id, configuration);
        if self.codec.is_none() || self.codec_key != key {
            match codec::new_a2dp_stream(key.0, &key.1) {
                Ok(codec) => {
                    self.codec = Some(codec);
                    self.codec_key = key;
                }
                Err(err) => {
                    log::error!("{}: cannot initialise codec: {err}", self.transport.path);
                    self.codec = None;
                }
            }
        }
    }

    fn active(&self) -> bool {
        self.open && !self.paused && self.bt.is_some() && self.codec.is_some()
    }

    /// Update worker state from a control message. Drain and drop
    /// requests are handed back to the caller, which owns the buffers.
    fn handle_signal(&mut self, signal: Option<TransportSignal>) -> Option<TransportSignal> {
        let signal = signal?;
        match signal {
            TransportSignal::Ping => self.reload(),
            TransportSignal::PcmOpened(PcmTag::Main) => {
                self.open = true;
                self.paused = false;
                self.reload();
                if let Some(codec) = &mut self.codec {
                    codec.reset();
                }
            }
            TransportSignal::PcmClosed(PcmTag::Main) => {
                self.open = false;
            }
            TransportSignal::Pause => self.paused = true,
            TransportSignal::Resume => self.paused = false,
            other @ (TransportSignal::Drain(_) | TransportSignal::DropBuffers) => {
                return Some(other);
            }
            TransportSignal::PcmOpened(_) | TransportSignal::PcmClosed(_) => {}
        }
        None
    }

    async fn run_source(
        mut self, rx: &mut mpsc::UnboundedReceiver<TransportSignal>,
    ) -> std::io::Result<()> {
        let mut pcm_buf = FixedBuffer::new(16 * 1024);
        let mut wire = FixedBuffer::new(8 * 1024);
        let mut chunk = vec![0u8; 4096];
        let mut carry: Option<u8> = None;
        let mut softvol = SoftVolume::new();
        let mut rtp = RtpHeader::new(PAYLOAD_TYPE_MEDIA, self.pcm.sequence);
        let mut asr = AsrSync::new(44100);

        loop {
            if !self.active() {
                let Some(signal) = rx.recv().await else { return Ok(()) };
                match self.handle_signal(Some(signal)) {
                    Some(TransportSignal::Drain(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(TransportSignal::DropBuffers) => {
                        pcm_buf.rewind();
                        wire.rewind();
                        carry = None;
                    }
                    _ => {}
                }
                if self.active() {
                    let sampling = self.pcm.with_state(|s| s.sampling);
                    asr = AsrSync::new(sampling);
                    rtp.seq = rtp.seq.wrapping_add(1);
                }
                continue;
            }

            let Some((pipe, _)) = self.pcm.fds() else {
                self.open = false;
                continue;
            };

            tokio::select! {
                signal = rx.recv() => {
                    if signal.is_none() {
                        return Ok(());
                    }
                    match self.handle_signal(signal) {
                        Some(TransportSignal::Drain(ack)) => {
                            self.drain(&pipe, &mut pcm_buf, &mut wire, &mut carry, &mut softvol, &mut rtp)
                                .await?;
                            let _ = ack.send(());
                            self.pcm.drained().notify_waiters();
                        }
                        Some(TransportSignal::DropBuffers) => {
                            Self::flush_pipe(&pipe, &mut chunk);
                            pcm_buf.rewind();
                            wire.rewind();
                            carry = None;
                        }
                        _ => {}
                    }
                }
                guard = pipe.readable() => {
                    let mut guard = guard?;
                    let n = match guard.try_io(|fd| sock::read(fd.get_ref(), &mut chunk)) {
                        Ok(Ok(0)) => {
                            log::debug!("{}: client closed the PCM pipe", self.pcm.path);
                            self.pcm.close();
                            self.open = false;
                            continue;
                        }
                        Ok(Ok(n)) => n,
                        Ok(Err(err)) if transient(&err) => continue,
                        Ok(Err(err)) => return Err(err),
                        Err(_would_block) => continue,
                    };

                    self.ingest(&chunk[..n], &mut pcm_buf, &mut carry, &mut softvol);
                    let frames = match self.codec.as_mut().unwrap().encode(&mut pcm_buf, &mut wire) {
                        Ok(frames) => frames,
                        Err(err) => {
                            log::error!("{}: encoder failed: {err}", self.transport.path);
                            self.transport.release_bt();
                            continue;
                        }
                    };
                    if frames > 0 {
                        let samples = self.send_wire(&mut wire, &mut rtp).await?;
                        if samples > 0 {
                            asr.sync(samples).await;
                            self.pcm.set_delay(asr.busy_tenths_ms());
                        }
                    }
                }
            }
        }
    }

    /// Scale and append client bytes, keeping sample alignment across
    /// reads.
    fn ingest(
        &self, data: &[u8], pcm_buf: &mut FixedBuffer, carry: &mut Option<u8>, softvol: &mut SoftVolume,
    ) {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        if let Some(b) = carry.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(data);
        if bytes.len() % 2 != 0 {
            *carry = bytes.pop();
        }

        let (volume, soft, channels) =
            self.pcm.with_state(|s| (s.volume, s.soft_volume, s.channels as usize));
        if soft {
            softvol.set_volume(volume, self.pcm.max_level);
            let mut samples: Vec<i16> =
                bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
            softvol.apply(&mut samples, channels.max(1));
            for (chunk, sample) in bytes.chunks_exact_mut(2).zip(&samples) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
        }

        let appended = pcm_buf.append(&bytes);
        if appended < bytes.len() {
            log::debug!("{}: PCM buffer overrun, dropping {} bytes", self.pcm.path, bytes.len() - appended);
        }
    }

    /// Packetize buffered wire frames and send them, one RTP packet per
    /// socket write. Returns the number of PCM frames sent.
    async fn send_wire(&mut self, wire: &mut FixedBuffer, rtp: &mut RtpHeader) -> std::io::Result<usize> {
        let codec = self.codec.as_ref().unwrap();
        let frame_len = codec.frame_wire_bytes().max(1);
        let frame_samples = codec.frame_samples();
        let max_payload = self.write_mtu.saturating_sub(crate::rtp::HEADER_LEN + MEDIA_HEADER_LEN);
        let frames_per_packet = (max_payload / frame_len).clamp(1, 15);
        let mut sent_samples = 0;

        while wire.len_out() >= frame_len {
            let frames = (wire.len_out() / frame_len).min(frames_per_packet);
            let payload_len = frames * frame_len;

            let mut packet = Vec::with_capacity(crate::rtp::HEADER_LEN + MEDIA_HEADER_LEN + payload_len);
            packet.extend_from_slice(&rtp.to_bytes());
            packet.push(frames as u8);
            packet.extend_from_slice(&wire.head()[..payload_len]);

            let Some(bt) = self.bt.clone() else { break };
            loop {
                let mut guard = bt.writable().await?;
                match guard.try_io(|fd| sock::write(fd.get_ref(), &packet)) {
                    Ok(Ok(_)) => break,
                    Ok(Err(err)) if transient(&err) => continue,
                    Ok(Err(err)) => {
                        log::warn!("{}: bt write failed: {err}", self.transport.path);
                        self.transport.release_bt();
                        self.bt = None;
                        wire.rewind();
                        return Ok(sent_samples);
                    }
                    Err(_would_block) => continue,
                }
            }

            wire.shift(payload_len);
            rtp.advance((frames * frame_samples) as u32);
            sent_samples += frames * frame_samples;
        }
        Ok(sent_samples)
    }

    /// Source drain: pull everything the client wrote, pad the trailing
    /// partial frame with silence and push it all to the peer.
    async fn drain(
        &mut self, pipe: &Arc<AsyncFd<OwnedFd>>, pcm_buf: &mut FixedBuffer, wire: &mut FixedBuffer,
        carry: &mut Option<u8>, softvol: &mut SoftVolume, rtp: &mut RtpHeader,
    ) -> std::io::Result<()> {
        let mut chunk = vec![0u8; 4096];
        loop {
            match sock::read(pipe.get_ref(), &mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let data = chunk[..n].to_vec();
                    self.ingest(&data, pcm_buf, carry, softvol);
                }
                Err(err) if transient(&err) => break,
                Err(err) => return Err(err),
            }
        }

        let codec = self.codec.as_mut().unwrap();
        let frame_bytes = codec.frame_pcm_bytes();
        let residue = pcm_buf.len_out() % frame_bytes;
        if residue != 0 {
            let pad = frame_bytes - residue;
            let zeros = vec![0u8; pad.min(pcm_buf.len_in())];
            pcm_buf.append(&zeros);
        }
        if let Err(err) = codec.encode(pcm_buf, wire) {
            log::warn!("{}: encoder failed during drain: {err}", self.transport.path);
        }
        pcm_buf.rewind();
        let _ = self.send_wire(wire, rtp).await?;
        Ok(())
    }

    fn flush_pipe(pipe: &Arc<AsyncFd<OwnedFd>>, chunk: &mut [u8]) {
        while let Ok(n) = sock::read(pipe.get_ref(), chunk) {
            if n == 0 {
                break;
            }
        }
    }

    async fn run_sink(
        mut self, rx: &mut mpsc::UnboundedReceiver<TransportSignal>,
    ) -> std::io::Result<()> {
        let mut wire = FixedBuffer::new(16 * 1024);
        let mut pcm_buf = FixedBuffer::new(32 * 1024);
        let mut softvol = SoftVolume::new();
        let mut window = SeqWindow::new(SINK_REORDER_WINDOW);
        let mut expected_ts: Option<u32> = None;
        let mut packet = vec![0u8; 2048];

        loop {
            let Some(bt) = self.bt.clone() else {
                let Some(signal) = rx.recv().await else { return Ok(()) };
                if let Some(TransportSignal::Drain(ack)) = self.handle_signal(Some(signal)) {
                    let _ = ack.send(());
                }
                if self.bt.is_some() {
                    window.reset();
                    expected_ts = None;
                }
                continue;
            };

            if packet.len() < self.read_mtu {
                packet.resize(self.read_mtu, 0);
            }

            tokio::select! {
                signal = rx.recv() => {
                    if signal.is_none() {
                        return Ok(());
                    }
                    match self.handle_signal(signal) {
                        Some(TransportSignal::Drain(ack)) => {
                            let _ = ack.send(());
                        }
                        Some(TransportSignal::DropBuffers) => {
                            wire.rewind();
                            pcm_buf.rewind();
                        }
                        _ => {}
                    }
                }
                guard = bt.readable() => {
                    let mut guard = guard?;
                    let n = match guard.try_io(|fd| sock::read(fd.get_ref(), &mut packet)) {
                        Ok(Ok(0)) => {
                            log::debug!("{}: peer hung up", self.transport.path);
                            self.transport.release_bt();
                            self.bt = None;
                            continue;
                        }
                        Ok(Ok(n)) => n,
                        Ok(Err(err)) if transient(&err) => continue,
                        Ok(Err(err)) => {
                            log::warn!("{}: bt read failed: {err}", self.transport.path);
                            self.transport.release_bt();
                            self.bt = None;
                            continue;
                        }
                        Err(_would_block) => continue,
                    };

                    if !self.open || self.paused || self.codec.is_none() {
                        // Keep the link drained while no client listens.
                        continue;
                    }

                    let Some((header, payload)) = RtpHeader::parse(&packet[..n]) else {
                        log::debug!("{}: dropping non-RTP packet", self.transport.path);
                        continue;
                    };
                    let payload = if payload.len() > MEDIA_HEADER_LEN {
                        payload[MEDIA_HEADER_LEN..].to_vec()
                    } else {
                        continue;
                    };

                    for ordered in window.push(header.seq, header.timestamp, payload) {
                        self.decode_ordered(&ordered, &mut expected_ts, &mut wire, &mut pcm_buf, &mut softvol);
                    }
                }
            }
        }
    }

    /// Decode one reordered packet, repairing timestamp gaps with
    /// silence.
    fn decode_ordered(
        &mut self, ordered: &crate::rtp::Ordered, expected_ts: &mut Option<u32>,
        wire: &mut FixedBuffer, pcm_buf: &mut FixedBuffer, softvol: &mut SoftVolume,
    ) {
        let channels = self.pcm.with_state(|s| s.channels as usize).max(1);

        if let Some(expected) = *expected_ts {
            let gap = ordered.timestamp.wrapping_sub(expected);
            if gap > 0 && gap <= MAX_GAP_FRAMES {
                log::debug!("{}: packet loss, inserting {gap} frames of silence", self.transport.path);
                let silence = vec![0u8; gap as usize * channels * 2];
                self.write_client(&silence, pcm_buf);
            }
        }

        wire.append(&ordered.payload);
        let codec = self.codec.as_mut().unwrap();
        let mut decoded = FixedBuffer::new(codec.frame_pcm_bytes().max(1024) * 4);
        let frames = match codec.decode(wire, &mut decoded) {
            Ok(frames) => frames,
            Err(err) => {
                log::warn!("{}: decoder failed: {err}", self.transport.path);
                wire.rewind();
                return;
            }
        };
        *expected_ts = Some(ordered.timestamp.wrapping_add((frames * codec.frame_samples()) as u32));
        if frames == 0 {
            return;
        }

        let (volume, soft) = self.pcm.with_state(|s| (s.volume, s.soft_volume));
        if soft {
            softvol.set_volume(volume, self.pcm.max_level);
            let mut samples: Vec<i16> =
                decoded.head().chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
            softvol.apply(&mut samples, channels);
            for (chunk, sample) in decoded.head_mut().chunks_exact_mut(2).zip(&samples) {
                chunk.copy_from_slice(&sample.to_le_bytes());
            }
        }

        let data = decoded.head().to_vec();
        self.write_client(&data, pcm_buf);
    }

    /// Best-effort write towards the client pipe; a slow client loses
    /// audio rather than stalling the link.
    fn write_client(&self, data: &[u8], stash: &mut FixedBuffer) {
        let Some((pipe, _)) = self.pcm.fds() else { return };
        stash.append(data);
        while stash.len_out() > 0 {
            match sock::write(pipe.get_ref(), stash.head()) {
                Ok(n) if n > 0 => stash.shift(n),
                Ok(_) => break,
                Err(err) if transient(&err) => {
                    if stash.len_in() == 0 {
                        log::debug!("{}: client too slow, dropping audio", self.pcm.path);
                        stash.rewind();
                    }
                    break;
                }
                Err(err) => {
                    log::debug!("{}: client pipe error: {err}", self.pcm.path);
                    break;
                }
            }
        }
    }
}

/// Errors the I/O loops absorb locally.
fn transient(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted)
}
