//! RFCOMM workers: the AT protocol side of HFP and HSP.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use std::sync::{Arc, Mutex, Weak};
use tokio::{io::unix::AsyncFd, sync::mpsc, task::JoinHandle};

use crate::{
    at::{AtMessage, AtResult, LineBuffer},
    audio::Volume,
    codec_id,
    device::Device,
    engine::{GraphEvent, GraphEvents, RfcommProperty},
    sock::{self, OwnedFd},
    transport::PcmTag,
    Error, ErrorKind, Profile, Result,
};

/// AG feature mask announced in `+BRSF`: call rejection, enhanced call
/// status, extended error codes and codec negotiation.
pub const AG_FEATURES: u32 = (1 << 5) | (1 << 6) | (1 << 8) | (1 << 9);
/// HF feature mask announced in `AT+BRSF`: remote volume control,
/// enhanced call status and codec negotiation.
pub const HF_FEATURES: u32 = (1 << 4) | (1 << 5) | (1 << 7);

/// AG feature bit for codec negotiation.
const AG_FEAT_CODEC: u32 = 1 << 9;
/// HF feature bit for codec negotiation.
const HF_FEAT_CODEC: u32 = 1 << 7;

/// Indicators announced by the AG side, with their value ranges.
const INDICATORS: &[(&str, &str, u8)] = &[
    ("service", "(0,1)", 0),
    ("call", "(0,1)", 0),
    ("callsetup", "(0-3)", 0),
    ("callheld", "(0-2)", 0),
    ("signal", "(0-5)", 0),
    ("roam", "(0,1)", 0),
    ("battchg", "(0-5)", 5),
];

/// HFP codec identifiers negotiated via `AT+BAC` and `+BCS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum HfpCodecId {
    /// Narrow-band CVSD.
    Cvsd = 1,
    /// Wideband mSBC.
    Msbc = 2,
}

/// Commands accepted by the worker from the rest of the daemon.
#[derive(Debug)]
pub enum RfcommCmd {
    /// Send a raw AT message on the channel.
    Send(AtMessage),
    /// Propagate a speaker gain change to the peer.
    SpeakerGain(u8),
    /// Propagate a microphone gain change to the peer.
    MicGain(u8),
}

/// Mutable session state.
#[derive(Debug, Default)]
pub struct RfcommState {
    /// Feature mask of the remote side.
    pub remote_features: u32,
    /// Codecs the remote announced via `AT+BAC`.
    pub remote_codecs: Vec<u16>,
    /// Battery level reported by the peer, 0-100.
    pub battery: Option<u8>,
    /// Whether the service-level connection completed.
    pub slc_done: bool,
    /// Engine end of the client dispatch socket.
    pub dispatch: Option<Arc<AsyncFd<OwnedFd>>>,
}

/// An RFCOMM session: the AT link of one HFP/HSP connection.
pub struct RfcommSession {
    /// Owning device.
    pub device: Weak<Device>,
    /// Local profile role.
    pub profile: Profile,
    /// D-Bus object path.
    pub path: String,
    state: Mutex<RfcommState>,
    cmd: Mutex<Option<mpsc::UnboundedSender<RfcommCmd>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: GraphEvents,
}

impl std::fmt::Debug for RfcommSession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RfcommSession {{ {} }}", self.path)
    }
}

impl RfcommSession {
    /// Start a worker on a connected RFCOMM stream.
    pub fn spawn(
        device: &Arc<Device>, profile: Profile, fd: OwnedFd, events: GraphEvents,
    ) -> Result<Arc<Self>> {
        let session = Arc::new(Self {
            device: Arc::downgrade(device),
            profile,
            path: format!("{}/rfcomm", device.path()),
            state: Mutex::new(RfcommState::default()),
            cmd: Mutex::new(None),
            task: Mutex::new(None),
            events,
        });

        let afd = Arc::new(AsyncFd::new(fd)?);
        let (tx, rx) = mpsc::unbounded_channel();
        *session.cmd.lock().unwrap() = Some(tx);
        let worker = Worker { session: session.clone(), afd };
        *session.task.lock().unwrap() = Some(tokio::spawn(worker.run(rx)));
        Ok(session)
    }

    /// Run a closure under the session state lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut RfcommState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Remote feature mask.
    pub fn features(&self) -> u32 {
        self.state.lock().unwrap().remote_features
    }

    /// Battery level reported by the peer.
    pub fn battery(&self) -> Option<u8> {
        self.state.lock().unwrap().battery
    }

    /// Open the dispatch socket: unrecognised AT traffic is forwarded to
    /// the returned descriptor, and datagrams written to it are sent on
    /// the RFCOMM channel verbatim.
    pub fn open_dispatch(&self) -> Result<OwnedFd> {
        let mut state = self.state.lock().unwrap();
        if state.dispatch.is_some() {
            return Err(Error::with_message(ErrorKind::NotAvailable, "dispatch socket is already open"));
        }
        let (engine, client) = sock::seqpacket_pair()?;
        sock::set_blocking(&client)?;
        state.dispatch = Some(Arc::new(AsyncFd::new(engine)?));
        Ok(client)
    }

    /// Queue a command for the worker.
    pub fn send(&self, cmd: RfcommCmd) {
        if let Some(tx) = &*self.cmd.lock().unwrap() {
            let _ = tx.send(cmd);
        }
    }

    /// Stop the worker and drop the channel descriptors.
    pub fn teardown(&self) {
        *self.cmd.lock().unwrap() = None;
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.state.lock().unwrap().dispatch = None;
    }

    fn set_remote_features(&self, features: u32) {
        self.state.lock().unwrap().remote_features = features;
        let _ = self.events.send(GraphEvent::RfcommChanged {
            path: self.path.clone(),
            properties: vec![RfcommProperty::Features(features)],
        });
    }

    fn set_battery(&self, level: u8) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if state.battery == Some(level) {
                false
            } else {
                state.battery = Some(level);
                true
            }
        };
        if changed {
            let _ = self.events.send(GraphEvent::RfcommChanged {
                path: self.path.clone(),
                properties: vec![RfcommProperty::Battery(level)],
            });
        }
    }

    /// Update a PCM volume from an AT gain value on the 0-15 scale.
    fn gain_to_volume(&self, tag: PcmTag, gain: u8) {
        let Some(device) = self.device.upgrade() else { return };
        let Some(transport) = device.sco_transport() else { return };
        let Some(pcm) = transport.pcm(tag) else { return };
        pcm.set_volume(Volume::from_level(gain.min(Volume::SCO_MAX)));
    }

    /// Switch the SCO transport codec after `+BCS` negotiation; a live
    /// link is torn down so the next open uses the new settings.
    fn select_codec(&self, codec: u16) {
        let Some(device) = self.device.upgrade() else { return };
        let Some(transport) = device.sco_transport() else { return };
        transport.set_codec(codec, Vec::new());
    }
}

impl Drop for RfcommSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

struct Worker {
    session: Arc<RfcommSession>,
    afd: Arc<AsyncFd<OwnedFd>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<RfcommCmd>) {
        if let Err(err) = self.run_inner(&mut rx).await {
            log::warn!("{}: RFCOMM worker failed: {err}", self.session.path);
        }
        if let Some(device) = self.session.device.upgrade() {
            device.remove_rfcomm();
        }
    }

    async fn run_inner(&self, rx: &mut mpsc::UnboundedReceiver<RfcommCmd>) -> Result<()> {
        let mut lines = LineBuffer::new();

        // The hands-free side opens the service-level connection.
        if matches!(self.session.profile, Profile::HfpHf) {
            self.send_at(AtMessage::Set { command: "+BRSF".into(), value: HF_FEATURES.to_string() })
                .await?;
        }

        loop {
            let dispatch = self.session.with_state(|s| s.dispatch.clone());
            let dispatch_ok = dispatch.is_some();

            tokio::select! {
                data = read_some(self.afd.clone()) => {
                    let data = data?;
                    if data.is_empty() {
                        log::info!("{}: peer closed the RFCOMM channel", self.session.path);
                        return Ok(());
                    }
                    for line in lines.feed(&data) {
                        log::trace!("{}: << {line}", self.session.path);
                        self.handle_line(&line).await?;
                    }
                }
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()) };
                    self.handle_cmd(cmd).await?;
                }
                data = read_opt(dispatch.clone()), if dispatch_ok => {
                    match data {
                        Ok(data) if data.is_empty() => {
                            log::debug!("{}: dispatch client closed", self.session.path);
                            self.session.with_state(|s| s.dispatch = None);
                        }
                        Ok(data) => {
                            // Client-originated AT traffic goes out verbatim.
                            self.write_raw(&data).await?;
                        }
                        Err(err) => {
                            log::debug!("{}: dispatch socket error: {err}", self.session.path);
                            self.session.with_state(|s| s.dispatch = None);
                        }
                    }
                }
            }
        }
    }

    async fn handle_cmd(&self, cmd: RfcommCmd) -> Result<()> {
        let at = match (cmd, self.session.profile.is_ag()) {
            (RfcommCmd::Send(at), _) => at,
            // The gateway announces gains as unsolicited responses, the
            // remote-controlled side as commands.
            (RfcommCmd::SpeakerGain(gain), true) => {
                AtMessage::Response { command: "+VGS".into(), value: format!(" {gain}") }
            }
            (RfcommCmd::SpeakerGain(gain), false) => {
                AtMessage::Set { command: "+VGS".into(), value: gain.to_string() }
            }
            (RfcommCmd::MicGain(gain), true) => {
                AtMessage::Response { command: "+VGM".into(), value: format!(" {gain}") }
            }
            (RfcommCmd::MicGain(gain), false) => {
                AtMessage::Set { command: "+VGM".into(), value: gain.to_string() }
            }
        };
        self.send_at(at).await
    }

    async fn handle_line(&self, line: &str) -> Result<()> {
        let message = AtMessage::parse(line);
        if self.session.profile.is_ag() {
            self.handle_ag(message, line).await
        } else {
            self.handle_hf(message, line).await
        }
    }

    /// Gateway side: answer the hands-free unit.
    async fn handle_ag(&self, message: AtMessage, raw: &str) -> Result<()> {
        match message {
            AtMessage::Set { command, value } => match command.as_str() {
                "+BRSF" => {
                    let features = value.trim().parse().unwrap_or(0);
                    self.session.set_remote_features(features);
                    self.respond("+BRSF", &format!(" {AG_FEATURES}")).await?;
                    self.result(AtResult::Ok).await
                }
                "+BAC" => {
                    let codecs: Vec<u16> =
                        value.split(',').filter_map(|c| c.trim().parse().ok()).collect();
                    self.session.with_state(|s| s.remote_codecs = codecs);
                    self.result(AtResult::Ok).await
                }
                "+CMER" => {
                    self.result(AtResult::Ok).await?;
                    let was_done = self.session.with_state(|s| {
                        let was = s.slc_done;
                        s.slc_done = true;
                        was
                    });
                    if !was_done {
                        log::info!("{}: service-level connection established", self.session.path);
                        self.negotiate_codec().await?;
                    }
                    Ok(())
                }
                "+BCS" => {
                    let codec = value.trim().parse().ok().and_then(HfpCodecId::from_u16);
                    match codec {
                        Some(codec) => {
                            self.result(AtResult::Ok).await?;
                            self.session.select_codec(codec as u16);
                            Ok(())
                        }
                        None => self.result(AtResult::Error).await,
                    }
                }
                "+VGS" => {
                    let gain = value.trim().parse().unwrap_or(0);
                    self.session.gain_to_volume(PcmTag::Spk, gain);
                    self.result(AtResult::Ok).await
                }
                "+VGM" => {
                    let gain = value.trim().parse().unwrap_or(0);
                    self.session.gain_to_volume(PcmTag::Mic, gain);
                    self.result(AtResult::Ok).await
                }
                "+XAPL" => {
                    self.write_raw(b"\r\n+XAPL=iPhone,6\r\n").await?;
                    self.result(AtResult::Ok).await
                }
                "+IPHONEACCEV" => {
                    self.handle_xapl_accessory_event(&value);
                    self.result(AtResult::Ok).await
                }
                "+CHLD" | "+CCWA" | "+CLIP" | "+CLCC" | "+NREC" | "+BIA" | "+CMEE" => {
                    self.result(AtResult::Ok).await
                }
                _ => self.forward_or_error(raw).await,
            },
            AtMessage::Test { command } => match command.as_str() {
                "+CIND" => {
                    let list: Vec<String> = INDICATORS
                        .iter()
                        .map(|(name, range, _)| format!("(\"{name}\",{range})"))
                        .collect();
                    self.respond("+CIND", &format!(" {}", list.join(","))).await?;
                    self.result(AtResult::Ok).await
                }
                "+CHLD" => {
                    self.respond("+CHLD", " (0,1,2,3)").await?;
                    self.result(AtResult::Ok).await
                }
                _ => self.forward_or_error(raw).await,
            },
            AtMessage::Get { command } => match command.as_str() {
                "+CIND" => {
                    let values: Vec<String> =
                        INDICATORS.iter().map(|(_, _, value)| value.to_string()).collect();
                    self.respond("+CIND", &format!(" {}", values.join(","))).await?;
                    self.result(AtResult::Ok).await
                }
                _ => self.forward_or_error(raw).await,
            },
            AtMessage::Response { .. } | AtMessage::Result(_) | AtMessage::Raw(_) => {
                self.forward_or_error(raw).await
            }
        }
    }

    /// Hands-free side: drive the handshake and track the gateway.
    async fn handle_hf(&self, message: AtMessage, raw: &str) -> Result<()> {
        match message {
            AtMessage::Response { command, value } => match command.as_str() {
                "+BRSF" => {
                    let features = value.trim().parse().unwrap_or(0);
                    self.session.set_remote_features(features);
                    Ok(())
                }
                "+BCS" => {
                    let codec = value
                        .trim()
                        .parse()
                        .ok()
                        .and_then(HfpCodecId::from_u16)
                        .unwrap_or(HfpCodecId::Cvsd);
                    self.send_at(AtMessage::Set {
                        command: "+BCS".into(),
                        value: (codec as u16).to_string(),
                    })
                    .await?;
                    self.session.select_codec(codec as u16);
                    Ok(())
                }
                "+VGS" => {
                    let gain = value.trim().parse().unwrap_or(0);
                    self.session.gain_to_volume(PcmTag::Spk, gain);
                    Ok(())
                }
                "+VGM" => {
                    let gain = value.trim().parse().unwrap_or(0);
                    self.session.gain_to_volume(PcmTag::Mic, gain);
                    Ok(())
                }
                "+CIEV" | "+CIND" | "+CHLD" => self.forward(raw).await,
                _ => self.forward(raw).await,
            },
            AtMessage::Result(AtResult::Ok) => self.advance_slc().await,
            AtMessage::Result(AtResult::Error) => {
                log::warn!("{}: gateway rejected a command", self.session.path);
                self.advance_slc().await
            }
            AtMessage::Result(AtResult::Ring) => self.forward(raw).await,
            _ => self.forward(raw).await,
        }
    }

    /// Step the hands-free handshake each time the gateway confirms a
    /// command.
    ///
    /// Progress is derived from what the session learned so far: the
    /// `+BRSF` response precedes the first confirmation, `AT+BAC`
    /// follows it, and the indicator/reporting commands complete the
    /// connection.
    async fn advance_slc(&self) -> Result<()> {
        enum Next {
            Wait,
            Bac,
            Indicators,
        }
        let next = self.session.with_state(|s| {
            if s.slc_done || s.remote_features == 0 {
                Next::Wait
            } else if s.remote_codecs.is_empty() {
                // Our own codec list doubles as the sent-BAC marker.
                s.remote_codecs = vec![codec_id::CVSD, codec_id::MSBC];
                Next::Bac
            } else {
                s.slc_done = true;
                Next::Indicators
            }
        });
        match next {
            Next::Wait => Ok(()),
            Next::Bac => {
                let codecs = format!("{},{}", codec_id::CVSD, codec_id::MSBC);
                self.send_at(AtMessage::Set { command: "+BAC".into(), value: codecs }).await
            }
            Next::Indicators => {
                self.send_at(AtMessage::Test { command: "+CIND".into() }).await?;
                self.send_at(AtMessage::Get { command: "+CIND".into() }).await?;
                self.send_at(AtMessage::Set { command: "+CMER".into(), value: "3,0,0,1".into() })
                    .await?;
                log::info!("{}: service-level connection established", self.session.path);
                Ok(())
            }
        }
    }

    /// After SLC completion the gateway picks the best common codec.
    async fn negotiate_codec(&self) -> Result<()> {
        let (features, codecs) =
            self.session.with_state(|s| (s.remote_features, s.remote_codecs.clone()));
        if AG_FEATURES & AG_FEAT_CODEC == 0 || features & HF_FEAT_CODEC == 0 {
            return Ok(());
        }
        let codec =
            if codecs.contains(&codec_id::MSBC) { codec_id::MSBC } else { codec_id::CVSD };
        self.respond("+BCS", &format!(" {codec}")).await
    }

    /// `AT+IPHONEACCEV=N,key,val,...` battery and dock state.
    fn handle_xapl_accessory_event(&self, value: &str) {
        let fields: Vec<&str> = value.split(',').map(|f| f.trim()).collect();
        let mut iter = fields.iter().skip(1);
        while let (Some(key), Some(val)) = (iter.next(), iter.next()) {
            if *key == "1" {
                if let Ok(level) = val.parse::<u8>() {
                    // Level is 0-9; scale to percent.
                    self.session.set_battery((level.min(9) + 1) * 10);
                }
            }
        }
    }

    async fn forward_or_error(&self, raw: &str) -> Result<()> {
        let dispatch = self.session.with_state(|s| s.dispatch.clone());
        match dispatch {
            Some(_) => {
                self.forward(raw).await?;
                self.result(AtResult::Ok).await
            }
            None => {
                log::debug!("{}: unhandled AT message: {raw}", self.session.path);
                self.result(AtResult::Error).await
            }
        }
    }

    /// Forward a verbatim line to the dispatch client, when attached.
    async fn forward(&self, raw: &str) -> Result<()> {
        let dispatch = self.session.with_state(|s| s.dispatch.clone());
        if let Some(dispatch) = dispatch {
            if let Err(err) = sock::write(dispatch.get_ref(), raw.as_bytes()) {
                log::debug!("{}: cannot forward to dispatch client: {err}", self.session.path);
            }
        }
        Ok(())
    }

    async fn respond(&self, command: &str, value: &str) -> Result<()> {
        self.send_at(AtMessage::Response { command: command.into(), value: value.into() }).await
    }

    async fn result(&self, result: AtResult) -> Result<()> {
        self.send_at(AtMessage::Result(result)).await
    }

    async fn send_at(&self, message: AtMessage) -> Result<()> {
        log::trace!("{}: >> {message:?}", self.session.path);
        self.write_raw(message.to_wire().as_bytes()).await
    }

    async fn write_raw(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let mut guard = self.afd.writable().await.map_err(Error::from)?;
            match guard.try_io(|f| sock::write(f.get_ref(), &data[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

async fn read_some(fd: Arc<AsyncFd<OwnedFd>>) -> Result<Vec<u8>> {
    read_opt(Some(fd)).await
}

/// See [crate::sco]: optional so disabled select branches construct
/// safely.
async fn read_opt(fd: Option<Arc<AsyncFd<OwnedFd>>>) -> Result<Vec<u8>> {
    let fd = fd.expect("read_opt polled without descriptor");
    let mut buf = vec![0u8; 1024];
    loop {
        let mut guard = fd.readable().await.map_err(Error::from)?;
        match guard.try_io(|f| sock::read(f.get_ref(), &mut buf)) {
            Ok(Ok(n)) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(err)) => return Err(err.into()),
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_masks_enable_codec_negotiation() {
        assert_ne!(AG_FEATURES & AG_FEAT_CODEC, 0);
        assert_ne!(HF_FEATURES & HF_FEAT_CODEC, 0);
    }

    #[test]
    fn hfp_codec_ids() {
        assert_eq!(HfpCodecId::from_u16(2), Some(HfpCodecId::Msbc));
        assert_eq!(HfpCodecId::from_u16(9), None);
        assert_eq!(HfpCodecId::Msbc as u16, crate::codec_id::MSBC);
    }

    #[test]
    fn indicator_table_is_well_formed() {
        assert_eq!(INDICATORS.len(), 7);
        assert!(INDICATORS.iter().any(|(name, _, _)| *name == "battchg"));
    }
}
