//! Engine-level tests: object graph, transport I/O over loopback
//! descriptors and the documented signal ordering. No Bluetooth
//! hardware and no message bus are required.

use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc::UnboundedReceiver, time::sleep};

use bluealsad::{
    audio::Volume,
    codec::sbc::SbcCaps,
    config::Config,
    device::Device,
    engine::{Engine, GraphEvent, PcmProperty},
    hci::AdapterInfo,
    pcm::Pcm,
    rtp::RtpHeader,
    sock::{self, OwnedFd},
    transport::{PcmTag, Transport},
    Address, Profile,
};

fn test_engine() -> (Arc<Engine>, UnboundedReceiver<GraphEvent>) {
    let config = Arc::new(Config::default());
    Engine::new(config)
}

fn adapter_info() -> AdapterInfo {
    AdapterInfo { id: 0, name: "hci0".to_string(), address: Address::any(), sco_mtu: 48 }
}

fn remote() -> Address {
    "12:34:56:78:9A:BC".parse().unwrap()
}

fn test_device(engine: &Arc<Engine>) -> Arc<Device> {
    let adapter = engine.add_adapter(adapter_info());
    adapter.device(remote())
}

/// Fake Bluetooth link: a sequenced-packet pair standing in for the
/// SCO/L2CAP socket. Returns the peer end.
fn fake_bt(transport: &Arc<Transport>, mtu: usize) -> OwnedFd {
    let (ours, peer) = sock::seqpacket_pair().unwrap();
    transport.install_bt(ours, mtu, mtu).unwrap();
    peer
}

async fn read_packet(fd: &OwnedFd) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    for _ in 0..500 {
        match sock::read(fd, &mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return buf;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("packet read failed: {err}"),
        }
    }
    panic!("timed out waiting for a packet");
}

async fn read_exact(fd: &OwnedFd, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        out.extend(read_packet(fd).await);
    }
    out
}

fn sbc_configuration() -> Vec<u8> {
    SbcCaps::LOCAL.select(53).unwrap().to_a2dp_element().to_vec()
}

fn a2dp_source(engine: &Arc<Engine>, device: &Arc<Device>) -> Arc<Transport> {
    let transport = Transport::new_a2dp(
        device,
        Profile::A2dpSource,
        0x0000,
        sbc_configuration(),
        None,
        &engine.config,
        engine.events(),
    )
    .unwrap();
    device.insert_transport(transport.clone());
    transport
}

fn sco_transport(engine: &Arc<Engine>, device: &Arc<Device>, profile: Profile) -> Arc<Transport> {
    let transport = Transport::new_sco(device, profile, &engine.config, engine.events());
    device.insert_transport(transport.clone());
    transport
}

/// Drain all pending graph events without waiting.
fn drain_events(rx: &mut UnboundedReceiver<GraphEvent>) -> Vec<GraphEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn fresh_engine_serves_adapter_and_no_pcms() {
    let (engine, _events) = test_engine();
    engine.add_adapter(adapter_info());

    assert_eq!(engine.adapter_names(), vec!["hci0".to_string()]);
    assert!(engine.pcms().is_empty());
}

#[tokio::test]
async fn sco_transport_publishes_unique_pcms() {
    let (engine, mut events) = test_engine();
    let device = test_device(&engine);
    let transport = sco_transport(&engine, &device, Profile::HfpAg);

    assert_eq!(transport.codec(), 0x0001);

    let pcms = engine.pcms();
    assert_eq!(pcms.len(), 2);
    let mut paths: Vec<_> = pcms.iter().map(|p| p.path.clone()).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/org/bluealsa/hci0/dev_12_34_56_78_9A_BC/hfphf/sink".to_string(),
            "/org/bluealsa/hci0/dev_12_34_56_78_9A_BC/hfphf/source".to_string(),
        ]
    );

    // No two PCMs share a (device, transport, mode) triple.
    let mut triples: Vec<_> = pcms
        .iter()
        .map(|p| {
            let t = p.transport.upgrade().unwrap();
            (t.device.upgrade().unwrap().path(), t.profile, p.mode.as_str())
        })
        .collect();
    let before = triples.len();
    triples.sort();
    triples.dedup();
    assert_eq!(triples.len(), before);

    let added: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, GraphEvent::PcmAdded(_)))
        .collect();
    assert_eq!(added.len(), 2);
}

#[tokio::test]
async fn a2dp_transport_publishes_expected_properties() {
    let (engine, mut events) = test_engine();
    let device = test_device(&engine);
    let transport = a2dp_source(&engine, &device);

    let pcm = transport.pcm(PcmTag::Main).unwrap();
    assert_eq!(pcm.path, "/org/bluealsa/hci0/dev_12_34_56_78_9A_BC/a2dpsnk/sink");
    assert_eq!(transport.codec(), 0x0000);
    pcm.with_state(|s| {
        assert_eq!(s.format, 0x8210);
        assert_eq!(s.channels, 2);
        assert_eq!(s.sampling, 44100);
    });

    let events = drain_events(&mut events);
    assert!(matches!(&events[0], GraphEvent::PcmAdded(p) if p.path == pcm.path));
}

#[tokio::test]
async fn volume_change_is_idempotent() {
    let (engine, mut events) = test_engine();
    let device = test_device(&engine);
    let transport = a2dp_source(&engine, &device);
    let pcm = transport.pcm(PcmTag::Main).unwrap();
    drain_events(&mut events);

    let volume = Volume::pack([100, 100], [false, false]);
    assert!(pcm.set_volume(volume));
    assert!(!pcm.set_volume(volume));

    let changes: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(e, GraphEvent::PcmChanged { properties, .. }
                if properties.iter().any(|p| matches!(p, PcmProperty::Volume(_))))
        })
        .collect();
    assert_eq!(changes.len(), 1, "same value twice must emit exactly one change");
}

#[tokio::test]
async fn signal_ordering_add_change_remove() {
    let (engine, mut events) = test_engine();
    let device = test_device(&engine);
    let transport = a2dp_source(&engine, &device);
    let pcm = transport.pcm(PcmTag::Main).unwrap();
    let path = pcm.path.clone();

    pcm.set_volume(Volume::pack([64, 64], [false, false]));
    device.remove_transport(Profile::A2dpSource);

    let mut order = Vec::new();
    for event in drain_events(&mut events) {
        match event {
            GraphEvent::PcmAdded(p) if p.path == path => order.push("added"),
            GraphEvent::PcmChanged { path: p, .. } if p == path => order.push("changed"),
            GraphEvent::PcmRemoved(p) if p == path => order.push("removed"),
            _ => {}
        }
    }
    assert_eq!(order, vec!["added", "changed", "removed"]);
}

/// One second of silence goes in, RTP-framed SBC comes out, and `Drain`
/// answers `OK` once the residue is flushed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a2dp_source_streams_and_drains() {
    let (engine, _events) = test_engine();
    let device = test_device(&engine);
    let transport = a2dp_source(&engine, &device);
    let peer = fake_bt(&transport, 672);

    let pcm = transport.pcm(PcmTag::Main).unwrap().clone();
    let (pipe, ctrl) = pcm.open().unwrap();

    let silence = vec![0u8; 44100 * 2 * 2];
    let writer = tokio::task::spawn_blocking(move || {
        let mut written = 0;
        while written < silence.len() {
            match sock::write(&pipe, &silence[written..]) {
                Ok(n) => written += n,
                Err(err) => panic!("PCM write failed: {err}"),
            }
        }
        // Closing the pipe is not part of the drain contract; keep it
        // open until the drain completes.
        pipe
    });

    // The stream is paced, so packets trickle out at wall-clock rate.
    let first = read_packet(&peer).await;
    let (header, payload) = RtpHeader::parse(&first).expect("source must emit RTP");
    assert_eq!(header.payload_type, 96);
    assert!(!payload.is_empty());
    // SBC payload header carries the frame count; each frame starts with
    // the sync word.
    let frames = payload[0] as usize;
    assert!(frames >= 1);
    assert_eq!(payload[1], 0x9c);

    let pipe = writer.await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(3), async {
        sock::set_nonblocking(&ctrl).unwrap();
        loop {
            match sock::write(&ctrl, b"Drain") {
                Ok(_) => break,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    sleep(Duration::from_millis(5)).await
                }
                Err(err) => panic!("control write failed: {err}"),
            }
        }
        // Consume stream packets while waiting so the fake link never
        // backs up.
        let mut reply = vec![0u8; 64];
        loop {
            match sock::read(&ctrl, &mut reply) {
                Ok(n) => {
                    reply.truncate(n);
                    return reply;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("control read failed: {err}"),
            }
            let mut scratch = vec![0u8; 4096];
            let _ = sock::read(&peer, &mut scratch);
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("drain must complete within three seconds");
    assert_eq!(reply, b"OK");
    drop(pipe);
}

/// CVSD is a bit-exact passthrough in both directions.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cvsd_loopback_is_bit_identical() {
    let (engine, _events) = test_engine();
    let device = test_device(&engine);
    let transport = sco_transport(&engine, &device, Profile::HfpAg);
    let peer = fake_bt(&transport, 48);

    let spk = transport.pcm(PcmTag::Spk).unwrap().clone();
    let mic = transport.pcm(PcmTag::Mic).unwrap().clone();
    let (spk_pipe, _spk_ctrl) = spk.open().unwrap();
    let (mic_pipe, _mic_ctrl) = mic.open().unwrap();

    // Client to peer, with a payload that cannot alias silence.
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5c0);
    let pattern: Vec<u8> = (0..96).map(|_| rng.gen()).collect();
    let mut written = 0;
    while written < pattern.len() {
        written += sock::write(&spk_pipe, &pattern[written..]).unwrap();
    }
    let outgoing = read_exact(&peer, 96).await;
    assert_eq!(outgoing, pattern);

    // Peer to client.
    let incoming: Vec<u8> = (0..48u8).rev().collect();
    sock::write(&peer, &incoming).unwrap();
    sock::set_nonblocking(&mic_pipe).unwrap();
    let echoed = read_exact(&mic_pipe, 48).await;
    assert_eq!(echoed, incoming);
}

/// Closing both PCMs on a gateway releases the link after the linger
/// window, unless a client re-opens in time.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sco_gateway_lingers_before_release() {
    let (engine, _events) = test_engine();
    let device = test_device(&engine);
    let transport = sco_transport(&engine, &device, Profile::HfpAg);
    let _peer = fake_bt(&transport, 48);

    let spk = transport.pcm(PcmTag::Spk).unwrap().clone();
    let fds = spk.open().unwrap();
    sleep(Duration::from_millis(50)).await;
    drop(fds);
    spk.close();

    // Within the linger window the link stays up.
    sleep(Duration::from_millis(500)).await;
    assert!(transport.is_connected(), "link must linger after close");

    // A re-open within the window keeps it alive.
    let fds = spk.open().unwrap();
    sleep(Duration::from_millis(800)).await;
    assert!(transport.is_connected(), "open during linger must keep the link");
    drop(fds);
    spk.close();

    // Without a new open the link is released after the window.
    sleep(Duration::from_millis(1600)).await;
    assert!(!transport.is_connected(), "link must be released after linger");
}

/// Codec renegotiation on a live SCO link tears the link down so the
/// next open uses the new settings.
#[tokio::test]
async fn codec_switch_releases_sco_link() {
    let (engine, mut events) = test_engine();
    let device = test_device(&engine);
    let transport = sco_transport(&engine, &device, Profile::HfpAg);
    let _peer = fake_bt(&transport, 48);
    drain_events(&mut events);

    assert!(transport.is_connected());
    transport.set_codec(0x0002, Vec::new());

    assert!(!transport.is_connected(), "codec switch must drop the live link");
    assert_eq!(transport.codec(), 0x0002);
    transport.pcm(PcmTag::Spk).unwrap().with_state(|s| {
        assert_eq!(s.sampling, 16000);
    });

    let changed = drain_events(&mut events).into_iter().any(|e| {
        matches!(e, GraphEvent::PcmChanged { properties, .. }
            if properties.contains(&PcmProperty::Codec(0x0002)))
    });
    assert!(changed, "codec change must be signalled");
}

/// A second open on the same PCM is refused while the first client is
/// attached.
#[tokio::test]
async fn pcm_accepts_exactly_one_client() {
    let (engine, _events) = test_engine();
    let device = test_device(&engine);
    let transport = a2dp_source(&engine, &device);
    let _peer = fake_bt(&transport, 672);

    let pcm: Arc<Pcm> = transport.pcm(PcmTag::Main).unwrap().clone();
    let fds = pcm.open().unwrap();
    assert!(pcm.open().is_err());
    drop(fds);
    pcm.close();
    assert!(pcm.open().is_ok());
}

/// Drive the gateway-side service-level connection over an in-process
/// channel standing in for RFCOMM: feature exchange, codec list,
/// indicators, reporting, wideband codec selection, gains and battery.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hfp_slc_handshake_and_codec_switch() {
    use bluealsad::rfcomm::{RfcommSession, AG_FEATURES};

    let (engine, _events) = test_engine();
    let device = test_device(&engine);
    let transport = sco_transport(&engine, &device, Profile::HfpAg);

    let (ours, hf) = sock::seqpacket_pair().unwrap();
    let session = RfcommSession::spawn(&device, Profile::HfpAg, ours, engine.events()).unwrap();
    device.set_rfcomm(session.clone());

    async fn exchange(hf: &OwnedFd, command: &str, expect: &[&str]) -> String {
        sock::write(hf, command.as_bytes()).unwrap();
        let mut collected = String::new();
        for _ in 0..500 {
            let chunk = {
                let mut buf = vec![0u8; 1024];
                match sock::read(hf, &mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        String::from_utf8_lossy(&buf).into_owned()
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => String::new(),
                    Err(err) => panic!("RFCOMM read failed: {err}"),
                }
            };
            collected.push_str(&chunk);
            if expect.iter().all(|e| collected.contains(e)) {
                return collected;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {expect:?}, got {collected:?}");
    }

    let brsf = format!("+BRSF: {AG_FEATURES}");
    exchange(&hf, "AT+BRSF=703\r", &[&brsf, "OK"]).await;
    assert_eq!(session.features(), 703);

    exchange(&hf, "AT+BAC=1,2\r", &["OK"]).await;
    exchange(&hf, "AT+CIND=?\r", &["+CIND:", "(\"battchg\",(0-5))", "OK"]).await;
    exchange(&hf, "AT+CIND?\r", &["+CIND: 0,0,0,0,0,0,5", "OK"]).await;
    // Reporting completes the connection; with mSBC in the codec list
    // the gateway immediately proposes it.
    exchange(&hf, "AT+CMER=3,0,0,1\r", &["OK", "+BCS: 2"]).await;
    exchange(&hf, "AT+BCS=2\r", &["OK"]).await;
    assert_eq!(transport.codec(), 0x0002);

    exchange(&hf, "AT+VGS=7\r", &["OK"]).await;
    let spk = transport.pcm(PcmTag::Spk).unwrap();
    assert_eq!(spk.with_state(|s| s.volume.levels()), [7, 7]);

    exchange(&hf, "AT+XAPL=ABCD-1234-0100,10\r", &["+XAPL=iPhone,6", "OK"]).await;
    exchange(&hf, "AT+IPHONEACCEV=2,1,5,2,0\r", &["OK"]).await;
    assert_eq!(session.battery(), Some(60));
}

/// Unknown control commands get an error reply; `Pause` and `Resume`
/// are acknowledged.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn control_socket_protocol() {
    let (engine, _events) = test_engine();
    let device = test_device(&engine);
    let transport = a2dp_source(&engine, &device);
    let _peer = fake_bt(&transport, 672);

    let pcm = transport.pcm(PcmTag::Main).unwrap().clone();
    let (_pipe, ctrl) = pcm.open().unwrap();
    sock::set_nonblocking(&ctrl).unwrap();

    let request = |cmd: &'static [u8]| {
        let ctrl = &ctrl;
        async move {
            sock::write(ctrl, cmd).unwrap();
            read_packet(ctrl).await
        }
    };

    assert_eq!(request(b"Pause").await, b"OK");
    assert_eq!(request(b"Resume").await, b"OK");
    let reply = request(b"Rewind").await;
    assert!(reply.starts_with(b"ERR:"), "unknown command must be rejected: {reply:?}");
}
