//! The D-Bus surface: `org.bluealsa` manager, PCM and RFCOMM objects.

use dbus::{
    arg::{prop_cast, PropMap, RefArg, Variant},
    channel::Sender,
    message::{MatchRule, SignalArgs},
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, SyncConnection},
    strings::{Interface, Member},
    Message, Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use dbus_tokio::connection;
use futures::{lock::Mutex, StreamExt};
use lazy_static::lazy_static;
use std::{os::unix::io::IntoRawFd, sync::Arc};
use tokio::{
    sync::mpsc,
    task::{spawn_blocking, JoinHandle},
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    audio::Volume,
    bluez,
    codec::{self, sbc::SbcCaps},
    engine::{Engine, GraphEvent, PcmProperty, RfcommProperty},
    method_call,
    pcm::Pcm,
    rfcomm::{RfcommCmd, RfcommSession},
    transport::{PcmTag, Transport},
    Error, ErrorKind, Result, SERVICE_NAME, SERVICE_PATH,
};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluealsa.Manager1";
pub(crate) const PCM_INTERFACE: &str = "org.bluealsa.PCM1";
pub(crate) const RFCOMM_INTERFACE: &str = "org.bluealsa.RFCOMM1";

lazy_static! {
    static ref MANAGER_IFACE: Interface<'static> = Interface::new(MANAGER_INTERFACE).unwrap();
}

/// Served RPC state shared across tasks.
pub struct Rpc {
    /// D-Bus connection.
    pub connection: Arc<SyncConnection>,
    /// Served object registry.
    pub crossroads: Mutex<Crossroads>,
    /// The engine this surface exposes.
    pub engine: Arc<Engine>,
    pcm_token: IfaceToken<Arc<Pcm>>,
    rfcomm_token: IfaceToken<Arc<RfcommSession>>,
    /// Token for BlueZ media endpoint objects.
    pub endpoint_token: IfaceToken<Arc<bluez::MediaEndpoint>>,
    /// Token for BlueZ profile handler objects.
    pub profile_token: IfaceToken<Arc<bluez::ProfileHandler>>,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Drop for Rpc {
    fn drop(&mut self) {
        self.dbus_task.abort();
    }
}

/// Connect to the system bus, claim the service name and serve the
/// manager object. The returned handle is shared with the BlueZ
/// registration layer.
pub async fn serve(
    engine: Arc<Engine>, events: mpsc::UnboundedReceiver<GraphEvent>,
) -> Result<Arc<Rpc>> {
    let (resource, conn) = spawn_blocking(connection::new_system_sync)
        .await
        .map_err(Error::from)?
        .map_err(Error::from)?;
    let dbus_task = tokio::spawn(resource);
    log::debug!("connected to D-Bus as {}", conn.unique_name());

    let service_name = match &engine.config.dbus_suffix {
        Some(suffix) => format!("{SERVICE_NAME}.{suffix}"),
        None => SERVICE_NAME.to_string(),
    };
    conn.request_name(service_name.clone(), false, false, true)
        .await
        .map_err(Error::from)?;
    log::info!("acquired service name {service_name}");

    let mut cr = Crossroads::new();
    cr.set_async_support(Some((
        conn.clone(),
        Box::new(|x| {
            tokio::spawn(x);
        }),
    )));

    let manager_token = register_manager(&mut cr);
    let pcm_token = register_pcm(&mut cr, conn.clone());
    let rfcomm_token = register_rfcomm(&mut cr);
    let endpoint_token = bluez::MediaEndpoint::register_interface(&mut cr);
    let profile_token = bluez::ProfileHandler::register_interface(&mut cr);

    cr.insert(Path::from(SERVICE_PATH), &[manager_token], engine.clone());

    let rpc = Arc::new(Rpc {
        connection: conn.clone(),
        crossroads: Mutex::new(cr),
        engine,
        pcm_token,
        rfcomm_token,
        endpoint_token,
        profile_token,
        dbus_task,
    });

    // Inbound method calls are dispatched through crossroads.
    let mc_rpc = Arc::downgrade(&rpc);
    let mc_callback = conn.add_match(MatchRule::new_method_call()).await.map_err(Error::from)?;
    tokio::spawn(async move {
        let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
        while let Some(msg) = mc_stream.next().await {
            let Some(rpc) = mc_rpc.upgrade() else { return };
            let mut cr = rpc.crossroads.lock().await;
            let _ = cr.handle_message(msg, &*rpc.connection);
        }
    });

    // Graph events become objects and signals, in order.
    tokio::spawn(signal_pump(rpc.clone(), events));

    Ok(rpc)
}

/// Drain graph events: maintain the served objects and emit the
/// corresponding signals.
///
/// A single ordered consumer makes the documented guarantees hold on the
/// bus: `PCMAdded` precedes any property change of that PCM, and
/// `PCMRemoved` is the last signal for a path.
async fn signal_pump(rpc: Arc<Rpc>, events: mpsc::UnboundedReceiver<GraphEvent>) {
    let mut events = UnboundedReceiverStream::new(events);
    while let Some(event) = events.next().await {
        match event {
            GraphEvent::PcmAdded(pcm) => {
                let path = Path::from(pcm.path.clone());
                let props = pcm_props(&pcm);
                {
                    let mut cr = rpc.crossroads.lock().await;
                    cr.insert(path.clone(), &[rpc.pcm_token], pcm.clone());
                }
                rpc.emit_manager_signal("PCMAdded", |msg| msg.append2(path, props));
            }
            GraphEvent::PcmRemoved(path) => {
                let path = Path::from(path);
                rpc.emit_manager_signal("PCMRemoved", |msg| msg.append1(path.clone()));
                let mut cr = rpc.crossroads.lock().await;
                let _: Option<Arc<Pcm>> = cr.remove(&path);
            }
            GraphEvent::PcmChanged { path, properties } => {
                let mut changed = PropMap::new();
                for prop in properties {
                    let value: Box<dyn RefArg> = match prop {
                        PcmProperty::Codec(v) => Box::new(v),
                        PcmProperty::Volume(v) => Box::new(v),
                        PcmProperty::SoftVolume(v) => Box::new(v),
                        PcmProperty::Delay(v) => Box::new(v),
                        PcmProperty::Format(v) => Box::new(v),
                        PcmProperty::Channels(v) => Box::new(v),
                        PcmProperty::Sampling(v) => Box::new(v),
                    };
                    changed.insert(prop.name().to_string(), Variant(value));
                }
                rpc.emit_properties_changed(&path, PCM_INTERFACE, changed);
            }
            GraphEvent::RfcommAdded(session) => {
                let path = Path::from(session.path.clone());
                let mut cr = rpc.crossroads.lock().await;
                cr.insert(path, &[rpc.rfcomm_token], session.clone());
            }
            GraphEvent::RfcommRemoved(path) => {
                let mut cr = rpc.crossroads.lock().await;
                let _: Option<Arc<RfcommSession>> = cr.remove(&Path::from(path));
            }
            GraphEvent::RfcommChanged { path, properties } => {
                let mut changed = PropMap::new();
                for prop in properties {
                    match prop {
                        RfcommProperty::Features(v) => {
                            changed.insert("Features".to_string(), Variant(Box::new(v)));
                        }
                        RfcommProperty::Battery(v) => {
                            changed.insert("Battery".to_string(), Variant(Box::new(v)));
                        }
                    }
                }
                rpc.emit_properties_changed(&path, RFCOMM_INTERFACE, changed);
            }
        }
    }
}

impl Rpc {
    fn emit_manager_signal(&self, name: &str, append: impl FnOnce(Message) -> Message) {
        let msg = Message::signal(
            &Path::from(SERVICE_PATH),
            &MANAGER_IFACE,
            &Member::new(name).unwrap(),
        );
        let msg = append(msg);
        if self.connection.send(msg).is_err() {
            log::warn!("cannot emit {name} signal");
        }
    }

    fn emit_properties_changed(&self, path: &str, interface: &str, changed: PropMap) {
        let ppc = PropertiesPropertiesChanged {
            interface_name: interface.to_string(),
            changed_properties: changed,
            invalidated_properties: Vec::new(),
        };
        let msg = ppc.to_emit_message(&Path::from(path.to_string()));
        if self.connection.send(msg).is_err() {
            log::warn!("cannot emit PropertiesChanged for {path}");
        }
    }
}

/// Full property dictionary of a PCM, as carried by `PCMAdded` and
/// `GetPCMs`.
pub(crate) fn pcm_props(pcm: &Arc<Pcm>) -> PropMap {
    let mut props = PropMap::new();
    let (transport_name, device_path, codec) = match pcm.transport.upgrade() {
        Some(t) => {
            let device_path = t
                .device
                .upgrade()
                .map(|d| d.path())
                .unwrap_or_else(|| SERVICE_PATH.to_string());
            (t.profile.transport_property().to_string(), device_path, t.codec())
        }
        None => ("".to_string(), SERVICE_PATH.to_string(), 0),
    };

    props.insert("Device".into(), Variant(Box::new(Path::from(device_path))));
    props.insert("Sequence".into(), Variant(Box::new(pcm.sequence)));
    props.insert("Transport".into(), Variant(Box::new(transport_name)));
    props.insert("Mode".into(), Variant(Box::new(pcm.mode.as_str().to_string())));
    pcm.with_state(|s| {
        props.insert("Format".into(), Variant(Box::new(s.format)));
        props.insert("Channels".into(), Variant(Box::new(s.channels)));
        props.insert("Sampling".into(), Variant(Box::new(s.sampling)));
        props.insert("Codec".into(), Variant(Box::new(codec)));
        props.insert("Delay".into(), Variant(Box::new(s.delay)));
        props.insert("SoftVolume".into(), Variant(Box::new(s.soft_volume)));
        props.insert("Volume".into(), Variant(Box::new(s.volume.0)));
    });
    props
}

fn register_manager(cr: &mut Crossroads) -> IfaceToken<Arc<Engine>> {
    cr.register(MANAGER_INTERFACE, |ib: &mut IfaceBuilder<Arc<Engine>>| {
        ib.method_with_cr_async("GetPCMs", (), ("pcms",), |ctx, cr, _: ()| {
            method_call(ctx, cr, |engine: Arc<Engine>| async move {
                let pcms: Vec<(Path<'static>, PropMap)> = engine
                    .pcms()
                    .iter()
                    .map(|pcm| (Path::from(pcm.path.clone()), pcm_props(pcm)))
                    .collect();
                Ok((pcms,))
            })
        });

        ib.signal::<(Path<'static>, PropMap), _>("PCMAdded", ("path", "props"));
        ib.signal::<(Path<'static>,), _>("PCMRemoved", ("path",));

        ib.property("Version")
            .get(|_, _: &mut Arc<Engine>| Ok(env!("CARGO_PKG_VERSION").to_string()));
        ib.property("Adapters").get(|_, engine: &mut Arc<Engine>| Ok(engine.adapter_names()));
    })
}

fn register_pcm(cr: &mut Crossroads, conn: Arc<SyncConnection>) -> IfaceToken<Arc<Pcm>> {
    cr.register(PCM_INTERFACE, |ib: &mut IfaceBuilder<Arc<Pcm>>| {
        let open_conn = conn.clone();
        ib.method_with_cr_async("Open", (), ("pcm", "ctrl"), move |ctx, cr, _: ()| {
            let conn = open_conn.clone();
            method_call(ctx, cr, move |pcm: Arc<Pcm>| async move {
                let transport =
                    pcm.transport.upgrade().ok_or_else(|| MethodErr::failed("transport is gone"))?;
                connect_transport(&conn, &transport).await?;

                let (pipe, ctrl) = pcm.open().map_err(dbus::MethodErr::from)?;
                // Ownership of the raw descriptors passes to the reply.
                #[allow(unused_unsafe)]
                let fds = unsafe {
                    (
                        dbus::arg::OwnedFd::new(pipe.into_raw_fd()),
                        dbus::arg::OwnedFd::new(ctrl.into_raw_fd()),
                    )
                };
                Ok(fds)
            })
        });

        ib.method_with_cr_async("GetCodecs", (), ("codecs",), |ctx, cr, _: ()| {
            method_call(ctx, cr, |pcm: Arc<Pcm>| async move {
                let transport =
                    pcm.transport.upgrade().ok_or_else(|| MethodErr::failed("transport is gone"))?;
                Ok((list_codecs(&transport),))
            })
        });

        ib.method_with_cr_async(
            "SelectCodec",
            ("codec", "props"),
            (),
            |ctx, cr, (name, props): (String, PropMap)| {
                method_call(ctx, cr, move |pcm: Arc<Pcm>| async move {
                    let transport = pcm
                        .transport
                        .upgrade()
                        .ok_or_else(|| MethodErr::failed("transport is gone"))?;
                    select_codec(&transport, &name, &props).map_err(dbus::MethodErr::from)?;
                    Ok(())
                })
            },
        );

        ib.property("Device").get(|_, pcm: &mut Arc<Pcm>| {
            let path = pcm
                .transport
                .upgrade()
                .and_then(|t| t.device.upgrade())
                .map(|d| d.path())
                .unwrap_or_else(|| SERVICE_PATH.to_string());
            Ok(Path::from(path))
        });
        ib.property("Sequence").get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.sequence));
        ib.property("Transport").get(|_, pcm: &mut Arc<Pcm>| {
            Ok(pcm
                .transport
                .upgrade()
                .map(|t| t.profile.transport_property().to_string())
                .unwrap_or_default())
        });
        ib.property("Mode").get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.mode.as_str().to_string()));
        ib.property("Format").get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.with_state(|s| s.format)));
        ib.property("Channels").get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.with_state(|s| s.channels)));
        ib.property("Sampling").get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.with_state(|s| s.sampling)));
        ib.property("Codec").get(|_, pcm: &mut Arc<Pcm>| {
            Ok(pcm.transport.upgrade().map(|t| t.codec()).unwrap_or_default())
        });
        ib.property("Delay").get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.with_state(|s| s.delay)));
        ib.property("SoftVolume")
            .get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.with_state(|s| s.soft_volume)))
            .set(|_, pcm, value| {
                // The property-changed signal is emitted by the graph
                // event pump, and only on actual changes.
                pcm.set_soft_volume(value);
                Ok(None)
            });
        ib.property("Volume")
            .get(|_, pcm: &mut Arc<Pcm>| Ok(pcm.with_state(|s| s.volume.0)))
            .set(|_, pcm, value| {
                let volume = Volume(value);
                if pcm.set_volume(volume) {
                    propagate_sco_gain(pcm, volume);
                }
                Ok(None)
            });
    })
}

fn register_rfcomm(cr: &mut Crossroads) -> IfaceToken<Arc<RfcommSession>> {
    cr.register(RFCOMM_INTERFACE, |ib: &mut IfaceBuilder<Arc<RfcommSession>>| {
        ib.method_with_cr_async("Open", (), ("fd",), |ctx, cr, _: ()| {
            method_call(ctx, cr, |session: Arc<RfcommSession>| async move {
                let fd = session.open_dispatch().map_err(dbus::MethodErr::from)?;
                #[allow(unused_unsafe)]
                let fd = unsafe { dbus::arg::OwnedFd::new(fd.into_raw_fd()) };
                Ok((fd,))
            })
        });

        ib.property("Transport").get(|_, session: &mut Arc<RfcommSession>| {
            Ok(session.profile.transport_property().to_string())
        });
        ib.property("Features").get(|_, session: &mut Arc<RfcommSession>| Ok(session.features()));
        ib.property("Battery").get(|_, session: &mut Arc<RfcommSession>| {
            session.battery().ok_or_else(|| MethodErr::no_property("Battery"))
        });
    })
}

/// Volume written on an SCO PCM also travels to the peer as a
/// `+VGS`/`+VGM` gain on the 0-15 scale.
fn propagate_sco_gain(pcm: &Arc<Pcm>, volume: Volume) {
    let Some(transport) = pcm.transport.upgrade() else { return };
    if !transport.profile.is_sco() {
        return;
    }
    let Some(device) = transport.device.upgrade() else { return };
    let Some(session) = device.rfcomm() else { return };

    let gain = volume.levels()[0].min(Volume::SCO_MAX);
    let cmd = match pcm.tag {
        PcmTag::Mic => RfcommCmd::MicGain(gain),
        _ => RfcommCmd::SpeakerGain(gain),
    };
    session.send(cmd);
}

/// Make sure a transport has its Bluetooth socket before a PCM opens.
///
/// A2DP sockets are acquired from BlueZ; SCO links are dialled by the
/// transport I/O task (gateway) or installed by the dispatcher, so there
/// is nothing to do here for them.
async fn connect_transport(
    conn: &Arc<SyncConnection>, transport: &Arc<Transport>,
) -> std::result::Result<(), MethodErr> {
    if transport.is_connected() || !transport.profile.is_a2dp() {
        return Ok(());
    }
    let media_transport = transport.with_state(|s| s.media_transport.clone()).ok_or_else(|| {
        dbus::MethodErr::from(Error::with_message(ErrorKind::NotConnected, "transport is not configured"))
    })?;
    let (fd, read_mtu, write_mtu) =
        bluez::acquire_transport(conn, &media_transport).await.map_err(dbus::MethodErr::from)?;
    transport
        .install_bt(fd, read_mtu, write_mtu)
        .map_err(dbus::MethodErr::from)?;
    Ok(())
}

/// Codec listing for `GetCodecs`.
fn list_codecs(transport: &Arc<Transport>) -> Vec<(String, PropMap)> {
    if transport.profile.is_a2dp() {
        codec::A2DP_CODECS
            .iter()
            .map(|info| {
                let mut props = PropMap::new();
                if info.has_stream {
                    props.insert(
                        "Capabilities".into(),
                        Variant(Box::new(SbcCaps::LOCAL.to_bytes().to_vec()) as Box<dyn RefArg>),
                    );
                }
                (info.name.to_string(), props)
            })
            .collect()
    } else {
        vec![("CVSD".to_string(), PropMap::new()), ("mSBC".to_string(), PropMap::new())]
    }
}

/// `SelectCodec` implementation shared by A2DP and SCO transports.
///
/// A running stream is closed first; clients re-open with the new
/// parameters.
fn select_codec(transport: &Arc<Transport>, name: &str, props: &PropMap) -> Result<()> {
    if transport.profile.is_a2dp() {
        let info = codec::a2dp_codec_by_name(name).ok_or_else(|| {
            Error::with_message(ErrorKind::InvalidArguments, format!("unknown codec: {name}"))
        })?;
        if !info.has_stream {
            return Err(Error::with_message(ErrorKind::NotSupported, format!("codec {name} is not built in")));
        }

        let configuration = match prop_cast::<Vec<u8>>(props, "Configuration") {
            Some(blob) => {
                // Validate before committing.
                crate::codec::sbc::SbcConfig::from_a2dp_element(blob)?;
                blob.clone()
            }
            None => {
                let bitpool = transport
                    .device
                    .upgrade()
                    .map(|d| d.config.sbc_bitpool())
                    .unwrap_or(53);
                SbcCaps::LOCAL.select(bitpool)?.to_a2dp_element().to_vec()
            }
        };

        for pcm in transport.pcms() {
            if pcm.is_open() {
                pcm.close();
            }
        }
        transport.set_codec(info.id, configuration);
    } else {
        let codec = match name {
            name if name.eq_ignore_ascii_case("CVSD") => crate::codec_id::CVSD,
            name if name.eq_ignore_ascii_case("mSBC") => crate::codec_id::MSBC,
            _ => {
                return Err(Error::with_message(
                    ErrorKind::InvalidArguments,
                    format!("unknown codec: {name}"),
                ))
            }
        };
        for pcm in transport.pcms() {
            if pcm.is_open() {
                pcm.close();
            }
        }
        transport.set_codec(codec, Vec::new());
    }
    Ok(())
}
