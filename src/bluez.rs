//! Registration with the system Bluetooth daemon.
//!
//! The daemon registers one `org.bluez.MediaEndpoint1` object per
//! enabled A2DP direction and one `org.bluez.Profile1` object per
//! enabled HFP/HSP role. BlueZ calls back into these objects when a
//! remote device configures a stream or opens an RFCOMM channel; the
//! callbacks create the corresponding transports in the object graph.

use dbus::{
    arg::{prop_cast, PropMap, RefArg, Variant},
    nonblock::{Proxy, SyncConnection},
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken, MethodErr};
use std::{os::unix::io::IntoRawFd, sync::Arc, time::Duration};

use crate::{
    codec::sbc::SbcCaps,
    engine::Engine,
    method_call,
    rfcomm::RfcommSession,
    rpc::Rpc,
    sock::{self, OwnedFd},
    transport::Transport,
    Address, Error, ErrorKind, Profile, Result,
};

const BLUEZ_SERVICE: &str = "org.bluez";
const BLUEZ_PATH: &str = "/org/bluez";
const MEDIA_INTERFACE: &str = "org.bluez.Media1";
const MEDIA_ENDPOINT_INTERFACE: &str = "org.bluez.MediaEndpoint1";
const MEDIA_TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
const PROFILE_MANAGER_INTERFACE: &str = "org.bluez.ProfileManager1";
const PROFILE_INTERFACE: &str = "org.bluez.Profile1";

const TIMEOUT: Duration = Duration::from_secs(30);

/// Parse a BlueZ device object path,
/// `/org/bluez/hci0/dev_XX_XX_XX_XX_XX_XX[...]`.
pub(crate) fn parse_device_path(path: &str) -> Option<(String, Address)> {
    let rest = path.strip_prefix("/org/bluez/")?;
    let mut parts = rest.split('/');
    let adapter = parts.next()?;
    let device = parts.next()?;
    let address = Address::from_path_fragment(device)?;
    Some((adapter.to_string(), address))
}

/// A served `org.bluez.MediaEndpoint1` object for one A2DP direction.
pub struct MediaEndpoint {
    engine: Arc<Engine>,
    /// Local profile role implemented by this endpoint.
    pub profile: Profile,
}

impl MediaEndpoint {
    /// Object path this endpoint is served on.
    pub fn path(profile: Profile) -> String {
        format!("{}/endpoint/{}/sbc", crate::SERVICE_PATH, profile.to_string().replace('-', ""))
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(MEDIA_ENDPOINT_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "SetConfiguration",
                ("transport", "properties"),
                (),
                |ctx, cr, (transport_path, props): (Path<'static>, PropMap)| {
                    method_call(ctx, cr, move |endpoint: Arc<Self>| async move {
                        endpoint.set_configuration(&transport_path, &props).map_err(MethodErr::from)
                    })
                },
            );

            ib.method_with_cr_async(
                "SelectConfiguration",
                ("capabilities",),
                ("configuration",),
                |ctx, cr, (caps,): (Vec<u8>,)| {
                    method_call(ctx, cr, move |endpoint: Arc<Self>| async move {
                        let config = endpoint.select_configuration(&caps).map_err(MethodErr::from)?;
                        Ok((config,))
                    })
                },
            );

            ib.method_with_cr_async(
                "ClearConfiguration",
                ("transport",),
                (),
                |ctx, cr, (transport_path,): (Path<'static>,)| {
                    method_call(ctx, cr, move |endpoint: Arc<Self>| async move {
                        endpoint.clear_configuration(&transport_path);
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async("Release", (), (), |ctx, cr, _: ()| {
                method_call(ctx, cr, move |endpoint: Arc<Self>| async move {
                    log::info!("endpoint {} released by BlueZ", Self::path(endpoint.profile));
                    Ok(())
                })
            });
        })
    }

    /// A remote endpoint configured a stream: create the transport and
    /// its PCM.
    fn set_configuration(&self, transport_path: &Path, props: &PropMap) -> Result<()> {
        let device_path = prop_cast::<Path<'static>>(props, "Device")
            .map(|p| p.to_string())
            .unwrap_or_else(|| transport_path.to_string());
        let (adapter_name, address) = parse_device_path(&device_path).ok_or_else(|| {
            Error::with_message(ErrorKind::InvalidArguments, format!("bad device path: {device_path}"))
        })?;
        let configuration = prop_cast::<Vec<u8>>(props, "Configuration")
            .cloned()
            .ok_or_else(|| Error::with_message(ErrorKind::InvalidArguments, "missing configuration"))?;

        let adapter = self
            .engine
            .adapter_by_name(&adapter_name)
            .ok_or_else(|| Error::with_message(ErrorKind::NotFound, format!("adapter {adapter_name} not served")))?;
        let device = adapter.device(address);

        let transport = Transport::new_a2dp(
            &device,
            self.profile,
            crate::codec_id::SBC,
            configuration,
            Some(transport_path.to_string()),
            &self.engine.config,
            self.engine.events(),
        )?;
        log::info!("{}: stream configured by {address}", transport.path);
        device.insert_transport(transport);
        Ok(())
    }

    /// Compute the best configuration from the peer's capabilities.
    fn select_configuration(&self, caps: &[u8]) -> Result<Vec<u8>> {
        let peer = SbcCaps::parse(caps)?;
        let config = SbcCaps::LOCAL.intersect(&peer).select(self.engine.config.sbc_bitpool())?;
        Ok(config.to_a2dp_element().to_vec())
    }

    fn clear_configuration(&self, transport_path: &Path) {
        if let Some((adapter_name, address)) = parse_device_path(&transport_path.to_string()) {
            if let Some(device) = self.engine.device(&adapter_name, address) {
                log::info!("{}: stream cleared for {address}", device.path());
                device.remove_transport(self.profile);
            }
        }
    }
}

/// A served `org.bluez.Profile1` object for one HFP/HSP role.
pub struct ProfileHandler {
    engine: Arc<Engine>,
    /// Local profile role implemented by this handler.
    pub profile: Profile,
}

impl ProfileHandler {
    /// Object path this handler is served on.
    pub fn path(profile: Profile) -> String {
        format!("{}/profile/{}", crate::SERVICE_PATH, profile.to_string().replace('-', ""))
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(PROFILE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            ib.method_with_cr_async(
                "NewConnection",
                ("device", "fd", "fd_properties"),
                (),
                |ctx, cr, (device_path, fd, _props): (Path<'static>, dbus::arg::OwnedFd, PropMap)| {
                    method_call(ctx, cr, move |handler: Arc<Self>| async move {
                        handler.new_connection(&device_path, fd).map_err(MethodErr::from)
                    })
                },
            );

            ib.method_with_cr_async(
                "RequestDisconnection",
                ("device",),
                (),
                |ctx, cr, (device_path,): (Path<'static>,)| {
                    method_call(ctx, cr, move |handler: Arc<Self>| async move {
                        handler.disconnect(&device_path);
                        Ok(())
                    })
                },
            );

            ib.method_with_cr_async("Release", (), (), |ctx, cr, _: ()| {
                method_call(ctx, cr, move |handler: Arc<Self>| async move {
                    log::info!("profile {} released by BlueZ", handler.profile);
                    Ok(())
                })
            });
        })
    }

    /// BlueZ accepted an RFCOMM connection for our role: start the AT
    /// worker and publish the SCO transport.
    fn new_connection(&self, device_path: &Path, fd: dbus::arg::OwnedFd) -> Result<()> {
        let (adapter_name, address) = parse_device_path(&device_path.to_string()).ok_or_else(|| {
            Error::with_message(ErrorKind::InvalidArguments, format!("bad device path: {device_path}"))
        })?;
        let adapter = self
            .engine
            .adapter_by_name(&adapter_name)
            .ok_or_else(|| Error::with_message(ErrorKind::NotFound, format!("adapter {adapter_name} not served")))?;
        let device = adapter.device(address);

        let fd = unsafe { OwnedFd::new(fd.into_raw_fd()) };
        sock::set_nonblocking(&fd)?;

        let session = RfcommSession::spawn(&device, self.profile, fd, self.engine.events())?;
        log::info!("{}: RFCOMM connection from {address}", session.path);
        device.set_rfcomm(session);

        if device.sco_transport().is_none() {
            let transport =
                Transport::new_sco(&device, self.profile, &self.engine.config, self.engine.events());
            device.insert_transport(transport);
        }
        Ok(())
    }

    fn disconnect(&self, device_path: &Path) {
        if let Some((adapter_name, address)) = parse_device_path(&device_path.to_string()) {
            if let Some(device) = self.engine.device(&adapter_name, address) {
                log::info!("{}: RFCOMM disconnection requested", device.path());
                device.remove_rfcomm();
                device.remove_transport(self.profile);
            }
        }
    }
}

/// Register the enabled endpoints and profiles with BlueZ.
///
/// Endpoints are registered on every served adapter's `Media1` manager;
/// profiles once with the profile manager.
pub async fn register(rpc: &Arc<Rpc>) -> Result<()> {
    let engine = &rpc.engine;

    for profile in engine.config.profiles.iter().copied() {
        if profile.is_a2dp() {
            let endpoint =
                Arc::new(MediaEndpoint { engine: engine.clone(), profile });
            let path = Path::from(MediaEndpoint::path(profile));
            {
                let mut cr = rpc.crossroads.lock().await;
                cr.insert(path.clone(), &[rpc.endpoint_token], endpoint);
            }

            for adapter in engine.adapters() {
                let mut props = PropMap::new();
                props.insert("UUID".into(), Variant(Box::new(profile.uuid().to_string()) as Box<dyn RefArg>));
                props.insert("Codec".into(), Variant(Box::new(0u8) as Box<dyn RefArg>));
                props.insert(
                    "Capabilities".into(),
                    Variant(Box::new(SbcCaps::LOCAL.to_bytes().to_vec()) as Box<dyn RefArg>),
                );

                let adapter_path = format!("{BLUEZ_PATH}/{}", adapter.info.name);
                let proxy = Proxy::new(BLUEZ_SERVICE, adapter_path, TIMEOUT, rpc.connection.clone());
                let result: std::result::Result<(), dbus::Error> = proxy
                    .method_call(MEDIA_INTERFACE, "RegisterEndpoint", (path.clone(), props))
                    .await;
                match result {
                    Ok(()) => {
                        log::info!("registered {profile} endpoint on {}", adapter.info.name)
                    }
                    Err(err) => {
                        log::warn!("cannot register {profile} on {}: {err}", adapter.info.name)
                    }
                }
            }
        } else {
            let handler = Arc::new(ProfileHandler { engine: engine.clone(), profile });
            let path = Path::from(ProfileHandler::path(profile));
            {
                let mut cr = rpc.crossroads.lock().await;
                cr.insert(path.clone(), &[rpc.profile_token], handler);
            }

            let mut props = PropMap::new();
            props.insert(
                "Name".into(),
                Variant(Box::new(format!("bluealsad-{profile}")) as Box<dyn RefArg>),
            );

            let proxy = Proxy::new(BLUEZ_SERVICE, BLUEZ_PATH, TIMEOUT, rpc.connection.clone());
            let result: std::result::Result<(), dbus::Error> = proxy
                .method_call(
                    PROFILE_MANAGER_INTERFACE,
                    "RegisterProfile",
                    (path.clone(), profile.uuid().to_string(), props),
                )
                .await;
            match result {
                Ok(()) => log::info!("registered {profile} profile handler"),
                Err(err) => log::warn!("cannot register {profile}: {err}"),
            }
        }
    }
    Ok(())
}

/// Acquire the Bluetooth socket of a configured A2DP transport from
/// BlueZ. Returns the descriptor in non-blocking mode plus the read and
/// write MTU.
pub async fn acquire_transport(
    conn: &Arc<SyncConnection>, transport_path: &str,
) -> Result<(OwnedFd, usize, usize)> {
    let proxy = Proxy::new(BLUEZ_SERVICE, transport_path.to_string(), TIMEOUT, conn.clone());
    let (fd, read_mtu, write_mtu): (dbus::arg::OwnedFd, u16, u16) = proxy
        .method_call(MEDIA_TRANSPORT_INTERFACE, "TryAcquire", ())
        .await
        .map_err(Error::from)?;

    let fd = unsafe { OwnedFd::new(fd.into_raw_fd()) };
    sock::set_nonblocking(&fd)?;
    Ok((fd, read_mtu as usize, write_mtu as usize))
}

/// Release an acquired A2DP transport back to BlueZ.
pub async fn release_transport(conn: &Arc<SyncConnection>, transport_path: &str) -> Result<()> {
    let proxy = Proxy::new(BLUEZ_SERVICE, transport_path.to_string(), TIMEOUT, conn.clone());
    let result: std::result::Result<(), dbus::Error> =
        proxy.method_call(MEDIA_TRANSPORT_INTERFACE, "Release", ()).await;
    result.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_parsing() {
        let (adapter, address) =
            parse_device_path("/org/bluez/hci0/dev_12_34_56_78_9A_BC").unwrap();
        assert_eq!(adapter, "hci0");
        assert_eq!(address.to_string(), "12:34:56:78:9A:BC");

        // Transport paths resolve through their device component.
        let (adapter, _) =
            parse_device_path("/org/bluez/hci1/dev_12_34_56_78_9A_BC/sep1/fd0").unwrap();
        assert_eq!(adapter, "hci1");

        assert!(parse_device_path("/org/bluez/hci0").is_none());
        assert!(parse_device_path("/org/freedesktop/dev_x").is_none());
    }

    #[test]
    fn endpoint_and_profile_paths() {
        assert_eq!(MediaEndpoint::path(Profile::A2dpSource), "/org/bluealsa/endpoint/a2dpsource/sbc");
        assert_eq!(ProfileHandler::path(Profile::HfpAg), "/org/bluealsa/profile/hfpag");
    }
}
