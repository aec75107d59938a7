//! Local Bluetooth adapters.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    device::Device,
    engine::GraphEvents,
    hci::{self, AdapterInfo},
    sco,
    sys::COMPANY_BROADCOM,
    Address,
};

/// A local Bluetooth controller served by the daemon.
pub struct Adapter {
    /// Static controller information.
    pub info: AdapterInfo,
    /// Controller vendor, when the probe succeeded.
    pub vendor: Option<u16>,
    pub(crate) config: Arc<Config>,
    pub(crate) events: GraphEvents,
    devices: Mutex<HashMap<Address, Arc<Device>>>,
    sco_dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Adapter {{ {} }}", self.info.name)
    }
}

impl Adapter {
    pub(crate) fn new(info: AdapterInfo, config: Arc<Config>, events: GraphEvents) -> Arc<Self> {
        let vendor = match hci::read_local_version(info.id) {
            Ok(version) => Some(version.manufacturer),
            Err(err) => {
                log::warn!("{}: cannot read local version: {err}", info.name);
                None
            }
        };

        // Broadcom controllers route SCO to the PCM pins by default;
        // without the rewrite no audio ever reaches userspace.
        if vendor == Some(COMPANY_BROADCOM) {
            if let Err(err) = hci::bcm_route_sco_to_transport(info.id) {
                log::warn!("{}: cannot fix SCO routing: {err}", info.name);
            }
        }

        Arc::new(Self {
            info,
            vendor,
            config,
            events,
            devices: Mutex::new(HashMap::new()),
            sco_dispatcher: Mutex::new(None),
        })
    }

    /// Get or create the device entry for a remote address.
    pub fn device(self: &Arc<Self>, address: Address) -> Arc<Device> {
        let mut devices = self.devices.lock().unwrap();
        devices
            .entry(address)
            .or_insert_with(|| {
                log::debug!("{}: new device {address}", self.info.name);
                Device::new(self, address, self.config.clone(), self.events.clone())
            })
            .clone()
    }

    /// Look up a device without creating it.
    pub fn lookup_device(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    /// All known devices.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    /// Remove a device and tear down everything it owns.
    pub fn remove_device(&self, address: Address) {
        let device = self.devices.lock().unwrap().remove(&address);
        if let Some(device) = device {
            device.teardown();
        }
    }

    /// Start the SCO connection dispatcher for this adapter.
    pub fn start_sco_dispatcher(self: &Arc<Self>) {
        let mut slot = self.sco_dispatcher.lock().unwrap();
        if slot.is_none() {
            *slot = Some(sco::spawn_dispatcher(self.clone()));
        }
    }

    /// Tear down the dispatcher and all devices.
    pub fn shutdown(&self) {
        if let Some(task) = self.sco_dispatcher.lock().unwrap().take() {
            task.abort();
        }
        let devices: Vec<_> = self.devices.lock().unwrap().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.teardown();
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        if let Some(task) = self.sco_dispatcher.lock().unwrap().take() {
            task.abort();
        }
    }
}
