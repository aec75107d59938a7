//! Remote Bluetooth devices.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use crate::{
    adapter::Adapter,
    config::Config,
    engine::{GraphEvent, GraphEvents},
    rfcomm::RfcommSession,
    transport::Transport,
    Address, Profile, SERVICE_PATH,
};

/// One remote peer seen on an adapter.
pub struct Device {
    /// Remote Bluetooth address.
    pub address: Address,
    /// Owning adapter. The device does not keep its adapter alive.
    pub adapter: Weak<Adapter>,
    /// Adapter name, cached for path construction.
    pub adapter_name: String,
    name: Mutex<String>,
    transports: Mutex<HashMap<Profile, Arc<Transport>>>,
    rfcomm: Mutex<Option<Arc<RfcommSession>>>,
    pub(crate) config: Arc<Config>,
    pub(crate) events: GraphEvents,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Device {{ {} on {} }}", self.address, self.adapter_name)
    }
}

impl Device {
    pub(crate) fn new(
        adapter: &Arc<Adapter>, address: Address, config: Arc<Config>, events: GraphEvents,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            adapter: Arc::downgrade(adapter),
            adapter_name: adapter.info.name.clone(),
            name: Mutex::new(address.to_string()),
            transports: Mutex::new(HashMap::new()),
            rfcomm: Mutex::new(None),
            config,
            events,
        })
    }

    /// Base object path of this device.
    pub fn path(&self) -> String {
        format!("{SERVICE_PATH}/{}/{}", self.adapter_name, self.address.to_path_fragment())
    }

    /// Human readable name, the address until told otherwise.
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Update the human readable name.
    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    /// Look up a transport by local profile.
    pub fn transport(&self, profile: Profile) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().get(&profile).cloned()
    }

    /// All transports of this device.
    pub fn transports(&self) -> Vec<Arc<Transport>> {
        self.transports.lock().unwrap().values().cloned().collect()
    }

    /// The SCO transport of this device, if any.
    ///
    /// A device has at most one voice link; HFP and HSP are mutually
    /// exclusive per connection.
    pub fn sco_transport(&self) -> Option<Arc<Transport>> {
        self.transports.lock().unwrap().values().find(|t| t.profile.is_sco()).cloned()
    }

    /// Insert a transport; an existing transport of the same profile is
    /// torn down first.
    pub fn insert_transport(&self, transport: Arc<Transport>) {
        let old = self.transports.lock().unwrap().insert(transport.profile, transport);
        if let Some(old) = old {
            log::warn!("{}: replacing existing transport", old.path);
            old.teardown();
        }
    }

    /// Remove and tear down the transport of the given profile.
    pub fn remove_transport(&self, profile: Profile) {
        let transport = self.transports.lock().unwrap().remove(&profile);
        if let Some(transport) = transport {
            transport.teardown();
        }
    }

    /// The RFCOMM session of this device, if any.
    pub fn rfcomm(&self) -> Option<Arc<RfcommSession>> {
        self.rfcomm.lock().unwrap().clone()
    }

    /// Attach an RFCOMM session.
    pub fn set_rfcomm(&self, session: Arc<RfcommSession>) {
        let old = self.rfcomm.lock().unwrap().replace(session.clone());
        if let Some(old) = old {
            old.teardown();
            let _ = self.events.send(GraphEvent::RfcommRemoved(old.path.clone()));
        }
        let _ = self.events.send(GraphEvent::RfcommAdded(session));
    }

    /// Detach and tear down the RFCOMM session.
    pub fn remove_rfcomm(&self) {
        let session = self.rfcomm.lock().unwrap().take();
        if let Some(session) = session {
            session.teardown();
            let _ = self.events.send(GraphEvent::RfcommRemoved(session.path.clone()));
        }
    }

    /// Tear down everything owned by this device.
    pub fn teardown(&self) {
        let transports: Vec<_> =
            self.transports.lock().unwrap().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.teardown();
        }
        self.remove_rfcomm();
    }
}
