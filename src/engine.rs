//! Engine root: the adapter registry and the graph event channel.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

use crate::{
    adapter::Adapter,
    config::Config,
    device::Device,
    hci::AdapterInfo,
    pcm::Pcm,
    rfcomm::RfcommSession,
    Address,
};

/// Graph mutation events.
///
/// Every externally visible change to the object graph flows through one
/// ordered channel. The RPC layer drains it and emits the corresponding
/// D-Bus signals, which yields the documented ordering for free: an add
/// precedes every property change of the object, and a removal is the
/// last event for its path.
#[derive(Debug)]
pub enum GraphEvent {
    /// A PCM became available.
    PcmAdded(Arc<Pcm>),
    /// A PCM was removed; no further events reference this path.
    PcmRemoved(String),
    /// Properties of a PCM changed.
    PcmChanged {
        /// Object path of the PCM.
        path: String,
        /// Changed properties.
        properties: Vec<PcmProperty>,
    },
    /// An RFCOMM session became available.
    RfcommAdded(Arc<RfcommSession>),
    /// An RFCOMM session was removed.
    RfcommRemoved(String),
    /// Properties of an RFCOMM session changed.
    RfcommChanged {
        /// Object path of the session.
        path: String,
        /// Changed properties.
        properties: Vec<RfcommProperty>,
    },
}

/// A changed PCM property with its new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcmProperty {
    /// Transport codec id.
    Codec(u16),
    /// Packed volume word.
    Volume(u16),
    /// Software volume flag.
    SoftVolume(bool),
    /// Reported delay in 0.1 ms units.
    Delay(u16),
    /// Sample format word.
    Format(u16),
    /// Channel count.
    Channels(u8),
    /// Sampling frequency in Hz.
    Sampling(u32),
}

impl PcmProperty {
    /// D-Bus property name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Codec(_) => "Codec",
            Self::Volume(_) => "Volume",
            Self::SoftVolume(_) => "SoftVolume",
            Self::Delay(_) => "Delay",
            Self::Format(_) => "Format",
            Self::Channels(_) => "Channels",
            Self::Sampling(_) => "Sampling",
        }
    }
}

/// A changed RFCOMM property with its new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfcommProperty {
    /// Remote feature mask.
    Features(u32),
    /// Remote battery level, 0-100.
    Battery(u8),
}

/// Sender half of the graph event channel.
pub type GraphEvents = mpsc::UnboundedSender<GraphEvent>;

/// The engine: object graph root shared by the RPC surface, the
/// Bluetooth daemon callbacks and the I/O tasks.
pub struct Engine {
    /// Immutable daemon configuration.
    pub config: Arc<Config>,
    events: GraphEvents,
    adapters: Mutex<HashMap<u16, Arc<Adapter>>>,
}

impl Engine {
    /// Create the engine and the receiving end of its event channel.
    pub fn new(config: Arc<Config>) -> (Arc<Self>, mpsc::UnboundedReceiver<GraphEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { config, events, adapters: Mutex::new(HashMap::new()) }), rx)
    }

    /// Sender handle for graph events.
    pub fn events(&self) -> GraphEvents {
        self.events.clone()
    }

    /// Register an adapter the daemon serves.
    pub fn add_adapter(&self, info: AdapterInfo) -> Arc<Adapter> {
        let adapter = Adapter::new(info, self.config.clone(), self.events.clone());
        self.adapters.lock().unwrap().insert(adapter.info.id, adapter.clone());
        adapter
    }

    /// Look up an adapter by HCI device id.
    pub fn adapter(&self, id: u16) -> Option<Arc<Adapter>> {
        self.adapters.lock().unwrap().get(&id).cloned()
    }

    /// Look up an adapter by name, e.g. `hci0`.
    pub fn adapter_by_name(&self, name: &str) -> Option<Arc<Adapter>> {
        self.adapters.lock().unwrap().values().find(|a| a.info.name == name).cloned()
    }

    /// Names of all served adapters, sorted.
    pub fn adapter_names(&self) -> Vec<String> {
        let mut names: Vec<_> =
            self.adapters.lock().unwrap().values().map(|a| a.info.name.clone()).collect();
        names.sort();
        names
    }

    /// All served adapters.
    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.lock().unwrap().values().cloned().collect()
    }

    /// Snapshot of every PCM in the graph.
    pub fn pcms(&self) -> Vec<Arc<Pcm>> {
        let mut pcms = Vec::new();
        for adapter in self.adapters() {
            for device in adapter.devices() {
                for transport in device.transports() {
                    pcms.extend(transport.pcms().iter().cloned());
                }
            }
        }
        pcms
    }

    /// Snapshot of every RFCOMM session in the graph.
    pub fn rfcomms(&self) -> Vec<Arc<RfcommSession>> {
        let mut sessions = Vec::new();
        for adapter in self.adapters() {
            for device in adapter.devices() {
                sessions.extend(device.rfcomm());
            }
        }
        sessions
    }

    /// Find a device by adapter name and address.
    pub fn device(&self, adapter_name: &str, address: Address) -> Option<Arc<Device>> {
        self.adapter_by_name(adapter_name)?.lookup_device(address)
    }

    /// Tear down all adapters, devices and transports.
    pub fn shutdown(&self) {
        let adapters: Vec<_> = self.adapters.lock().unwrap().drain().map(|(_, a)| a).collect();
        for adapter in adapters {
            adapter.shutdown();
        }
    }
}
