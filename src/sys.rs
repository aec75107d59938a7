//! System native types and constants.

use libc::{c_char, sa_family_t};

pub const BTPROTO_HCI: i32 = 1;
pub const BTPROTO_SCO: i32 = 2;

pub const SOL_HCI: i32 = 0;
pub const SOL_BLUETOOTH: i32 = 274;

#[repr(packed)]
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct bdaddr_t {
    pub b: [u8; 6],
}

pub const BT_DEFER_SETUP: i32 = 7;
pub const BT_VOICE: i32 = 11;
pub const BT_SNDMTU: i32 = 12;
pub const BT_RCVMTU: i32 = 13;

#[repr(C)]
#[derive(Clone)]
pub struct bt_voice {
    pub setting: u16,
}

pub const BT_VOICE_TRANSPARENT: u16 = 0x0003;
pub const BT_VOICE_CVSD_16BIT: u16 = 0x0060;

#[repr(C)]
#[derive(Clone)]
pub struct sockaddr_sco {
    pub sco_family: sa_family_t,
    pub sco_bdaddr: bdaddr_t,
}

#[repr(C)]
#[derive(Clone, Default)]
pub struct sockaddr_hci {
    pub hci_family: sa_family_t,
    pub hci_dev: u16,
    pub hci_channel: u16,
}

pub const HCI_CHANNEL_RAW: u16 = 0;

pub const HCI_FILTER: i32 = 2;

#[repr(C)]
#[derive(Clone, Default)]
pub struct hci_filter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;
pub const EVT_CMD_COMPLETE: u8 = 0x0e;

pub const HCI_MAX_DEV: usize = 16;

pub const HCIGETDEVLIST: libc::c_ulong = 0x800448d2;
pub const HCIGETDEVINFO: libc::c_ulong = 0x800448d3;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct hci_dev_req {
    pub dev_id: u16,
    pub dev_opt: u32,
}

#[repr(C)]
#[derive(Clone)]
pub struct hci_dev_list_req {
    pub dev_num: u16,
    pub dev_req: [hci_dev_req; HCI_MAX_DEV],
}

impl Default for hci_dev_list_req {
    fn default() -> Self {
        Self { dev_num: HCI_MAX_DEV as u16, dev_req: [hci_dev_req::default(); HCI_MAX_DEV] }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct hci_dev_stats {
    pub err_rx: u32,
    pub err_tx: u32,
    pub cmd_tx: u32,
    pub evt_rx: u32,
    pub acl_tx: u32,
    pub acl_rx: u32,
    pub sco_tx: u32,
    pub sco_rx: u32,
    pub byte_rx: u32,
    pub byte_tx: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct hci_dev_info {
    pub dev_id: u16,
    pub name: [c_char; 8],
    pub bdaddr: bdaddr_t,
    pub flags: u32,
    pub type_: u8,
    pub features: [u8; 8],
    pub pkt_type: u32,
    pub link_policy: u32,
    pub link_mode: u32,
    pub acl_mtu: u16,
    pub acl_pkts: u16,
    pub sco_mtu: u16,
    pub sco_pkts: u16,
    pub stat: hci_dev_stats,
}

impl Default for hci_dev_info {
    fn default() -> Self {
        // All-zero is a valid initial value for every field.
        unsafe { std::mem::zeroed() }
    }
}

/// Bluetooth SIG company identifier of Broadcom Corporation.
pub const COMPANY_BROADCOM: u16 = 15;
