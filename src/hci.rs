//! HCI helpers: adapter enumeration, SCO sockets and vendor quirks.
//!
//! This module owns every raw Bluetooth socket call the daemon makes.
//! The wrappers are deliberately narrow: `AF_BLUETOOTH` is baked in,
//! SCO addresses travel as [Address] values, and the few socket options
//! the profiles need are exposed as named operations.

use libc::{sa_family_t, socklen_t, AF_BLUETOOTH, SOCK_RAW, SOCK_SEQPACKET};
use std::{
    ffi::CStr,
    io::{Error, ErrorKind, Result},
    mem::{size_of, MaybeUninit},
    os::unix::io::AsRawFd,
    time::{Duration, Instant},
};

use crate::{
    sock::{self, OwnedFd},
    sys::{
        bt_voice, hci_dev_info, hci_dev_list_req, hci_filter, sockaddr_hci, sockaddr_sco, BTPROTO_HCI,
        BTPROTO_SCO, BT_DEFER_SETUP, BT_RCVMTU, BT_SNDMTU, BT_VOICE, EVT_CMD_COMPLETE, HCIGETDEVINFO,
        HCIGETDEVLIST, HCI_CHANNEL_RAW, HCI_COMMAND_PKT, HCI_EVENT_PKT, HCI_FILTER, SOL_BLUETOOTH, SOL_HCI,
    },
    Address,
};

/// Turn a `-1` syscall result into the current `errno`.
fn check(ret: libc::c_int) -> Result<libc::c_int> {
    if ret == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Open a non-blocking, close-on-exec Bluetooth socket.
fn bt_socket(ty: libc::c_int, proto: libc::c_int) -> Result<OwnedFd> {
    let fd = check(unsafe {
        libc::socket(AF_BLUETOOTH, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, proto)
    })?;
    Ok(unsafe { OwnedFd::new(fd) })
}

fn sco_sockaddr(addr: Address) -> sockaddr_sco {
    sockaddr_sco { sco_family: AF_BLUETOOTH as sa_family_t, sco_bdaddr: addr.into() }
}

fn bind_sco(fd: &OwnedFd, addr: Address) -> Result<()> {
    let sa = sco_sockaddr(addr);
    check(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sa as *const sockaddr_sco as *const libc::sockaddr,
            size_of::<sockaddr_sco>() as socklen_t,
        )
    })?;
    Ok(())
}

/// Read one socket option value.
fn get_opt<T: Copy>(fd: &OwnedFd, level: libc::c_int, name: libc::c_int) -> Result<T> {
    let mut value = MaybeUninit::<T>::uninit();
    let mut len = size_of::<T>() as socklen_t;
    check(unsafe {
        libc::getsockopt(fd.as_raw_fd(), level, name, value.as_mut_ptr() as *mut _, &mut len)
    })?;
    if len as usize != size_of::<T>() {
        return Err(Error::new(ErrorKind::InvalidData, "socket option size mismatch"));
    }
    Ok(unsafe { value.assume_init() })
}

/// Write one socket option value.
fn set_opt<T>(fd: &OwnedFd, level: libc::c_int, name: libc::c_int, value: &T) -> Result<()> {
    check(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            value as *const T as *const _,
            size_of::<T>() as socklen_t,
        )
    })?;
    Ok(())
}

/// Static information about a local Bluetooth controller.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Numeric HCI device id, e.g. 0 for `hci0`.
    pub id: u16,
    /// Kernel device name, e.g. `hci0`.
    pub name: String,
    /// Controller Bluetooth address.
    pub address: Address,
    /// SCO MTU reported by the kernel driver.
    pub sco_mtu: u16,
}

/// Enumerate local Bluetooth controllers.
pub fn enumerate() -> Result<Vec<AdapterInfo>> {
    let ctl = bt_socket(SOCK_RAW, BTPROTO_HCI)?;

    let mut list = hci_dev_list_req::default();
    sock::ioctl_mut(&ctl, HCIGETDEVLIST, &mut list)?;

    let mut adapters = Vec::new();
    for req in &list.dev_req[..list.dev_num as usize] {
        match device_info(&ctl, req.dev_id) {
            Ok(info) => adapters.push(info),
            Err(err) => log::warn!("hci{}: cannot query device info: {err}", req.dev_id),
        }
    }
    Ok(adapters)
}

/// Query static information about a single controller.
pub fn device_info(ctl: &OwnedFd, dev_id: u16) -> Result<AdapterInfo> {
    let mut info = hci_dev_info { dev_id, ..Default::default() };
    sock::ioctl_mut(ctl, HCIGETDEVINFO, &mut info)?;

    let name = unsafe { CStr::from_ptr(info.name.as_ptr()) }.to_string_lossy().into_owned();
    Ok(AdapterInfo { id: info.dev_id, name, address: Address::from(info.bdaddr), sco_mtu: info.sco_mtu })
}

/// Create a listening SCO socket bound to the given adapter address.
///
/// Deferred setup is enabled so that the accept completes before audio
/// starts to flow; the final setup is triggered by the first read.
pub fn sco_listen(local: Address) -> Result<OwnedFd> {
    let fd = bt_socket(SOCK_SEQPACKET, BTPROTO_SCO)?;
    bind_sco(&fd, local)?;
    set_opt(&fd, SOL_BLUETOOTH, BT_DEFER_SETUP, &1i32)?;
    check(unsafe { libc::listen(fd.as_raw_fd(), 10) })?;
    Ok(fd)
}

/// Accept one SCO connection from a listening socket.
///
/// Returns the connected socket, in non-blocking mode, and the peer
/// address. Fails with `WouldBlock` when no connection is pending.
pub fn sco_accept(listener: &OwnedFd) -> Result<(OwnedFd, Address)> {
    let mut sa = MaybeUninit::<sockaddr_sco>::uninit();
    let mut len = size_of::<sockaddr_sco>() as socklen_t;
    let fd = check(unsafe {
        libc::accept4(
            listener.as_raw_fd(),
            sa.as_mut_ptr() as *mut _,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    let fd = unsafe { OwnedFd::new(fd) };

    if len as usize != size_of::<sockaddr_sco>() {
        return Err(Error::new(ErrorKind::InvalidData, "short SCO peer address"));
    }
    let sa = unsafe { sa.assume_init() };
    if sa.sco_family != AF_BLUETOOTH as sa_family_t {
        return Err(Error::new(ErrorKind::InvalidData, "SCO peer is not a Bluetooth address"));
    }
    Ok((fd, Address::from(sa.sco_bdaddr)))
}

/// Create an SCO socket and start a non-blocking connect to the peer.
///
/// The caller must wait for write readiness and call
/// [finish_connect] to complete the connection.
pub fn sco_connect(local: Address, remote: Address, voice: u16) -> Result<OwnedFd> {
    let fd = bt_socket(SOCK_SEQPACKET, BTPROTO_SCO)?;
    bind_sco(&fd, local)?;
    set_voice(&fd, voice)?;

    let sa = sco_sockaddr(remote);
    match check(unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &sa as *const sockaddr_sco as *const libc::sockaddr,
            size_of::<sockaddr_sco>() as socklen_t,
        )
    }) {
        Ok(_) => Ok(fd),
        Err(err)
            if err.raw_os_error() == Some(libc::EINPROGRESS) || err.raw_os_error() == Some(libc::EAGAIN) =>
        {
            Ok(fd)
        }
        Err(err) => Err(err),
    }
}

/// Resolve the outcome of a non-blocking connect once the socket became
/// writable: `Ok` when established, `WouldBlock` while still pending,
/// the connection error otherwise.
pub fn finish_connect(fd: &OwnedFd) -> Result<()> {
    let err: libc::c_int = get_opt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    match err {
        0 => Ok(()),
        libc::EINPROGRESS | libc::EAGAIN => Err(ErrorKind::WouldBlock.into()),
        _ => Err(Error::from_raw_os_error(err)),
    }
}

/// Set the SCO voice setting socket option.
pub fn set_voice(fd: &OwnedFd, setting: u16) -> Result<()> {
    set_opt(fd, SOL_BLUETOOTH, BT_VOICE, &bt_voice { setting })
}

/// Query the read and write MTU of a connected SCO socket.
pub fn sco_mtu(fd: &OwnedFd) -> Result<(usize, usize)> {
    let rcv: u32 = get_opt(fd, SOL_BLUETOOTH, BT_RCVMTU)?;
    let snd: u32 = get_opt(fd, SOL_BLUETOOTH, BT_SNDMTU)?;
    Ok((rcv as usize, snd as usize))
}

/// Local version information of a controller.
#[derive(Debug, Clone, Copy)]
pub struct LocalVersion {
    /// HCI version.
    pub hci_version: u8,
    /// Bluetooth SIG company identifier of the controller vendor.
    pub manufacturer: u16,
}

const OGF_INFO_PARAM: u16 = 0x04;
const OCF_READ_LOCAL_VERSION: u16 = 0x0001;
const OGF_VENDOR: u16 = 0x3f;
const OCF_BCM_READ_SCO_PCM_PARAM: u16 = 0x001d;
const OCF_BCM_WRITE_SCO_PCM_PARAM: u16 = 0x001c;

/// SCO routing value selecting the HCI transport on Broadcom chips.
const BCM_SCO_ROUTING_TRANSPORT: u8 = 0x01;

fn opcode(ogf: u16, ocf: u16) -> u16 {
    (ogf << 10) | ocf
}

/// Issue an HCI command on a raw HCI socket and wait for its
/// Command Complete event. Returns the event parameters, the leading
/// status byte included.
///
/// Blocking with a short timeout; used only during startup probes.
fn hci_request(dev_id: u16, ogf: u16, ocf: u16, params: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let fd = bt_socket(SOCK_RAW, BTPROTO_HCI)?;
    let op = opcode(ogf, ocf);

    let addr = sockaddr_hci { hci_family: AF_BLUETOOTH as _, hci_dev: dev_id, hci_channel: HCI_CHANNEL_RAW };
    check(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const sockaddr_hci as *const libc::sockaddr,
            size_of::<sockaddr_hci>() as socklen_t,
        )
    })?;

    let mut filter = hci_filter::default();
    filter.type_mask = 1u32 << HCI_EVENT_PKT;
    filter.event_mask[0] = 1u32 << EVT_CMD_COMPLETE;
    filter.opcode = op;
    set_opt(&fd, SOL_HCI, HCI_FILTER, &filter)?;

    let mut pkt = Vec::with_capacity(4 + params.len());
    pkt.push(HCI_COMMAND_PKT);
    pkt.extend_from_slice(&op.to_le_bytes());
    pkt.push(params.len() as u8);
    pkt.extend_from_slice(params);
    sock::write(&fd, &pkt)?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 260];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::new(ErrorKind::TimedOut, "HCI command timed out"));
        }
        let mut pollfd = libc::pollfd { fd: fd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let rc = unsafe { libc::poll(&mut pollfd, 1, remaining.as_millis() as i32) };
        if rc == -1 {
            let err = Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(Error::new(ErrorKind::TimedOut, "HCI command timed out"));
        }

        let n = sock::read(&fd, &mut buf)?;
        // [packet type, event, plen, ncmd, opcode lo, opcode hi, params...]
        if n < 6 || buf[0] != HCI_EVENT_PKT || buf[1] != EVT_CMD_COMPLETE {
            continue;
        }
        let evt_op = u16::from_le_bytes([buf[4], buf[5]]);
        if evt_op != op {
            continue;
        }
        return Ok(buf[6..n].to_vec());
    }
}

/// Read the local version information of a controller.
pub fn read_local_version(dev_id: u16) -> Result<LocalVersion> {
    let params = hci_request(dev_id, OGF_INFO_PARAM, OCF_READ_LOCAL_VERSION, &[], Duration::from_secs(1))?;
    if params.len() < 9 || params[0] != 0 {
        return Err(Error::new(ErrorKind::InvalidData, "Read Local Version Information failed"));
    }
    Ok(LocalVersion { hci_version: params[1], manufacturer: u16::from_le_bytes([params[4], params[5]]) })
}

/// One-shot Broadcom probe: make sure SCO audio is routed over the HCI
/// transport. Without this, accepted SCO links carry no audio to
/// userspace on these controllers.
pub fn bcm_route_sco_to_transport(dev_id: u16) -> Result<()> {
    let params =
        hci_request(dev_id, OGF_VENDOR, OCF_BCM_READ_SCO_PCM_PARAM, &[], Duration::from_secs(1))?;
    if params.len() < 6 || params[0] != 0 {
        return Err(Error::new(ErrorKind::InvalidData, "cannot read SCO PCM routing"));
    }

    if params[1] == BCM_SCO_ROUTING_TRANSPORT {
        log::debug!("hci{dev_id}: SCO routing already set to transport");
        return Ok(());
    }

    let mut wr = [0u8; 5];
    wr.copy_from_slice(&params[1..6]);
    wr[0] = BCM_SCO_ROUTING_TRANSPORT;
    let params = hci_request(dev_id, OGF_VENDOR, OCF_BCM_WRITE_SCO_PCM_PARAM, &wr, Duration::from_secs(1))?;
    if params.is_empty() || params[0] != 0 {
        return Err(Error::new(ErrorKind::InvalidData, "cannot write SCO PCM routing"));
    }
    log::info!("hci{dev_id}: SCO routing set to transport");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_packing() {
        assert_eq!(opcode(OGF_INFO_PARAM, OCF_READ_LOCAL_VERSION), 0x1001);
        assert_eq!(opcode(OGF_VENDOR, OCF_BCM_WRITE_SCO_PCM_PARAM), 0xfc1c);
    }
}
