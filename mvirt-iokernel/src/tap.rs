//! TAP device port
//!
//! A Layer 2 TAP device opened with `IFF_VNET_HDR`, so the kernel reports
//! checksum validation in a virtio-net header in front of every frame. Used
//! as the development stand-in for a kernel-bypass NIC.

use std::fs::{self, File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::libc::{self, IFF_NO_PI, IFF_TAP, IFF_VNET_HDR, IFNAMSIZ, c_char, c_short, c_uint};
use nix::sys::uio::{readv, writev};
use smoltcp::wire::EthernetAddress;
use tracing::{debug, info, warn};

use crate::nic::NicPort;
use crate::pool::{PacketBuf, PacketPool, PoolError};

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;
const TUNSETVNETHDRSZ: libc::Ioctl = 0x400454d8 as libc::Ioctl;

/// Size of the virtio_net_hdr structure (12 bytes for v1)
pub const VNET_HDR_SIZE: usize = 12;

/// `flags`: the device validated the packet checksum
pub const VIRTIO_NET_HDR_F_DATA_VALID: u8 = 2;

/// virtio_net_hdr prepended to each frame when IFF_VNET_HDR is set
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: u16,
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
    pub num_buffers: u16,
}

impl VirtioNetHdr {
    fn from_bytes(b: &[u8; VNET_HDR_SIZE]) -> Self {
        let u16_at = |i: usize| u16::from_ne_bytes([b[i], b[i + 1]]);
        Self {
            flags: b[0],
            gso_type: b[1],
            hdr_len: u16_at(2),
            gso_size: u16_at(4),
            csum_start: u16_at(6),
            csum_offset: u16_at(8),
            num_buffers: u16_at(10),
        }
    }

    pub fn data_valid(&self) -> bool {
        self.flags & VIRTIO_NET_HDR_F_DATA_VALID != 0
    }
}

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

#[repr(C)]
struct IfReqHwAddr {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_hwaddr: libc::sockaddr,
    _padding: [u8; 8],
}

/// RAII guard for a socket fd
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

pub struct TapPort {
    name: String,
    file: File,
    mac: EthernetAddress,
    numa_node: Option<u32>,
}

impl TapPort {
    /// Create (or attach to) TAP device `name` and bring it up.
    pub fn open(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TAP device name must be 1..16 bytes",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: (IFF_TAP | IFF_NO_PI | IFF_VNET_HDR) as c_short,
            _padding: [0; 22],
        };
        copy_name(&mut ifr.ifr_name, name);

        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let vnet_hdr_sz: c_uint = VNET_HDR_SIZE as c_uint;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETVNETHDRSZ, &vnet_hdr_sz) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = SockGuard(sock);
        bring_up(&sock, name)?;
        let mac = hw_address(&sock, name)?;
        let numa_node = read_numa_node(name);

        info!(name, mac = %mac, numa_node = ?numa_node, "TAP port opened");

        Ok(Self {
            name: name.to_string(),
            file,
            mac,
            numa_node,
        })
    }

    fn recv_one(&mut self, buf: &mut PacketBuf) -> io::Result<Option<VirtioNetHdr>> {
        let mut vnet = [0u8; VNET_HDR_SIZE];
        let n = {
            let mut iov = [IoSliceMut::new(&mut vnet), IoSliceMut::new(buf.write_area())];
            match readv(&self.file, &mut iov) {
                Ok(n) => n,
                Err(nix::errno::Errno::EAGAIN) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };
        if n < VNET_HDR_SIZE {
            warn!(len = n, "Short read from TAP device");
            buf.set_len(0);
            return Ok(Some(VirtioNetHdr::default()));
        }
        buf.set_len(n - VNET_HDR_SIZE);
        Ok(Some(VirtioNetHdr::from_bytes(&vnet)))
    }
}

impl NicPort for TapPort {
    fn rx_burst(
        &mut self,
        pool: &Arc<PacketPool>,
        out: &mut Vec<PacketBuf>,
        max: usize,
    ) -> io::Result<usize> {
        let mut received = 0;
        while received < max {
            let mut buf = match pool.allocate() {
                Ok(buf) => buf,
                Err(PoolError::Exhausted) => {
                    debug!("Packet pool exhausted, ending RX burst");
                    break;
                }
                Err(e) => return Err(io::Error::other(e)),
            };
            let Some(vnet) = self.recv_one(&mut buf)? else {
                break;
            };
            if buf.is_empty() {
                continue;
            }
            buf.set_checksum_good(vnet.data_valid());
            out.push(buf);
            received += 1;
        }
        Ok(received)
    }

    fn tx_burst(&mut self, bufs: &mut Vec<PacketBuf>) -> io::Result<usize> {
        let hdr = [0u8; VNET_HDR_SIZE];
        let mut sent = 0;
        let mut failure = None;
        for buf in bufs.iter() {
            let iov = [IoSlice::new(&hdr), IoSlice::new(buf.data())];
            match writev(&self.file, &iov) {
                Ok(_) => sent += 1,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        bufs.drain(..sent);
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(sent),
        }
    }

    fn mac_address(&self) -> EthernetAddress {
        self.mac
    }

    fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn copy_name(dst: &mut [c_char; IFNAMSIZ], name: &str) {
    for (i, byte) in name.bytes().enumerate().take(IFNAMSIZ - 1) {
        dst[i] = byte as c_char;
    }
}

fn bring_up(sock: &SockGuard, name: &str) -> io::Result<()> {
    let mut ifr = IfReq {
        ifr_name: [0; IFNAMSIZ],
        ifr_flags: 0,
        _padding: [0; 22],
    };
    copy_name(&mut ifr.ifr_name, name);

    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    ifr.ifr_flags |= libc::IFF_UP as c_short;
    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn hw_address(sock: &SockGuard, name: &str) -> io::Result<EthernetAddress> {
    // SAFETY: all-zero is a valid sockaddr
    let mut ifr = IfReqHwAddr {
        ifr_name: [0; IFNAMSIZ],
        ifr_hwaddr: unsafe { std::mem::zeroed() },
        _padding: [0; 8],
    };
    copy_name(&mut ifr.ifr_name, name);

    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFHWADDR as _, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(ifr.ifr_hwaddr.sa_data.iter()) {
        *dst = *src as u8;
    }
    Ok(EthernetAddress(mac))
}

/// TAP devices have no backing PCI device; honour one if present.
fn read_numa_node(name: &str) -> Option<u32> {
    let raw = fs::read_to_string(format!("/sys/class/net/{name}/device/numa_node")).ok()?;
    // -1 means "no affinity"
    raw.trim().parse::<i32>().ok().and_then(|n| u32::try_from(n).ok())
}
