//! Interface address discovery and listener socket setup.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

#[cfg(target_os = "linux")]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(target_os = "linux")]
use tokio::io::Interest;

/// Pick the IPv4 address we should advertise to booting clients.
///
/// When `interface` is set only that interface's addresses are
/// considered; otherwise every interface on the host is.
pub fn interface_ipv4(interface: Option<&str>) -> Option<Ipv4Addr> {
    let addrs = getifaddrs().ok()?;
    let mut candidates = Vec::new();
    for ifa in addrs {
        if let Some(want) = interface {
            if ifa.interface_name != want {
                continue;
            }
        }
        if let Some(storage) = ifa.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                candidates.push(Ipv4Addr::from(sin.ip()));
            }
        }
    }
    best_ipv4(candidates)
}

/// Pick the IPv4 address to advertise for one interface, by index.
pub fn interface_ipv4_by_index(index: u32) -> Option<Ipv4Addr> {
    let addrs = getifaddrs().ok()?;
    let mut candidates = Vec::new();
    for ifa in addrs {
        if if_nametoindex(ifa.interface_name.as_str()).ok() != Some(index) {
            continue;
        }
        if let Some(storage) = ifa.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                candidates.push(Ipv4Addr::from(sin.ip()));
            }
        }
    }
    best_ipv4(candidates)
}

/// The address a DHCP reply should advertise: a configured interface
/// always wins, then the interface the request arrived on, then the
/// best address anywhere on the host.
pub fn reply_ipv4(interface: Option<&str>, ifindex: Option<i32>) -> Option<Ipv4Addr> {
    if interface.is_some() {
        return interface_ipv4(interface);
    }
    if let Some(index) = ifindex {
        if let Some(ip) = u32::try_from(index).ok().and_then(interface_ipv4_by_index) {
            return Some(ip);
        }
    }
    interface_ipv4(None)
}

/// Choose among candidate addresses: global unicast beats link-local
/// beats loopback. Returns `None` when no usable address exists.
pub fn best_ipv4(addrs: impl IntoIterator<Item = Ipv4Addr>) -> Option<Ipv4Addr> {
    let mut link_local = None;
    let mut loopback = None;
    for addr in addrs {
        if addr.is_unspecified() || addr.is_broadcast() || addr.is_multicast() {
            continue;
        }
        if addr.is_loopback() {
            loopback.get_or_insert(addr);
        } else if addr.is_link_local() {
            link_local.get_or_insert(addr);
        } else {
            return Some(addr);
        }
    }
    link_local.or(loopback)
}

/// Bind a UDP listener socket for one of the boot services.
///
/// Broadcast is enabled for the DHCP-family responders, and on Linux
/// the socket can be pinned to an interface so replies leave on the
/// same segment the request arrived on.
pub fn bind_udp(port: u16, interface: Option<&str>, broadcast: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create socket")?;

    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }

    #[cfg(target_os = "linux")]
    if let Some(iface) = interface {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        let iface_bytes = iface.as_bytes();
        let result = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                iface_bytes.as_ptr() as *const libc::c_void,
                iface_bytes.len() as libc::socklen_t,
            )
        };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            anyhow::bail!("failed to bind to interface {}: {}", iface, err);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = interface;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind to port {}", port))?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into()).context("failed to register socket with the runtime")
}

/// A DHCP responder socket that knows which interface each datagram
/// arrived on and can pin the reply to that same interface.
///
/// A broadcast reply would otherwise leave on whatever interface the
/// kernel routes 255.255.255.255 to, which on a multi-homed host is not
/// necessarily the segment the request came from. `IP_PKTINFO` is
/// enabled on receive, and the recorded interface index is attached as
/// a control message on send.
pub struct DhcpSocket {
    inner: UdpSocket,
}

impl DhcpSocket {
    /// Bind a broadcast-capable responder socket on `port`.
    pub fn bind(port: u16, interface: Option<&str>) -> Result<Self> {
        let inner = bind_udp(port, interface, true)?;
        enable_pktinfo(&inner)?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Receive a datagram along with the index of the interface it
    /// arrived on.
    #[cfg(target_os = "linux")]
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::io::Result<(usize, SocketAddrV4, Option<i32>)> {
        loop {
            self.inner.readable().await?;
            let result = {
                let buf = &mut *buf;
                self.inner.try_io(Interest::READABLE, || {
                    recv_pktinfo(self.inner.as_raw_fd(), buf)
                })
            };
            match result {
                Ok(received) => return Ok(received),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::io::Result<(usize, SocketAddrV4, Option<i32>)> {
        let (len, addr) = self.inner.recv_from(buf).await?;
        match addr {
            SocketAddr::V4(src) => Ok((len, src, None)),
            SocketAddr::V6(_) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected IPv6 source",
            )),
        }
    }

    /// Send a datagram, pinned to the given egress interface when one
    /// is known.
    #[cfg(target_os = "linux")]
    pub async fn send_to(
        &self,
        buf: &[u8],
        dest: SocketAddrV4,
        ifindex: Option<i32>,
    ) -> std::io::Result<usize> {
        loop {
            self.inner.writable().await?;
            match self.inner.try_io(Interest::WRITABLE, || {
                send_pktinfo(self.inner.as_raw_fd(), buf, dest, ifindex)
            }) {
                Ok(sent) => return Ok(sent),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn send_to(
        &self,
        buf: &[u8],
        dest: SocketAddrV4,
        _ifindex: Option<i32>,
    ) -> std::io::Result<usize> {
        self.inner.send_to(buf, SocketAddr::V4(dest)).await
    }
}

#[cfg(target_os = "linux")]
fn enable_pktinfo(socket: &UdpSocket) -> Result<()> {
    let on: libc::c_int = 1;
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        anyhow::bail!("failed to enable IP_PKTINFO: {}", err);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_pktinfo(_socket: &UdpSocket) -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn recv_pktinfo(
    fd: RawFd,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddrV4, Option<i32>)> {
    let mut src: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // u64 storage keeps the control buffer aligned for cmsghdr access
    let mut cmsg_buf = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = std::mem::size_of_val(&cmsg_buf) as _;

    let len = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if len < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut ifindex = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { *cmsg };
        if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
            let info = unsafe {
                std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo)
            };
            ifindex = Some(info.ipi_ifindex);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    let src = SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(src.sin_addr.s_addr)),
        u16::from_be(src.sin_port),
    );
    Ok((len as usize, src, ifindex))
}

#[cfg(target_os = "linux")]
fn send_pktinfo(
    fd: RawFd,
    buf: &[u8],
    dest: SocketAddrV4,
    ifindex: Option<i32>,
) -> std::io::Result<usize> {
    let mut dst: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    dst.sin_family = libc::AF_INET as libc::sa_family_t;
    dst.sin_port = dest.port().to_be();
    dst.sin_addr.s_addr = u32::from(*dest.ip()).to_be();

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut dst as *mut libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(index) = ifindex {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen =
            unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::in_pktinfo>() as u32) } as _;

        let mut info: libc::in_pktinfo = unsafe { std::mem::zeroed() };
        info.ipi_ifindex = index;

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        unsafe {
            (*cmsg).cmsg_level = libc::IPPROTO_IP;
            (*cmsg).cmsg_type = libc::IP_PKTINFO;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN(std::mem::size_of::<libc::in_pktinfo>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, info);
        }
    }

    let len = unsafe { libc::sendmsg(fd, &msg, 0) };
    if len < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(len as usize)
}
