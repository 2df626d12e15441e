//! POSIX UDP transport: real sockets behind the [`Transport`] trait.
//!
//! One socket sends everything; one listener per configured source (ASM
//! probe group, SSM channel, unicast report addresses) receives. Listeners
//! are non-blocking and multiplexed with `poll(2)`, and `recvmsg` ancillary
//! data supplies the received TTL and kernel arrival timestamp where the
//! platform provides them.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use smallvec::SmallVec;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::addr::Address;
use crate::config::BeaconConfig;
use crate::transport::{Datagram, SocketKind, Transport};
use crate::util;

/// Receive buffer; both packet kinds are far smaller.
const RECV_BUF: usize = 2048;

/// Matches the kernel's `struct group_source_req`. Defined locally because
/// libc header coverage of it varies across platforms.
#[repr(C)]
struct GroupSourceReq {
    gsr_interface: u32,
    gsr_group: libc::sockaddr_storage,
    gsr_source: libc::sockaddr_storage,
}

struct Listener {
    sock: UdpSocket,
    kind: SocketKind,
}

/// The daemon's socket set.
pub struct UdpTransport {
    send_sock: UdpSocket,
    listeners: Vec<Listener>,
    ssm_index: Option<usize>,
    mcast_interface: u32,
    unicast: Address,
    default_ttl: u8,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Creates and binds every socket the configuration calls for. Failures
    /// here are fatal: the caller reports them and exits.
    ///
    /// Returns the transport and the discovered unicast address, which the
    /// caller stores back into the configuration so decoding can recognize
    /// our own traffic.
    pub fn new(cfg: &BeaconConfig) -> io::Result<(Self, Address)> {
        let reference = cfg
            .probe_group
            .or(cfg.ssm_group)
            .or_else(|| cfg.listen.first().copied());
        let v6 = reference.map(|a| a.is_ipv6()).unwrap_or(false);
        let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };

        let mut unicast = cfg.unicast;
        if unicast.is_unspecified() {
            if let Some(group) = &cfg.probe_group {
                unicast = discover_unicast(group)?;
            }
        }

        let send = make_socket(domain)?;
        let bind_port = if cfg.unicast.is_unspecified() {
            0
        } else {
            cfg.unicast.port()
        };
        send.bind(&SocketAddr::new(unicast.ip(), bind_port).into())?;
        let send_sock: UdpSocket = send.into();
        let unicast: Address = send_sock.local_addr()?.into();
        log::info!("local address is {}", unicast);

        let mut listeners = Vec::new();
        let mut ssm_index = None;

        if let Some(group) = &cfg.probe_group {
            let sock = bind_listener(domain, group)?;
            join_asm(&sock, group, cfg.mcast_interface)?;
            listeners.push(Listener {
                sock,
                kind: SocketKind::Probe,
            });
        }
        if let Some(group) = &cfg.ssm_group {
            // No ASM join here: reception comes from per-source joins.
            let sock = bind_listener(domain, group)?;
            ssm_index = Some(listeners.len());
            listeners.push(Listener {
                sock,
                kind: SocketKind::SsmProbe,
            });
        }
        for addr in &cfg.listen {
            let sock = bind_listener(domain, addr)?;
            if addr.is_multicast() {
                join_asm(&sock, addr, cfg.mcast_interface)?;
            }
            listeners.push(Listener {
                sock,
                kind: SocketKind::Report,
            });
        }

        let mut transport = Self {
            send_sock,
            listeners,
            ssm_index,
            mcast_interface: cfg.mcast_interface,
            unicast,
            default_ttl: cfg.ttl,
            recv_buf: vec![0u8; RECV_BUF],
        };
        transport.set_multicast_hop_limit(cfg.ttl)?;
        Ok((transport, unicast))
    }

    /// The unicast endpoint the send socket is bound to.
    pub fn unicast(&self) -> Address {
        self.unicast
    }

    /// Which kind of traffic listener `idx` carries.
    pub fn kind(&self, idx: usize) -> SocketKind {
        self.listeners
            .get(idx)
            .map(|l| l.kind)
            .unwrap_or(SocketKind::Report)
    }

    /// Blocks up to `timeout_ms` for readable listeners; returns their
    /// indices. An interrupting signal returns an empty set so the caller
    /// gets back to its flag checks.
    pub fn poll(&mut self, timeout_ms: u64) -> io::Result<SmallVec<[usize; 4]>> {
        let mut fds: SmallVec<[libc::pollfd; 4]> = self
            .listeners
            .iter()
            .map(|l| libc::pollfd {
                fd: l.sock.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let timeout = timeout_ms.min(i32::MAX as u64) as libc::c_int;
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(SmallVec::new());
            }
            return Err(err);
        }

        Ok(fds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.revents & libc::POLLIN != 0)
            .map(|(i, _)| i)
            .collect())
    }

    /// Receives one datagram from listener `idx`, or `None` once drained.
    ///
    /// The hop limit comes from `IP_RECVTTL`/`IPV6_RECVHOPLIMIT` ancillary
    /// data and the timestamp from `SO_TIMESTAMP`, with local fallbacks
    /// when the kernel does not supply them.
    pub fn recv(&mut self, idx: usize) -> io::Result<Option<Datagram>> {
        let Some(listener) = self.listeners.get(idx) else {
            return Ok(None);
        };
        let fd = listener.sock.as_raw_fd();

        let mut from_stor: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: self.recv_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: self.recv_buf.len(),
        };
        let mut ctl = [0u8; 64];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut from_stor as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = ctl.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = ctl.len() as _;

        let len = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if len < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let mut hop_limit = self.default_ttl;
        let mut timestamp = 0u64;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_HOPLIMIT {
                    hop_limit = *(libc::CMSG_DATA(cmsg) as *const libc::c_int) as u8;
                } else if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_TTL {
                    hop_limit = *(libc::CMSG_DATA(cmsg) as *const libc::c_int) as u8;
                } else if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMP
                {
                    let tv = *(libc::CMSG_DATA(cmsg) as *const libc::timeval);
                    timestamp = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        if timestamp == 0 {
            timestamp = util::now_millis();
        }

        let Some(from) = from_storage(&from_stor) else {
            return Ok(None);
        };

        Ok(Some(Datagram {
            payload: self.recv_buf[..len as usize].to_vec(),
            from,
            to: self.unicast,
            hop_limit,
            timestamp,
        }))
    }

    fn ssm_op(&self, op: libc::c_int, group: &Address, source: &Address) -> io::Result<()> {
        let Some(idx) = self.ssm_index else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no SSM socket configured",
            ));
        };
        let fd = self.listeners[idx].sock.as_raw_fd();

        let mut req: GroupSourceReq = unsafe { std::mem::zeroed() };
        req.gsr_interface = self.mcast_interface;
        req.gsr_group = to_storage(group);
        req.gsr_source = to_storage(source);

        let level = if source.is_ipv6() {
            libc::IPPROTO_IPV6
        } else {
            libc::IPPROTO_IP
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                op,
                &req as *const _ as *const libc::c_void,
                std::mem::size_of::<GroupSourceReq>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn asm_listener(&self) -> &UdpSocket {
        self.listeners
            .iter()
            .find(|l| l.kind == SocketKind::Probe)
            .map(|l| &l.sock)
            .unwrap_or(&self.send_sock)
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, payload: &[u8], to: &Address) -> io::Result<usize> {
        self.send_sock.send_to(payload, SocketAddr::from(*to))
    }

    fn join_group(&mut self, group: &Address) -> io::Result<()> {
        join_asm(self.asm_listener(), group, self.mcast_interface)
    }

    fn leave_group(&mut self, group: &Address) -> io::Result<()> {
        let sock = SockRef::from(self.asm_listener());
        match group.ip() {
            IpAddr::V4(ip) => sock.leave_multicast_v4_n(
                &ip,
                &socket2::InterfaceIndexOrAddress::Index(self.mcast_interface),
            ),
            IpAddr::V6(ip) => sock.leave_multicast_v6(&ip, self.mcast_interface),
        }
    }

    fn join_source_group(&mut self, group: &Address, source: &Address) -> io::Result<()> {
        self.ssm_op(libc::MCAST_JOIN_SOURCE_GROUP, group, source)
    }

    fn leave_source_group(&mut self, group: &Address, source: &Address) -> io::Result<()> {
        self.ssm_op(libc::MCAST_LEAVE_SOURCE_GROUP, group, source)
    }

    fn set_multicast_hop_limit(&mut self, hops: u8) -> io::Result<()> {
        let sock = SockRef::from(&self.send_sock);
        if self.unicast.is_ipv6() {
            sock.set_multicast_hops_v6(hops as u32)
        } else {
            sock.set_multicast_ttl_v4(hops as u32)
        }
    }
}

fn make_socket(domain: Domain) -> io::Result<Socket> {
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    Ok(sock)
}

fn bind_listener(domain: Domain, addr: &Address) -> io::Result<UdpSocket> {
    let sock = make_socket(domain)?;
    sock.bind(&SocketAddr::from(*addr).into())?;
    let sock: UdpSocket = sock.into();
    enable_recv_metadata(&sock, addr.is_ipv6())?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

fn join_asm(sock: &UdpSocket, group: &Address, iface: u32) -> io::Result<()> {
    let sock = SockRef::from(sock);
    match group.ip() {
        IpAddr::V4(ip) => {
            sock.join_multicast_v4_n(&ip, &socket2::InterfaceIndexOrAddress::Index(iface))
        }
        IpAddr::V6(ip) => sock.join_multicast_v6(&ip, iface),
    }
}

/// Asks the kernel for received-TTL and arrival-timestamp ancillary data.
fn enable_recv_metadata(sock: &UdpSocket, v6: bool) -> io::Result<()> {
    let fd = sock.as_raw_fd();
    if v6 {
        set_cint_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
    } else {
        set_cint_opt(fd, libc::IPPROTO_IP, libc::IP_RECVTTL, 1)?;
    }
    set_cint_opt(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMP, 1)
}

fn set_cint_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, val: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Learns which local address the kernel would source traffic to `remote`
/// from, via a throwaway connected socket.
fn discover_unicast(remote: &Address) -> io::Result<Address> {
    let bind = if remote.is_ipv6() {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
    };
    let probe = UdpSocket::bind(bind)?;
    probe.connect(SocketAddr::from(*remote))?;
    Ok(probe.local_addr()?.into())
}

fn to_storage(addr: &Address) -> libc::sockaddr_storage {
    let mut stor: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(ip.octets()),
            };
            unsafe {
                std::ptr::write(&mut stor as *mut _ as *mut libc::sockaddr_in, sin);
            }
        }
        IpAddr::V6(ip) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = addr.port().to_be();
            sin6.sin6_addr.s6_addr = ip.octets();
            unsafe {
                std::ptr::write(&mut stor as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
        }
    }
    stor
}

fn from_storage(stor: &libc::sockaddr_storage) -> Option<Address> {
    match stor.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(stor as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(Address::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(stor as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(Address::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// This machine's hostname, the default beacon name.
pub fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

/// Resolves an interface name to its index for multicast joins.
pub fn interface_index(name: &str) -> io::Result<u32> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("interface '{}' not found", name),
        ));
    }
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_roundtrip() {
        for s in ["10.1.2.3/5000", "2001:db8::7/6000"] {
            let addr: Address = s.parse().unwrap();
            let stor = to_storage(&addr);
            assert_eq!(from_storage(&stor), Some(addr));
        }
    }

    #[test]
    fn test_unicast_send_receive_loopback() {
        let cfg = BeaconConfig {
            name: "sock-test".into(),
            listen: vec!["127.0.0.1/0".parse().unwrap()],
            unicast: "127.0.0.1/0".parse().unwrap(),
            ..BeaconConfig::default()
        };
        let (mut transport, unicast) = UdpTransport::new(&cfg).unwrap();
        assert!(!unicast.is_unspecified());

        let listen_addr: Address = transport.listeners[0].sock.local_addr().unwrap().into();
        transport.send(b"hello beacon", &listen_addr).unwrap();

        let ready = transport.poll(2000).unwrap();
        assert_eq!(ready.as_slice(), &[0]);
        assert_eq!(transport.kind(0), SocketKind::Report);

        let dgram = transport.recv(0).unwrap().expect("datagram expected");
        assert_eq!(dgram.payload, b"hello beacon");
        assert_eq!(dgram.from.strip_port(), unicast.strip_port());
        assert!(dgram.timestamp > 0);

        // Drained.
        assert!(transport.recv(0).unwrap().is_none());
    }

    #[test]
    fn test_hostname_is_available() {
        assert!(hostname().is_some());
    }
}
