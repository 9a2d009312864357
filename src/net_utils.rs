//! Shared network interface and socket utilities.
//!
//! Provides a cross-platform way to enumerate local IPv4 network interfaces,
//! pick the address a host advertises, and open the UDP sockets the
//! discovery protocol uses.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// A local IPv4 network interface with its IP address and subnet mask.
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Enumerate all local IPv4 network interfaces, excluding loopback.
///
/// Returns an empty vec on failure or on unsupported platforms (Windows),
/// allowing callers to fall back to `INADDR_ANY` group membership.
pub fn get_local_interfaces() -> io::Result<Vec<NetworkInterface>> {
    get_local_interfaces_impl()
}

/// The address this host advertises when no explicit endpoint is configured.
///
/// First non-loopback IPv4 interface, or `127.0.0.1` when there is none.
pub fn primary_ipv4() -> Ipv4Addr {
    get_local_interfaces()
        .ok()
        .and_then(|interfaces| interfaces.first().map(|iface| iface.ip))
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Bind a UDP socket with address reuse enabled.
///
/// Every discovery participant on a host shares the same well-known ports,
/// so sockets must tolerate a sibling bound to the same address.
pub fn bind_reusable(
    address: Ipv4Addr,
    port: u16,
    read_timeout: Option<Duration>,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // BSD kernels only share a UDP port between sockets that all set SO_REUSEPORT.
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(address, port)))?;
    socket.set_read_timeout(read_timeout)?;
    Ok(UdpSocket::from(socket))
}

/// Open a short-lived socket able to send to a multicast group.
pub fn multicast_sender() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
    Ok(UdpSocket::from(socket))
}

/// Join `group` on every local interface, falling back to `INADDR_ANY`.
///
/// Returns the number of interfaces that joined.
pub fn join_multicast_all(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<usize> {
    let mut joined = 0;
    if let Ok(interfaces) = get_local_interfaces() {
        for iface in &interfaces {
            match socket.join_multicast_v4(&group, &iface.ip) {
                Ok(()) => joined += 1,
                Err(e) => log::debug!("net: failed to join {} on {}: {}", group, iface.ip, e),
            }
        }
    }
    if joined == 0 {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        joined = 1;
    }
    Ok(joined)
}

#[cfg(unix)]
fn get_local_interfaces_impl() -> io::Result<Vec<NetworkInterface>> {
    let mut interfaces = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;
            current = ifa.ifa_next;

            if ifa.ifa_addr.is_null() || ifa.ifa_netmask.is_null() {
                continue;
            }

            let family = (*ifa.ifa_addr).sa_family as i32;
            if family != libc::AF_INET {
                continue;
            }

            let addr = ifa.ifa_addr as *const libc::sockaddr_in;
            let ip_bytes = (*addr).sin_addr.s_addr.to_ne_bytes();
            let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);

            if ip.is_loopback() {
                continue;
            }

            let mask_addr = ifa.ifa_netmask as *const libc::sockaddr_in;
            let mask_bytes = (*mask_addr).sin_addr.s_addr.to_ne_bytes();
            let netmask =
                Ipv4Addr::new(mask_bytes[0], mask_bytes[1], mask_bytes[2], mask_bytes[3]);

            interfaces.push(NetworkInterface { ip, netmask });
        }

        libc::freeifaddrs(ifaddrs);
    }

    Ok(interfaces)
}

#[cfg(windows)]
fn get_local_interfaces_impl() -> io::Result<Vec<NetworkInterface>> {
    // TODO: enumerate adapters with GetAdaptersAddresses; until then the
    // multicast join falls back to INADDR_ANY.
    Ok(vec![])
}
