use mio::net::UdpSocket;
use std::io;
use std::net;
use std::net::{SocketAddr, SocketAddrV6};

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// The operation could not complete right now and should be retried.
    Wait,
    /// The operation failed and the connection cannot continue.
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    MacCheckFailed,
    Malformed,
    PayloadTooLarge,
    ConnectionExists,
    Crypto,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Binds a non-blocking UDP socket. With NAT traversal enabled, IPv6
/// sockets are opened dual-stack (v4-mapped peers included) so traffic from
/// beyond the local topology reaches them regardless of address family.
pub(crate) fn bind_udp_socket(endpoint: SocketAddr, nat_traversal: bool) -> io::Result<UdpSocket> {
    match endpoint {
        SocketAddr::V6(endpoint) if nat_traversal => bind_dual_stack(endpoint),
        _ => UdpSocket::bind(endpoint),
    }
}

#[cfg(target_os = "linux")]
fn bind_dual_stack(endpoint: SocketAddrV6) -> io::Result<UdpSocket> {
    use std::os::unix::io::FromRawFd;

    // The v6-only flag must be cleared before bind, which std and mio offer
    // no hook for; the socket is set up through libc instead
    let fd = unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let close_on_error = |fd: libc::c_int| {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        err
    };

    let off: libc::c_int = 0;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            &off as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(close_on_error(fd));
    }

    let mut address: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    address.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    address.sin6_port = endpoint.port().to_be();
    address.sin6_addr = libc::in6_addr {
        s6_addr: endpoint.ip().octets(),
    };
    address.sin6_flowinfo = endpoint.flowinfo();
    address.sin6_scope_id = endpoint.scope_id();

    let ret = unsafe {
        libc::bind(
            fd,
            &address as *const libc::sockaddr_in6 as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(close_on_error(fd));
    }

    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn bind_dual_stack(endpoint: SocketAddrV6) -> io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::V6(endpoint))
}

/// Outcome of handing one datagram to the network.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendStatus {
    /// The datagram left the socket.
    Sent,
    /// Nothing was sent; the socket buffer is full or the host is temporarily
    /// unreachable. The caller should retry later.
    Deferred,
    /// The datagram exceeds the current path MTU.
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_maps_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);

        let err: NetworkError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, NetworkError::Fatal(ErrorType::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<_, NetworkError>(1).has_failed());
        assert!(!Err::<u8, _>(NetworkError::Wait).has_failed());
        assert!(Err::<u8, _>(NetworkError::Fatal(ErrorType::Malformed)).has_failed());
    }

    #[test]
    fn test_bind_v4_ignores_nat_traversal() {
        let socket = bind_udp_socket("127.0.0.1:0".parse().unwrap(), true).unwrap();

        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_bind_dual_stack() {
        // Only meaningful on hosts with IPv6 enabled
        if UdpSocket::bind("[::1]:0".parse().unwrap()).is_err() {
            return;
        }

        let socket = bind_udp_socket("[::]:0".parse().unwrap(), true).unwrap();
        let local = socket.local_addr().unwrap();

        assert!(local.is_ipv6());
        assert!(local.port() > 0);
    }
}
