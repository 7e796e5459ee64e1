//! Owned file descriptor with the option setters and bind/listen/accept
//! surface the rest of the crate builds on.

use std::io;
use std::mem;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::net::inet_address::InetAddress;
use crate::syscall;

/// A non-blocking, close-on-exec TCP socket. Closes its fd exactly once,
/// on drop.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec IPv4 TCP socket.
    pub fn new_tcp() -> io::Result<Socket> {
        let raw = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0
        ))?;
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_sock_opt(&self, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
        let value: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;
        Ok(())
    }

    pub fn bind(&self, addr: &InetAddress) -> io::Result<()> {
        let (raw, len) = to_sockaddr(addr.to_ip_port_v4());
        syscall!(bind(self.as_raw_fd(), &raw as *const _ as *const libc::sockaddr, len))?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), backlog))?;
        Ok(())
    }

    /// Single non-blocking, close-on-exec `accept4`. Returns `WouldBlock`
    /// when nothing is pending.
    pub fn accept(&self) -> io::Result<(Socket, InetAddress)> {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let raw = syscall!(accept4(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let peer = from_sockaddr(&storage);
        Ok((Socket { fd }, peer))
    }

    /// Half-close the write side (`SHUT_WR`).
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR))?;
        Ok(())
    }

    /// A single non-blocking `write(2)`, used for the "attempt one direct
    /// write before buffering" fast path.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(
            self.as_raw_fd(),
            data.as_ptr() as *const libc::c_void,
            data.len(),
        ))?;
        Ok(n as usize)
    }

    pub fn local_addr(&self) -> io::Result<InetAddress> {
        let mut storage: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        syscall!(getsockname(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        Ok(from_sockaddr(&storage))
    }

    /// The pending error recorded on this socket (`SO_ERROR`), logged by the
    /// connection error path.
    pub fn socket_error(&self) -> io::Result<i32> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        Ok(err)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn to_sockaddr(addr: SocketAddrV4) -> (libc::sockaddr_in, libc::socklen_t) {
    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    };
    (sockaddr, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
}

fn from_sockaddr(raw: &libc::sockaddr_in) -> InetAddress {
    let ip = std::net::Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
    let port = u16::from_be(raw.sin_port);
    SocketAddrV4::new(ip, port).into()
}

impl InetAddress {
    fn to_ip_port_v4(&self) -> SocketAddrV4 {
        match self.to_socket_addr() {
            std::net::SocketAddr::V4(v4) => v4,
            std::net::SocketAddr::V6(_) => unreachable!("reactor-core is IPv4-only"),
        }
    }
}
