//! `Acceptor`: owns the listening socket and hands accepted descriptors to
//! the server for distribution to worker loops.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::EventChannel;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr) + Send>;

/// Creates a non-blocking, close-on-exec, address-and-port-reusable
/// listening socket bound to `addr`. The original this is grounded on
/// (`Acceptor::createNonblocking`) built the socket but never returned it to
/// its caller; here the descriptor is always returned.
fn create_nonblocking(addr: &SocketAddr) -> io::Result<OwnedFd> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_reuse_addr_port(fd: RawFd) -> io::Result<()> {
    unsafe {
        let one: libc::c_int = 1;
        let ret = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Owns the listening descriptor. Registered on the base loop; on readable,
/// drains the accept queue (non-blocking accept loop) and hands each new
/// descriptor to `new_connection_callback`.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    listen_fd: OwnedFd,
    channel: Arc<Mutex<EventChannel>>,
    listening: bool,
    /// Held open and closed-then-reopened on EMFILE/ENFILE so the accept
    /// queue can keep draining even when the process is out of descriptors.
    idle_fd: Arc<Mutex<Option<OwnedFd>>>,
}

impl Acceptor {
    pub fn new(
        event_loop: Arc<EventLoop>,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Self> {
        let listen_fd = create_nonblocking(&addr).map_err(Error::Io)?;
        if reuse_port {
            set_reuse_addr_port(listen_fd.as_raw_fd()).map_err(Error::Io)?;
        }

        let (sockaddr, len) = sockaddr_from(&addr);
        let ret = unsafe {
            libc::bind(
                listen_fd.as_raw_fd(),
                &sockaddr as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let idle_fd = unsafe {
            let fd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC);
            if fd < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            OwnedFd::from_raw_fd(fd)
        };

        let channel = Arc::new(Mutex::new(EventChannel::new(listen_fd.as_raw_fd())));

        Ok(Acceptor {
            event_loop,
            listen_fd,
            channel,
            listening: false,
            idle_fd: Arc::new(Mutex::new(Some(idle_fd))),
        })
    }

    pub fn set_new_connection_callback(&mut self, cb: impl FnMut(RawFd, SocketAddr) + Send + 'static) {
        let listen_fd = self.listen_fd.as_raw_fd();
        let idle_fd = self.idle_fd.clone();
        let cb = Arc::new(Mutex::new(cb));
        self.channel.lock().set_read_callback(move |_| {
            accept_loop(listen_fd, &cb, &idle_fd);
        });
    }

    pub fn listen(&mut self) -> Result<()> {
        self.listening = true;
        let backlog = 1024;
        let ret = unsafe { libc::listen(self.listen_fd.as_raw_fd(), backlog) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let fd = self.listen_fd.as_raw_fd();
        self.event_loop.add_channel(fd, self.channel.clone());
        self.channel.lock().enable_reading();
        self.event_loop.update_channel(fd)?;
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }
}

fn accept_loop(
    listen_fd: RawFd,
    cb: &Arc<Mutex<dyn FnMut(RawFd, SocketAddr) + Send>>,
    idle_fd_cell: &Arc<Mutex<Option<OwnedFd>>>,
) {
    loop {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };

        if fd >= 0 {
            if let Some(peer) = sockaddr_to_std(&storage) {
                (&mut *cb.lock())(fd, peer);
            } else {
                unsafe {
                    libc::close(fd);
                }
            }
            continue;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => break,
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                log::warn!("accept: descriptor table full, dropping oldest pending connection");
                let mut slot = idle_fd_cell.lock();
                if let Some(idle) = slot.take() {
                    drop(idle); // free one descriptor
                    let fd = unsafe {
                        libc::accept4(listen_fd, std::ptr::null_mut(), std::ptr::null_mut(), 0)
                    };
                    if fd >= 0 {
                        unsafe {
                            libc::close(fd);
                        }
                    }
                    let reopened = unsafe {
                        libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC)
                    };
                    if reopened >= 0 {
                        *slot = Some(unsafe { OwnedFd::from_raw_fd(reopened) });
                    }
                }
                break;
            }
            Some(libc::EINTR) => continue,
            _ => {
                log::error!("accept4 failed: {err}");
                break;
            }
        }
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            Some(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}
