//! `TcpConnection`: the state machine for one accepted socket, owned by
//! exactly one worker loop.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{read_fd_raw, Buffer};
use crate::channel::EventChannel;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Default threshold, in bytes of unsent data in the output buffer, above
/// which `high_water_mark_callback` fires.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

pub type ConnectionCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Box<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One accepted connection. Always accessed through an `Arc` so callbacks
/// handed off across the loop boundary can keep it alive.
pub struct TcpConnection {
    name: String,
    event_loop: Arc<EventLoop>,
    socket: OwnedFd,
    channel: Arc<Mutex<EventChannel>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    reading: Mutex<bool>,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: usize,
    high_water_crossed: Mutex<bool>,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        Self::with_high_water_mark(event_loop, name, fd, local_addr, peer_addr, DEFAULT_HIGH_WATER_MARK)
    }

    pub fn with_high_water_mark(
        event_loop: Arc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        high_water_mark: usize,
    ) -> Arc<Self> {
        let channel = Arc::new(Mutex::new(EventChannel::new(fd)));
        Arc::new(TcpConnection {
            name,
            event_loop,
            socket: unsafe { OwnedFd::from_raw_fd(fd) },
            channel,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            reading: Mutex::new(false),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark,
            high_water_crossed: Mutex::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn owning_loop(&self) -> Arc<EventLoop> {
        self.event_loop.clone()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.lock().connection = Some(Box::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().message = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.lock().write_complete = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().high_water_mark = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.lock().close = Some(Box::new(cb));
    }

    /// Wires this connection's channel callbacks and moves it into
    /// `connected`. Must run on the owning loop.
    pub fn connect_established(self: &Arc<Self>) {
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        self.channel.lock().tie(self);
        {
            let this = self.clone();
            self.channel.lock().set_read_callback(move |t| this.handle_read(t));
        }
        {
            let this = self.clone();
            self.channel.lock().set_write_callback(move || this.handle_write());
        }
        {
            let this = self.clone();
            self.channel.lock().set_close_callback(move || this.handle_close());
        }
        {
            let this = self.clone();
            self.channel.lock().set_error_callback(move || this.handle_error());
        }

        let fd = self.fd();
        self.event_loop.add_channel(fd, self.channel.clone());
        self.channel.lock().enable_reading();
        *self.reading.lock() = true;
        let _ = self.event_loop.update_channel(fd);

        if let Some(cb) = &self.callbacks.lock().connection {
            cb(self);
        }
    }

    /// Removes this connection's channel from the loop. Must run on the
    /// owning loop, after `handle_close` has already run.
    pub fn connect_destroyed(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.lock().disable_all();
            if let Some(cb) = &self.callbacks.lock().connection {
                cb(self);
            }
        }
        let _ = self.event_loop.remove_channel(self.fd());
    }

    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let this = self.clone();
            let owned = data.to_vec();
            self.event_loop.queue_in_loop(move || {
                this.send_in_loop(&owned);
            });
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            log::warn!("giving up on send: connection {} is disconnected", self.name);
            return;
        }

        let mut wrote = 0usize;
        let mut fault = false;
        let channel_is_writing = self.channel.lock().is_writing();
        let output_is_empty = self.output_buffer.lock().readable_bytes() == 0;

        if !channel_is_writing && output_is_empty {
            match write_nonblocking(self.fd(), data) {
                Ok(n) => {
                    wrote = n;
                    if wrote < data.len() {
                        log::trace!("short write on {}, queuing remainder", self.name);
                    } else if let Some(cb) = &self.callbacks.lock().write_complete {
                        let this = self.clone();
                        self.event_loop.queue_in_loop(move || cb(&this));
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    if e.raw_os_error() != Some(libc::EPIPE)
                        && e.raw_os_error() != Some(libc::ECONNRESET)
                    {
                        log::error!("send error on {}: {e}", self.name);
                    }
                    fault = true;
                }
            }
        }

        if !fault && wrote < data.len() {
            let remaining = &data[wrote..];
            let mut out = self.output_buffer.lock();
            let old_len = out.readable_bytes();
            out.append(remaining);
            let new_len = old_len + remaining.len();
            drop(out);

            let mut crossed = self.high_water_crossed.lock();
            if new_len >= self.high_water_mark && old_len < self.high_water_mark && !*crossed {
                *crossed = true;
                if let Some(cb) = &self.callbacks.lock().high_water_mark {
                    let this = self.clone();
                    let total = new_len;
                    self.event_loop.queue_in_loop(move || cb(&this, total));
                }
            }

            if !self.channel.lock().is_writing() {
                self.channel.lock().enable_writing();
                let _ = self.event_loop.update_channel(self.fd());
            }
        }
    }

    /// Half-closes the write side once any pending output has drained.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let this = self.clone();
            self.event_loop.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        if !self.channel.lock().is_writing() {
            unsafe {
                libc::shutdown(self.fd(), libc::SHUT_WR);
            }
        }
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        let n = {
            let mut buf = self.input_buffer.lock();
            read_fd_raw(self.fd(), &mut buf)
        };
        match n {
            Ok(n) if n > 0 => {
                let mut buf = self.input_buffer.lock();
                if let Some(cb) = &self.callbacks.lock().message {
                    cb(self, &mut buf, receive_time);
                }
            }
            Ok(_) => self.handle_close(),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("read error on {}: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.lock().is_writing() {
            return;
        }
        let (result, remaining) = {
            let mut out = self.output_buffer.lock();
            let peek = out.peek().to_vec();
            match write_nonblocking(self.fd(), &peek) {
                Ok(n) => {
                    out.retrieve(n);
                    (Ok(()), out.readable_bytes())
                }
                Err(e) => (Err(e), out.readable_bytes()),
            }
        };

        match result {
            Ok(()) => {
                if remaining == 0 {
                    self.channel.lock().disable_writing();
                    if let Some(cb) = &self.callbacks.lock().write_complete {
                        let this = self.clone();
                        self.event_loop.queue_in_loop(move || cb(&this));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                log::error!("write error on {}: {e}", self.name);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        debug_assert!(matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ));
        self.set_state(ConnState::Disconnected);
        self.channel.lock().disable_all();

        let guard = self.clone();
        if let Some(cb) = &self.callbacks.lock().connection {
            cb(&guard);
        }
        if let Some(cb) = &self.callbacks.lock().close {
            cb(&guard);
        }
    }

    fn handle_error(self: &Arc<Self>) {
        let err = unsafe {
            let mut errno: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            libc::getsockopt(
                self.fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut errno as *mut _ as *mut libc::c_void,
                &mut len,
            );
            errno
        };
        log::error!("TcpConnection [{}] - SO_ERROR = {err}", self.name);
    }
}

fn write_nonblocking(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

impl Write for &TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_nonblocking(self.fd(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_state_round_trips_through_u8() {
        for s in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Disconnecting,
            ConnState::Disconnected,
        ] {
            assert_eq!(ConnState::from(s as u8), s);
        }
    }
}
