//! BSD-style socket façade over the TCP and UDP layers.
//!
//! A [`Socket`] is a thin shell: it keeps its own bound/connected/listening
//! flags and endpoint addresses and delegates the work to the transport
//! picked by its type. `Stream` rides the TCP connection table, `Datagram`
//! the UDP binding table, and `Raw` is reserved; every operation on it
//! reports [`NetError::NotSupported`].
//!
//! Closing is idempotent and also runs on drop, so a socket owns its
//! transport handle for its whole life.

use opal_lib::klog_debug;

use crate::stack::NET_STACK;
use crate::tcp::{self, TcpHandle, TcpState};
use crate::types::{NetError, Port, SockAddr};
use crate::udp::{self, UdpHandle};

/// Transport selector, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketType {
    /// Connection-oriented byte stream (TCP).
    Stream,
    /// Connectionless datagrams (UDP).
    Datagram,
    /// Raw IP access (reserved, unimplemented).
    Raw,
}

/// Recognised socket options. All of them report `NotSupported` in this
/// core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketOption {
    ReuseAddr,
    KeepAlive,
    NoDelay,
    Broadcast,
    SendTimeout,
    RecvTimeout,
    SendBufferSize,
    RecvBufferSize,
}

pub struct Socket {
    socket_type: SocketType,
    bound: bool,
    connected: bool,
    listening: bool,
    local: SockAddr,
    remote: SockAddr,
    tcp: Option<TcpHandle>,
    udp: Option<UdpHandle>,
}

impl Socket {
    pub fn new(socket_type: SocketType) -> Self {
        Self {
            socket_type,
            bound: false,
            connected: false,
            listening: false,
            local: SockAddr::UNSPECIFIED,
            remote: SockAddr::UNSPECIFIED,
            tcp: None,
            udp: None,
        }
    }

    // =========================================================================
    // Connection management
    // =========================================================================

    /// Attach a local address. For datagram sockets this reserves the UDP
    /// port immediately (port 0 picks an ephemeral one); for stream sockets
    /// the TCP side binds at `listen`/`connect` time.
    pub fn bind(&mut self, addr: SockAddr) -> Result<(), NetError> {
        if self.bound {
            return Err(NetError::Error);
        }

        match self.socket_type {
            SocketType::Stream => {
                self.local = addr;
            }
            SocketType::Datagram => {
                let handle = udp::bind(addr.port)?;
                self.local = SockAddr::new(addr.ip, handle.port());
                self.udp = Some(handle);
            }
            SocketType::Raw => return Err(NetError::NotSupported),
        }

        self.bound = true;
        Ok(())
    }

    /// Connect to a remote endpoint.
    ///
    /// Stream sockets emit the SYN and report success once it is on the
    /// wire; readiness shows up as the connection reaching `Established`.
    /// Datagram sockets merely record a default destination (binding an
    /// ephemeral port if needed).
    pub fn connect(&mut self, addr: SockAddr) -> Result<(), NetError> {
        if self.connected {
            return Err(NetError::Error);
        }

        match self.socket_type {
            SocketType::Stream => {
                let handle = tcp::connect(addr)?;
                let info = tcp::connection_info(handle).ok_or(NetError::Error)?;
                self.tcp = Some(handle);
                self.local = info.local;
                self.bound = true;
            }
            SocketType::Datagram => {
                self.ensure_datagram_bound()?;
            }
            SocketType::Raw => return Err(NetError::NotSupported),
        }

        self.remote = addr;
        self.connected = true;
        Ok(())
    }

    /// Start listening on the bound port. The backlog is accepted for API
    /// compatibility and currently ignored.
    pub fn listen(&mut self, _backlog: i32) -> Result<(), NetError> {
        if self.socket_type != SocketType::Stream || !self.bound {
            return Err(NetError::Error);
        }

        let handle = tcp::listen(self.local.port)?;
        self.tcp = Some(handle);
        self.listening = true;
        Ok(())
    }

    /// Collect one completed connection.
    ///
    /// When the listening handle has reached `Established`, it is wrapped in
    /// a fresh socket shell and a new listener is re-armed on the same port.
    /// `Ok(None)` while the handshake is still in flight.
    pub fn accept(&mut self) -> Result<Option<(Socket, SockAddr)>, NetError> {
        if !self.listening {
            return Err(NetError::Error);
        }
        let handle = self.tcp.ok_or(NetError::Error)?;

        if tcp::state(handle) != Some(TcpState::Established) {
            return Ok(None);
        }
        let info = tcp::connection_info(handle).ok_or(NetError::Error)?;

        let child = Socket {
            socket_type: SocketType::Stream,
            bound: true,
            connected: true,
            listening: false,
            local: info.local,
            remote: info.remote,
            tcp: Some(handle),
            udp: None,
        };

        match tcp::listen(self.local.port) {
            Ok(fresh) => self.tcp = Some(fresh),
            Err(e) => {
                klog_debug!("socket: could not re-arm listener on {}: {}", self.local.port, e);
                self.tcp = None;
                self.listening = false;
            }
        }

        Ok(Some((child, info.remote)))
    }

    // =========================================================================
    // Data transfer
    // =========================================================================

    pub fn send(&mut self, data: &[u8]) -> Result<usize, NetError> {
        if !self.connected {
            return Err(NetError::Error);
        }

        match self.socket_type {
            SocketType::Stream => {
                let handle = self.tcp.ok_or(NetError::Error)?;
                tcp::send(handle, data)
            }
            SocketType::Datagram => {
                let remote = self.remote;
                self.send_to(remote, data)
            }
            SocketType::Raw => Err(NetError::NotSupported),
        }
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        match self.socket_type {
            SocketType::Stream => {
                if !self.connected {
                    return Err(NetError::Error);
                }
                let handle = self.tcp.ok_or(NetError::Error)?;
                tcp::recv(handle, buf)
            }
            SocketType::Datagram => match self.recv_from(buf)? {
                Some((n, _)) => Ok(n),
                None => Ok(0),
            },
            SocketType::Raw => Err(NetError::NotSupported),
        }
    }

    /// Datagram send to an explicit destination, binding an ephemeral port
    /// on first use.
    pub fn send_to(&mut self, dest: SockAddr, data: &[u8]) -> Result<usize, NetError> {
        match self.socket_type {
            SocketType::Datagram => {
                self.ensure_datagram_bound()?;
                udp::send(dest, self.local.port, data)?;
                Ok(data.len())
            }
            SocketType::Raw => Err(NetError::NotSupported),
            SocketType::Stream => Err(NetError::Error),
        }
    }

    /// Datagram receive reporting the source endpoint. `Ok(None)` when the
    /// queue is empty.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SockAddr)>, NetError> {
        match self.socket_type {
            SocketType::Datagram => {
                let handle = self.udp.ok_or(NetError::Error)?;
                udp::recv_from(handle, buf)
            }
            SocketType::Raw => Err(NetError::NotSupported),
            SocketType::Stream => Err(NetError::Error),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Half-close. Currently closes the TCP side whatever the direction
    /// flags say.
    pub fn shutdown(&mut self, _read: bool, _write: bool) -> Result<(), NetError> {
        if self.socket_type == SocketType::Stream
            && let Some(handle) = self.tcp.take()
        {
            let _ = tcp::close(handle);
            self.connected = false;
        }
        Ok(())
    }

    /// Tear down the transport handle and reset all flags. Idempotent; also
    /// runs on drop.
    pub fn close(&mut self) {
        match self.socket_type {
            SocketType::Stream => {
                if let Some(handle) = self.tcp.take() {
                    let _ = tcp::close(handle);
                }
            }
            SocketType::Datagram => {
                if let Some(handle) = self.udp.take() {
                    udp::unbind(handle);
                }
            }
            SocketType::Raw => {}
        }

        self.bound = false;
        self.connected = false;
        self.listening = false;
    }

    // =========================================================================
    // Options
    // =========================================================================

    pub fn set_option(&mut self, _option: SocketOption, _value: &[u8]) -> Result<(), NetError> {
        Err(NetError::NotSupported)
    }

    pub fn get_option(&self, _option: SocketOption, _out: &mut [u8]) -> Result<usize, NetError> {
        Err(NetError::NotSupported)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn local_addr(&self) -> SockAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SockAddr {
        self.remote
    }

    /// The underlying TCP handle, when one exists (diagnostics).
    pub fn tcp_handle(&self) -> Option<TcpHandle> {
        self.tcp
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn ensure_datagram_bound(&mut self) -> Result<(), NetError> {
        if self.bound {
            return Ok(());
        }
        let handle = udp::bind(Port(0))?;
        self.local = SockAddr::new(NET_STACK.ipv4(), handle.port());
        self.udp = Some(handle);
        self.bound = true;
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}
