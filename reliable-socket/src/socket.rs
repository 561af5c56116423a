//! Datagram channel abstraction.
//!
//! [`DatagramChannel`] is the only thing the connection core knows about the
//! network: send opaque buffers to one fixed peer, receive with a timeout
//! that yields "no data" instead of blocking forever, and release the
//! channel exactly once.  [`UdpChannel`] is the production implementation
//! over `tokio::net::UdpSocket`; [`crate::simulator`] provides a lossy
//! in-memory one for tests.  All protocol logic lives elsewhere; this module
//! owns only byte I/O.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

/// Receive timeout applied before the first RTO is known.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(140);

/// Unreliable, unordered, non-corrupting datagram transport bound to one peer.
///
/// The returned futures are awaited sequentially by a single connection, so
/// implementations need no internal synchronisation.
#[allow(async_fn_in_trait)]
pub trait DatagramChannel {
    /// Address of the peer this channel is bound to, once known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Fix the remote end.  Datagrams from other sources are dropped from
    /// then on.
    async fn connect_remote(&mut self, peer: SocketAddr) -> io::Result<()>;

    /// Send one datagram to the bound peer.
    async fn send(&mut self, datagram: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for one datagram.
    ///
    /// Returns `Ok(None)` when the timeout elapses; `Ok(Some((len, from)))`
    /// with the datagram copied into `buf` otherwise.
    async fn receive_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;

    /// Change the timeout used by [`DatagramChannel::receive`].
    fn set_receive_timeout(&mut self, timeout: Duration);

    fn receive_timeout(&self) -> Duration;

    /// [`DatagramChannel::receive_with_timeout`] with the channel's current
    /// receive timeout.
    async fn receive(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let timeout = self.receive_timeout();
        self.receive_with_timeout(buf, timeout).await
    }

    /// Release the underlying resource.  Every later call fails.
    async fn close(&mut self) -> io::Result<()>;
}

/// A [`DatagramChannel`] over a tokio UDP socket.
#[derive(Debug)]
pub struct UdpChannel {
    /// `None` once the channel has been closed.
    socket: Option<UdpSocket>,
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    local_addr: SocketAddr,
    peer: Option<SocketAddr>,
    receive_timeout: Duration,
}

impl UdpChannel {
    /// Open a socket bound to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        let local_addr = socket.local_addr()?;
        log::debug!("[udp] bound {local_addr}");
        Ok(Self {
            socket: Some(socket),
            local_addr,
            peer: None,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        })
    }

    /// Open a socket on `port` across all local IPv4 interfaces.
    pub async fn bind_port(port: u16) -> io::Result<Self> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
    }

    /// Resolve `host:port`, open an ephemeral socket of the matching family
    /// and bind it to that peer.
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let peer = lookup_host((host, port)).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address found for {host}:{port}"),
            )
        })?;
        let local = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let mut channel = Self::bind(local).await?;
        channel.connect_remote(peer).await?;
        Ok(channel)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel is closed"))
    }
}

impl DatagramChannel for UdpChannel {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    async fn connect_remote(&mut self, peer: SocketAddr) -> io::Result<()> {
        self.socket()?.connect(peer).await?;
        self.peer = Some(peer);
        log::debug!("[udp] {} bound to peer {peer}", self.local_addr);
        Ok(())
    }

    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        let socket = self.socket()?;
        let result = match self.peer {
            Some(_) => socket.send(datagram).await.map(drop),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no peer bound to channel",
            )),
        };
        match result {
            // An ICMP "port unreachable" from an earlier datagram surfaces on
            // the next call; on an unreliable link that is just a lost packet.
            Err(e) if is_lost_datagram(&e) => {
                log::debug!("[udp] send: peer unreachable ({e}); treating as loss");
                Ok(())
            }
            other => other,
        }
    }

    async fn receive_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let socket = self.socket()?;
        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, socket.recv_from(buf)).await {
                Err(_elapsed) => return Ok(None),
                Ok(Ok(received)) => return Ok(Some(received)),
                Ok(Err(e)) if is_lost_datagram(&e) => {
                    log::debug!("[udp] recv: peer unreachable ({e}); waiting on");
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.socket.take() {
            Some(socket) => {
                drop(socket);
                log::debug!("[udp] {} released", self.local_addr);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel already closed",
            )),
        }
    }
}

/// Errors a connected UDP socket reports for datagrams the peer never took.
fn is_lost_datagram(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}
