// Copyright 2025 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use futures::future::BoxFuture;
use libp2p_identity::{Keypair, PeerId};
use socket2::{Domain, Socket, Type};

use crate::{
    addr::{self, P_UDX},
    connection::Connection,
    listener::Listener,
    multiaddr::Multiaddr,
    network::{
        self, CapableConnection, Direction, NullResourceManager, RawConnection, ResourceManager,
        Upgrader,
    },
    provider::{Connection as _, Multiplexer, Provider},
    stream_conn::StreamConn,
    Error,
};

/// The UDX transport, generic over the substrate [`Provider`].
///
/// Cheap to share: every field is read-only after construction, so concurrent
/// dials and listens may use the same transport.
pub struct GenTransport<P: Provider> {
    keypair: Keypair,
    local_peer: PeerId,
    provider: P,
    upgrader: Option<Arc<dyn Upgrader>>,
    resource_manager: Arc<dyn ResourceManager>,
    handshake_timeout: Duration,
}

/// Time an inbound attempt gets from substrate connection to established
/// connection.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

impl<P: Provider> GenTransport<P> {
    /// Creates a transport without an upgrader, admitting every connection.
    pub fn new(keypair: Keypair, provider: P) -> Self {
        addr::register_protocol();
        let local_peer = keypair.public().to_peer_id();
        Self {
            keypair,
            local_peer,
            provider,
            upgrader: None,
            resource_manager: Arc::new(NullResourceManager),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Runs `upgrader` over stream 0 of every connection instead of exposing
    /// substrate connections directly.
    pub fn with_upgrader(mut self, upgrader: Arc<dyn Upgrader>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    /// Admission control consulted before every upgrade.
    pub fn with_resource_manager(mut self, resource_manager: Arc<dyn ResourceManager>) -> Self {
        self.resource_manager = resource_manager;
        self
    }

    /// Bounds how long a listener waits for an inbound attempt to open the
    /// upgrade stream and finish the upgrade. Expired attempts are closed.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Whether connections go through an external upgrader.
    pub fn upgrades_connections(&self) -> bool {
        self.upgrader.is_some()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Dials `addr`.
    ///
    /// `remote_peer` is handed to the upgrader. Without an upgrader it is only
    /// reported as the remote identity if the substrate does not authenticate
    /// the remote itself.
    ///
    /// Dropping the returned future closes the socket, the multiplexer and
    /// the connection opened so far.
    pub async fn dial(
        &self,
        addr: &Multiaddr,
        remote_peer: Option<PeerId>,
    ) -> Result<Box<dyn CapableConnection>, Error> {
        let remote = self.remote_socket_addr(addr)?;

        let socket = create_socket(local_bind_addr(&remote)).map_err(Error::Bind)?;
        let multiplexer = CloseOnDrop(Some(
            self.provider.new_multiplexer(socket).map_err(Error::Bind)?,
        ));
        let local_multiaddr = addr::to_udx_multiaddr(multiplexer.local_addr().map_err(Error::Bind)?);

        tracing::debug!(address=%addr, "Dialing address");
        let connection = multiplexer.dial(remote).await.map_err(Error::Dial)?;

        let Some(upgrader) = &self.upgrader else {
            let remote_peer = connection.remote_peer_id().or(remote_peer);
            let connection = Connection::new(connection, self.local_peer, local_multiaddr, addr.clone())
                .with_remote_peer(remote_peer)
                .with_multiplexer(multiplexer.into_inner());
            return Ok(Box::new(connection));
        };

        let stream = connection.open_stream().await.map_err(|error| {
            let _ = connection.close();
            Error::Dial(error)
        })?;
        let mut raw = StreamConn::new(stream, connection.clone(), local_multiaddr, addr.clone())
            .with_multiplexer(multiplexer.into_inner());

        let scope = match self
            .resource_manager
            .open_connection(Direction::Outbound, false, addr)
        {
            Ok(scope) => scope,
            Err(error) => {
                tracing::debug!(address=%addr, %error, "Resource manager refused outbound connection");
                let _ = raw.close();
                return Err(Error::Resource(error));
            }
        };

        match upgrader
            .upgrade(Box::new(raw), Direction::Outbound, remote_peer, scope)
            .await
        {
            Ok(connection) => Ok(connection),
            Err(error) => {
                tracing::debug!(address=%addr, %error, "Failed to upgrade outbound connection");
                let _ = connection.close();
                Err(Error::Upgrade(error))
            }
        }
    }

    /// Starts listening on `addr`.
    ///
    /// Port 0 picks an ephemeral port. The resulting [`Listener::multiaddr`]
    /// carries the port that was actually bound.
    pub fn listen(&self, addr: &Multiaddr) -> Result<Listener<P::Multiplexer>, Error> {
        if !addr::is_udx_multiaddr(addr) {
            return Err(addr::Error::NotUdx(addr.clone()).into());
        }
        let socket_addr = addr::from_udx_multiaddr(addr)?;

        let socket = create_socket(socket_addr).map_err(Error::Bind)?;
        let multiplexer = CloseOnDrop(Some(
            self.provider.new_multiplexer(socket).map_err(Error::Bind)?,
        ));
        let local_addr = multiplexer.local_addr().map_err(Error::Bind)?;
        let multiaddr = addr::to_udx_multiaddr(local_addr);
        tracing::debug!(address=%multiaddr, "Listening");

        Ok(Listener::new(
            multiplexer.into_inner(),
            local_addr,
            multiaddr,
            self.local_peer,
            self.upgrader.clone(),
            self.resource_manager.clone(),
            self.handshake_timeout,
        ))
    }

    /// Whether `addr` is a UDX address this transport could dial: it carries
    /// the `/udx` marker and decodes to a UDP endpoint.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr::is_udx_multiaddr(addr) && addr::from_udx_multiaddr(addr).is_ok()
    }

    fn remote_socket_addr(&self, addr: &Multiaddr) -> Result<SocketAddr, Error> {
        if !addr::is_udx_multiaddr(addr) {
            return Err(addr::Error::NotUdx(addr.clone()).into());
        }
        let socket_addr = addr::from_udx_multiaddr(addr)?;
        let socket_addr = SocketAddr::new(socket_addr.ip().to_canonical(), socket_addr.port());

        if socket_addr.port() == 0 || socket_addr.ip().is_unspecified() {
            tracing::debug!(address=%addr, "Refusing to dial an unroutable endpoint");
            return Err(Error::Resolution(socket_addr));
        }
        Ok(socket_addr)
    }
}

#[cfg(feature = "quic")]
impl GenTransport<crate::provider::quic::QuicProvider> {
    /// Creates a transport over the QUIC substrate with the default [`crate::Config`].
    pub fn quic(keypair: Keypair) -> io::Result<Self> {
        let config = crate::Config::new(&keypair);
        let handshake_timeout = config.handshake_timeout;
        let provider = crate::provider::quic::QuicProvider::new(config)?;
        Ok(Self::new(keypair, provider).with_handshake_timeout(handshake_timeout))
    }
}

impl<P: Provider> network::Transport for GenTransport<P> {
    fn dial(
        &self,
        addr: Multiaddr,
        remote_peer: Option<PeerId>,
    ) -> BoxFuture<'_, Result<Box<dyn CapableConnection>, Error>> {
        Box::pin(async move { GenTransport::dial(self, &addr, remote_peer).await })
    }

    fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn network::Listener>, Error> {
        let listener = GenTransport::listen(self, addr)?;
        Ok(Box::new(listener))
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        GenTransport::can_dial(self, addr)
    }

    fn protocols(&self) -> &[u32] {
        &[P_UDX]
    }

    fn proxy(&self) -> bool {
        false
    }
}

/// Closes the multiplexer unless ownership is taken with [`CloseOnDrop::into_inner`].
struct CloseOnDrop<M: Multiplexer>(Option<M>);

impl<M: Multiplexer> CloseOnDrop<M> {
    fn into_inner(mut self) -> M {
        match self.0.take() {
            Some(multiplexer) => multiplexer,
            None => unreachable!("the multiplexer is only taken by `into_inner`"),
        }
    }
}

impl<M: Multiplexer> Deref for CloseOnDrop<M> {
    type Target = M;

    fn deref(&self) -> &M {
        match &self.0 {
            Some(multiplexer) => multiplexer,
            None => unreachable!("the multiplexer is only taken by `into_inner`"),
        }
    }
}

impl<M: Multiplexer> Drop for CloseOnDrop<M> {
    fn drop(&mut self) {
        if let Some(multiplexer) = self.0.take() {
            if let Err(error) = multiplexer.close() {
                tracing::debug!(%error, "Failed to close multiplexer");
            }
        }
    }
}

/// The local address to bind for reaching `remote`: any interface, ephemeral
/// port, same address family as the remote.
fn local_bind_addr(remote: &SocketAddr) -> SocketAddr {
    match remote.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn create_socket(socket_addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(socket_addr),
        Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    if socket_addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&socket_addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
