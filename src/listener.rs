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

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures::{
    future::{self, BoxFuture, Either},
    stream, Stream,
};
use futures_timer::Delay;
use libp2p_identity::PeerId;

use crate::{
    addr,
    connection::Connection,
    multiaddr::Multiaddr,
    network::{self, CapableConnection, Direction, ResourceError, ResourceManager, Upgrader},
    provider::{Connection as ProviderConnection, Multiplexer},
    stream_conn::StreamConn,
    Error,
};

/// Why a single inbound attempt was discarded.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("failed to accept the upgrade stream")]
    AcceptStream(#[source] io::Error),
    #[error("resource manager refused the connection")]
    Scope(#[source] ResourceError),
    #[error("upgrade failed")]
    Upgrade(#[source] io::Error),
    #[error("not established within {0:?}")]
    Timeout(Duration),
}

/// Accepts inbound connections on one local UDP socket.
///
/// Every accepted connection is served by the listener's multiplexer, so
/// closing the listener closes all of them.
pub struct Listener<M: Multiplexer> {
    multiplexer: M,
    local_addr: SocketAddr,
    multiaddr: Multiaddr,
    local_peer: PeerId,
    upgrader: Option<Arc<dyn Upgrader>>,
    resource_manager: Arc<dyn ResourceManager>,
    handshake_timeout: Duration,
}

impl<M: Multiplexer> Listener<M> {
    pub(crate) fn new(
        multiplexer: M,
        local_addr: SocketAddr,
        multiaddr: Multiaddr,
        local_peer: PeerId,
        upgrader: Option<Arc<dyn Upgrader>>,
        resource_manager: Arc<dyn ResourceManager>,
        handshake_timeout: Duration,
    ) -> Self {
        Listener {
            multiplexer,
            local_addr,
            multiaddr,
            local_peer,
            upgrader,
            resource_manager,
            handshake_timeout,
        }
    }

    /// Waits for the next inbound connection that is fully established.
    ///
    /// Attempts failing after the substrate connection exists, or not
    /// established within the handshake timeout, are closed, logged and
    /// discarded. The only error returned is [`Error::Multiplexer`], once the
    /// listener is closed; it is returned on every later call as well.
    ///
    /// Dropping the returned future closes the connection being set up.
    pub async fn accept(&self) -> Result<Box<dyn CapableConnection>, Error> {
        loop {
            let connection = self
                .multiplexer
                .accept()
                .await
                .map_err(Error::Multiplexer)?;
            let remote = connection.remote_addr();
            let pending = Pending(Some(connection.clone()));

            let attempt = future::select(
                Box::pin(self.establish(connection)),
                Delay::new(self.handshake_timeout),
            );
            let result = match attempt.await {
                Either::Left((result, _)) => result,
                Either::Right(_) => Err(AttemptError::Timeout(self.handshake_timeout)),
            };

            match result {
                Ok(connection) => {
                    pending.established();
                    return Ok(connection);
                }
                Err(error) => {
                    tracing::debug!(%remote, %error, "Discarding inbound connection");
                }
            }
        }
    }

    async fn establish(
        &self,
        connection: M::Connection,
    ) -> Result<Box<dyn CapableConnection>, AttemptError> {
        let remote_multiaddr = addr::to_udx_multiaddr(connection.remote_addr());

        let Some(upgrader) = &self.upgrader else {
            let remote_peer = connection.remote_peer_id();
            let connection: Connection<M> = Connection::new(
                connection,
                self.local_peer,
                self.multiaddr.clone(),
                remote_multiaddr,
            )
            .with_remote_peer(remote_peer);
            return Ok(Box::new(connection));
        };

        // On failure the connection is closed by the caller's `Pending` guard.
        let stream = connection
            .accept_stream()
            .await
            .map_err(AttemptError::AcceptStream)?;
        let raw: StreamConn<M> = StreamConn::new(
            stream,
            connection,
            self.multiaddr.clone(),
            remote_multiaddr.clone(),
        );

        let scope = self
            .resource_manager
            .open_connection(Direction::Inbound, false, &remote_multiaddr)
            .map_err(AttemptError::Scope)?;

        upgrader
            .upgrade(Box::new(raw), Direction::Inbound, None, scope)
            .await
            .map_err(AttemptError::Upgrade)
    }

    /// Closes the multiplexer and with it every connection accepted so far.
    pub fn close(&self) -> Result<(), Error> {
        tracing::debug!(address=%self.multiaddr, "Closing listener");
        self.multiplexer.close().map_err(Error::Multiplexer)
    }

    /// The bound UDP socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address peers dial to reach this listener, with the port actually bound.
    pub fn multiaddr(&self) -> &Multiaddr {
        &self.multiaddr
    }

    /// The accept loop as a stream. It yields the terminal error once and then ends.
    pub fn incoming(
        &self,
    ) -> impl Stream<Item = Result<Box<dyn CapableConnection>, Error>> + Send + '_ {
        stream::unfold(Some(self), |listener| async move {
            let listener = listener?;
            match listener.accept().await {
                Ok(connection) => Some((Ok(connection), Some(listener))),
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}

/// Closes an inbound connection unless it was established.
struct Pending<C: ProviderConnection>(Option<C>);

impl<C: ProviderConnection> Pending<C> {
    fn established(mut self) {
        self.0 = None;
    }
}

impl<C: ProviderConnection> Drop for Pending<C> {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            if let Err(error) = connection.close() {
                tracing::trace!(%error, "Closing discarded inbound connection failed");
            }
        }
    }
}

impl<M: Multiplexer> network::Listener for Listener<M> {
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn CapableConnection>, Error>> {
        Box::pin(Listener::accept(self))
    }

    fn close(&self) -> Result<(), Error> {
        Listener::close(self)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn multiaddr(&self) -> &Multiaddr {
        &self.multiaddr
    }
}
