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

use std::io;

use futures::{future::BoxFuture, FutureExt, TryFutureExt};
use libp2p_identity::{PeerId, PublicKey};

use crate::{
    multiaddr::Multiaddr,
    network::{
        CapableConnection, ConnErrorCode, ConnectionScope, ConnectionState, MuxedStream,
        NullScope,
    },
    provider::{ConnState, Connection as _, Multiplexer},
    stream::Stream,
    TRANSPORT_NAME,
};

/// A substrate connection that already carries security and multiplexing,
/// exposed directly to the host stack.
pub struct Connection<M: Multiplexer> {
    inner: M::Connection,
    /// Set for dialed connections, which own the multiplexer created for them.
    multiplexer: Option<M>,
    local_peer: PeerId,
    remote_peer: Option<PeerId>,
    remote_public_key: Option<PublicKey>,
    local_multiaddr: Multiaddr,
    remote_multiaddr: Multiaddr,
    scope: Option<Box<dyn ConnectionScope>>,
}

impl<M: Multiplexer> Connection<M> {
    pub(crate) fn new(
        inner: M::Connection,
        local_peer: PeerId,
        local_multiaddr: Multiaddr,
        remote_multiaddr: Multiaddr,
    ) -> Self {
        Connection {
            inner,
            multiplexer: None,
            local_peer,
            remote_peer: None,
            remote_public_key: None,
            local_multiaddr,
            remote_multiaddr,
            scope: None,
        }
    }

    pub(crate) fn with_remote_peer(mut self, remote_peer: Option<PeerId>) -> Self {
        self.remote_peer = remote_peer;
        self
    }

    pub(crate) fn with_multiplexer(mut self, multiplexer: M) -> Self {
        self.multiplexer = Some(multiplexer);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_scope(mut self, scope: Box<dyn ConnectionScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    fn boxed_stream(
        future: BoxFuture<'static, io::Result<<M::Connection as crate::provider::Connection>::Stream>>,
    ) -> BoxFuture<'static, io::Result<Box<dyn MuxedStream>>> {
        future
            .map_ok(|stream| Box::new(Stream::new(stream)) as Box<dyn MuxedStream>)
            .boxed()
    }

    fn release(&self) -> io::Result<()> {
        if let Some(scope) = &self.scope {
            scope.done();
        }
        match &self.multiplexer {
            Some(multiplexer) => multiplexer.close(),
            None => Ok(()),
        }
    }
}

impl<M: Multiplexer> CapableConnection for Connection<M> {
    fn open_stream(&self) -> BoxFuture<'_, io::Result<Box<dyn MuxedStream>>> {
        Self::boxed_stream(self.inner.open_stream())
    }

    fn accept_stream(&self) -> BoxFuture<'_, io::Result<Box<dyn MuxedStream>>> {
        Self::boxed_stream(self.inner.accept_stream())
    }

    fn close(&self) -> io::Result<()> {
        let result = self.inner.close();
        result.and(self.release())
    }

    fn close_with_error(&self, code: ConnErrorCode) -> io::Result<()> {
        let result = self.inner.close_with_error(code);
        result.and(self.release())
    }

    fn is_closed(&self) -> bool {
        self.inner.state() == ConnState::Closed
    }

    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn remote_peer(&self) -> Option<PeerId> {
        self.remote_peer
    }

    fn remote_public_key(&self) -> Option<&PublicKey> {
        self.remote_public_key.as_ref()
    }

    fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_multiaddr
    }

    fn scope(&self) -> &dyn ConnectionScope {
        match &self.scope {
            Some(scope) => scope.as_ref(),
            None => &NullScope,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            transport: TRANSPORT_NAME,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::UdpSocket,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use futures::{future, AsyncReadExt, AsyncWriteExt};
    use libp2p_identity::Keypair;

    use super::*;
    use crate::{
        addr::to_udx_multiaddr,
        network::ResourceError,
        provider::{
            memory::{MemoryMultiplexer, MemoryProvider},
            Provider,
        },
    };

    struct CountingScope(Arc<AtomicUsize>);

    impl ConnectionScope for CountingScope {
        fn set_peer(&self, _: PeerId) -> Result<(), ResourceError> {
            Ok(())
        }

        fn done(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Returns a dialed and an accepted connection, plus the listening
    /// multiplexer which has to outlive the accepted one.
    async fn pair(
        provider: &MemoryProvider,
    ) -> (
        Connection<MemoryMultiplexer>,
        Connection<MemoryMultiplexer>,
        MemoryMultiplexer,
    ) {
        let dialer = provider
            .new_multiplexer(UdpSocket::bind("127.0.0.1:0").unwrap())
            .unwrap();
        let listener = provider
            .new_multiplexer(UdpSocket::bind("127.0.0.1:0").unwrap())
            .unwrap();
        let dialer_addr = dialer.local_addr().unwrap();
        let listener_addr = listener.local_addr().unwrap();

        let (outbound, inbound) =
            future::join(dialer.dial(listener_addr), listener.accept()).await;
        let dialer_peer = Keypair::generate_ed25519().public().to_peer_id();
        let listener_peer = Keypair::generate_ed25519().public().to_peer_id();

        let outbound = Connection::new(
            outbound.unwrap(),
            dialer_peer,
            to_udx_multiaddr(dialer_addr),
            to_udx_multiaddr(listener_addr),
        )
        .with_remote_peer(Some(listener_peer))
        .with_multiplexer(dialer);
        let inbound = Connection::new(
            inbound.unwrap(),
            listener_peer,
            to_udx_multiaddr(listener_addr),
            to_udx_multiaddr(dialer_addr),
        );
        (outbound, inbound, listener)
    }

    #[tokio::test]
    async fn streams_open_and_accept() {
        let provider = MemoryProvider::new();
        let (outbound, inbound, _listener) = pair(&provider).await;

        let mut x = outbound.open_stream().await.unwrap();
        x.write_all(b"ping").await.unwrap();
        x.close_write().unwrap();

        let mut y = inbound.accept_stream().await.unwrap();
        let mut buf = Vec::new();
        y.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }

    #[tokio::test]
    async fn identity_and_addresses() {
        let provider = MemoryProvider::new();
        let (outbound, inbound, _listener) = pair(&provider).await;

        assert_eq!(outbound.remote_peer(), Some(inbound.local_peer()));
        assert_eq!(inbound.remote_peer(), None);
        assert!(outbound.remote_public_key().is_none());
        assert_eq!(outbound.local_multiaddr(), inbound.remote_multiaddr());
        assert_eq!(outbound.remote_multiaddr(), inbound.local_multiaddr());
        assert_eq!(outbound.connection_state().transport, "udx");
    }

    #[tokio::test]
    async fn scope_falls_back_to_null_and_is_released_on_close() {
        let provider = MemoryProvider::new();
        let (outbound, inbound, _listener) = pair(&provider).await;

        // Without a scope the null scope is handed out.
        inbound.scope().done();
        assert!(inbound.scope().set_peer(outbound.local_peer()).is_ok());

        let released = Arc::new(AtomicUsize::new(0));
        let inbound = inbound.with_scope(Box::new(CountingScope(released.clone())));
        inbound.close().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(inbound.is_closed());
        assert!(outbound.is_closed());
    }

    #[tokio::test]
    async fn closing_a_dialed_connection_closes_its_multiplexer() {
        let provider = MemoryProvider::new();
        let (outbound, _inbound, _listener) = pair(&provider).await;
        assert_eq!(provider.open_multiplexers(), 2);

        outbound.close_with_error(3).unwrap();
        assert!(outbound.is_closed());
        assert_eq!(provider.open_multiplexers(), 1);
        assert!(outbound.open_stream().await.is_err());
    }
}
