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

//! Contracts between a transport and the networking stack that hosts it.
//!
//! The host stack only ever sees trait objects: it dials and listens through a
//! [`Transport`], receives [`CapableConnection`]s, and reads and writes
//! [`MuxedStream`]s. Security and stream-multiplexer negotiation are plugged in
//! through an [`Upgrader`], admission control through a [`ResourceManager`].

use std::{io, net::SocketAddr, time::Instant};

use futures::{future::BoxFuture, AsyncRead, AsyncWrite};
use libp2p_identity::{PeerId, PublicKey};

use crate::{multiaddr::Multiaddr, Error};

/// Error code carried by a stream reset.
pub type StreamErrorCode = u32;

/// Error code carried by an abnormal connection close.
pub type ConnErrorCode = u32;

/// Code sent by [`MuxedStream::reset`] when the caller does not pick one.
pub const INTERNAL_ERROR: StreamErrorCode = 0x1;

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Static information about how a connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Name of the transport that produced the connection.
    pub transport: &'static str,
}

/// A bidirectional byte stream multiplexed over a connection.
pub trait MuxedStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Closes both directions of the stream.
    fn close(&mut self) -> io::Result<()>;

    /// Stops reading. Implementations may treat this as a no-op, so callers
    /// must not rely on it to suppress further inbound data.
    fn close_read(&mut self) -> io::Result<()>;

    /// Signals end-of-output to the remote. The read half remains usable.
    fn close_write(&mut self) -> io::Result<()>;

    /// Aborts the stream with [`INTERNAL_ERROR`].
    fn reset(&mut self) -> io::Result<()>;

    /// Aborts the stream, delivering `code` to the remote.
    fn reset_with_error(&mut self, code: StreamErrorCode) -> io::Result<()>;

    /// Sets both deadlines, stopping at the first failure.
    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;
}

/// A plain two-ended byte connection, handed to an [`Upgrader`].
pub trait RawConnection: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    fn local_multiaddr(&self) -> &Multiaddr;

    fn remote_multiaddr(&self) -> &Multiaddr;

    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    /// Closes the connection and everything underneath it.
    fn close(&mut self) -> io::Result<()>;
}

/// A secured, multiplexed connection to a remote peer.
pub trait CapableConnection: Send + Sync {
    /// Opens a new outbound stream. Dropping the future abandons the attempt.
    fn open_stream(&self) -> BoxFuture<'_, io::Result<Box<dyn MuxedStream>>>;

    /// Waits for the remote to open a stream, or for the connection to close.
    fn accept_stream(&self) -> BoxFuture<'_, io::Result<Box<dyn MuxedStream>>>;

    fn close(&self) -> io::Result<()>;

    fn close_with_error(&self, code: ConnErrorCode) -> io::Result<()>;

    fn is_closed(&self) -> bool;

    fn local_peer(&self) -> PeerId;

    /// Identity of the remote, if it has been established.
    fn remote_peer(&self) -> Option<PeerId>;

    fn remote_public_key(&self) -> Option<&PublicKey>;

    fn local_multiaddr(&self) -> &Multiaddr;

    fn remote_multiaddr(&self) -> &Multiaddr;

    /// Resource scope of the connection, or [`NullScope`] if it has none.
    fn scope(&self) -> &dyn ConnectionScope;

    fn connection_state(&self) -> ConnectionState;
}

/// Accounting handle for the resources attributed to one connection.
pub trait ConnectionScope: Send + Sync {
    /// Attributes the connection to `peer` once its identity is known.
    fn set_peer(&self, peer: PeerId) -> Result<(), ResourceError>;

    /// Releases everything held by the scope.
    fn done(&self);
}

/// A scope that accounts for nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScope;

impl ConnectionScope for NullScope {
    fn set_peer(&self, _: PeerId) -> Result<(), ResourceError> {
        Ok(())
    }

    fn done(&self) {}
}

/// Admission control for new connections.
pub trait ResourceManager: Send + Sync {
    fn open_connection(
        &self,
        direction: Direction,
        transient: bool,
        remote: &Multiaddr,
    ) -> Result<Box<dyn ConnectionScope>, ResourceError>;
}

/// A resource manager that admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResourceManager;

impl ResourceManager for NullResourceManager {
    fn open_connection(
        &self,
        _: Direction,
        _: bool,
        _: &Multiaddr,
    ) -> Result<Box<dyn ConnectionScope>, ResourceError> {
        Ok(Box::new(NullScope))
    }
}

/// Error returned by a [`ResourceManager`] or [`ConnectionScope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("resource limit exceeded")]
    LimitExceeded,
    #[error("resource scope closed")]
    ScopeClosed,
}

/// Security and stream-multiplexer negotiation on top of a [`RawConnection`].
pub trait Upgrader: Send + Sync {
    /// Turns `conn` into a capable connection.
    ///
    /// `remote_peer` is the identity the dialer expects; it is always `None`
    /// for inbound connections. On failure the upgrader drops `conn`, which
    /// closes it.
    fn upgrade(
        &self,
        conn: Box<dyn RawConnection>,
        direction: Direction,
        remote_peer: Option<PeerId>,
        scope: Box<dyn ConnectionScope>,
    ) -> BoxFuture<'static, io::Result<Box<dyn CapableConnection>>>;
}

/// A way to reach and be reached by peers.
pub trait Transport: Send + Sync {
    /// Establishes a connection to `addr`. Dropping the future cancels the
    /// dial and releases everything it opened.
    fn dial(
        &self,
        addr: Multiaddr,
        remote_peer: Option<PeerId>,
    ) -> BoxFuture<'_, Result<Box<dyn CapableConnection>, Error>>;

    fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>, Error>;

    /// Whether this transport can dial `addr`.
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    /// Multiaddr protocol codes handled by this transport.
    fn protocols(&self) -> &[u32];

    /// Whether this transport proxies connections through a third party.
    fn proxy(&self) -> bool;
}

/// Source of inbound connections on a local endpoint.
pub trait Listener: Send + Sync {
    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn CapableConnection>, Error>>;

    fn close(&self) -> Result<(), Error>;

    fn local_addr(&self) -> SocketAddr;

    fn multiaddr(&self) -> &Multiaddr;
}
