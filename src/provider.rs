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

//! The datagram substrate underneath the transport.
//!
//! A [`Provider`] turns a bound UDP socket into a [`Multiplexer`], which dials
//! and accepts [`Connection`]s over that one socket. Each connection carries
//! independent bidirectional [`Stream`]s.
//!
//! Closing a multiplexer closes every connection it ever produced.

use std::{io, net::SocketAddr, task::Context, time::Instant};

use futures::{future::BoxFuture, AsyncRead, AsyncWrite, FutureExt};
use futures_timer::Delay;
use libp2p_identity::PeerId;

pub mod memory;
#[cfg(feature = "quic")]
pub mod quic;

/// Factory for multiplexers.
pub trait Provider: Send + Sync + 'static {
    type Multiplexer: Multiplexer;

    /// Creates a multiplexer that takes ownership of `socket`.
    ///
    /// Note: The socket is already bound and set to non-blocking.
    fn new_multiplexer(&self, socket: std::net::UdpSocket) -> io::Result<Self::Multiplexer>;
}

/// Many connections sharing one UDP socket.
pub trait Multiplexer: Send + Sync + Unpin + 'static {
    type Connection: Connection;

    /// Establishes a connection to `remote`. Dropping the future abandons the attempt.
    fn dial(&self, remote: SocketAddr) -> BoxFuture<'static, io::Result<Self::Connection>>;

    /// Waits for the next inbound connection.
    ///
    /// Only fails once the multiplexer is closed. Handshakes that fail on the
    /// way in are dropped by the multiplexer and never reported here.
    fn accept(&self) -> BoxFuture<'static, io::Result<Self::Connection>>;

    /// Closes the multiplexer, every connection it produced and the socket.
    fn close(&self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Handle to one substrate connection. Clones refer to the same connection.
pub trait Connection: Clone + Send + Sync + Unpin + 'static {
    type Stream: Stream;

    fn open_stream(&self) -> BoxFuture<'static, io::Result<Self::Stream>>;

    fn accept_stream(&self) -> BoxFuture<'static, io::Result<Self::Stream>>;

    fn close(&self) -> io::Result<()>;

    /// Closes the connection abnormally, delivering `code` to the remote.
    fn close_with_error(&self, code: u32) -> io::Result<()>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    fn state(&self) -> ConnState;

    /// Identity of the remote, if the substrate authenticates peers itself.
    fn remote_peer_id(&self) -> Option<PeerId> {
        None
    }
}

/// A substrate stream.
///
/// Reads report a remote reset as [`io::ErrorKind::ConnectionReset`], an
/// elapsed deadline as [`io::ErrorKind::TimedOut`].
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn close(&mut self) -> io::Result<()>;

    fn close_write(&mut self) -> io::Result<()>;

    fn reset(&mut self, code: u32) -> io::Result<()>;

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;
}

/// Lifecycle state of a substrate [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Closed,
}

/// A read or write deadline on a stream.
#[derive(Default)]
pub(crate) struct Deadline {
    timer: Option<Delay>,
}

impl Deadline {
    /// Replaces the deadline. `None` disables it.
    pub(crate) fn set(&mut self, deadline: Option<Instant>) {
        self.timer = deadline.map(|at| Delay::new(at.saturating_duration_since(Instant::now())));
    }

    /// Fails with [`io::ErrorKind::TimedOut`] once the deadline has passed,
    /// otherwise registers the task to be woken when it does.
    pub(crate) fn poll_expired(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Some(timer) = &mut self.timer {
            if timer.poll_unpin(cx).is_ready() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "stream deadline exceeded",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{task::Poll, time::Duration};

    use futures::future;

    use super::*;

    #[tokio::test]
    async fn deadline_expires_and_can_be_cleared() {
        let mut deadline = Deadline::default();
        future::poll_fn(|cx| Poll::Ready(deadline.poll_expired(cx)))
            .await
            .unwrap();

        deadline.set(Some(Instant::now() + Duration::from_millis(20)));
        let error = future::poll_fn(|cx| match deadline.poll_expired(cx) {
            Ok(()) => Poll::Pending,
            Err(error) => Poll::Ready(error),
        })
        .await;
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);

        deadline.set(None);
        future::poll_fn(|cx| Poll::Ready(deadline.poll_expired(cx)))
            .await
            .unwrap();
    }
}
