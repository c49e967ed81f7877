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

//! Stream 0 of a substrate connection, presented as a plain byte connection.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use futures::{AsyncRead, AsyncWrite};

use crate::{
    multiaddr::Multiaddr,
    network::RawConnection,
    provider::{Connection, Multiplexer, Stream},
};

type StreamOf<M> = <<M as Multiplexer>::Connection as Connection>::Stream;

/// The upgrade stream of a substrate connection, together with the connection itself.
///
/// Closing or dropping it closes the stream, the connection and, for dialed
/// connections, the multiplexer that was created for the dial.
pub(crate) struct StreamConn<M: Multiplexer> {
    stream: StreamOf<M>,
    connection: M::Connection,
    multiplexer: Option<M>,
    local_multiaddr: Multiaddr,
    remote_multiaddr: Multiaddr,
    closed: bool,
}

impl<M: Multiplexer> StreamConn<M> {
    pub(crate) fn new(
        stream: StreamOf<M>,
        connection: M::Connection,
        local_multiaddr: Multiaddr,
        remote_multiaddr: Multiaddr,
    ) -> Self {
        StreamConn {
            stream,
            connection,
            multiplexer: None,
            local_multiaddr,
            remote_multiaddr,
            closed: false,
        }
    }

    /// Hands ownership of the multiplexer the connection was dialed from to this wrapper.
    pub(crate) fn with_multiplexer(mut self, multiplexer: M) -> Self {
        self.multiplexer = Some(multiplexer);
        self
    }
}

impl<M: Multiplexer> AsyncRead for StreamConn<M> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<M: Multiplexer> AsyncWrite for StreamConn<M> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_close(cx)
    }
}

impl<M: Multiplexer> RawConnection for StreamConn<M> {
    fn local_addr(&self) -> SocketAddr {
        self.connection.local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_addr()
    }

    fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_multiaddr
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.stream.set_read_deadline(deadline)?;
        self.stream.set_write_deadline(deadline)
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.stream.set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.stream.set_write_deadline(deadline)
    }

    fn close(&mut self) -> io::Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        tracing::trace!(remote=%self.remote_multiaddr, "Closing upgrade connection");

        // The stream dies with the connection anyway.
        let _ = self.stream.close();
        let result = self.connection.close();
        match self.multiplexer.take() {
            Some(multiplexer) => result.and(multiplexer.close()),
            None => result,
        }
    }
}

impl<M: Multiplexer> Drop for StreamConn<M> {
    fn drop(&mut self) {
        let _ = RawConnection::close(self);
    }
}
