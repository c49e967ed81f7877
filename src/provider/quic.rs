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

//! Substrate backed by [`quinn`].
//!
//! Connections are secured with libp2p TLS certificates, so the remote's
//! [`PeerId`] is known as soon as the handshake completes.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::{
    future::{self, BoxFuture, Either},
    stream::FuturesUnordered,
    AsyncRead, AsyncWrite, FutureExt, StreamExt,
};
use futures_timer::Delay;
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use quinn::{rustls::pki_types::CertificateDer, VarInt};

use super::{ConnState, Connection, Deadline, Multiplexer, Provider, Stream};
use crate::config::Config;

/// Creates [`quinn::Endpoint`]s on the tokio runtime.
#[derive(Clone)]
pub struct QuicProvider {
    endpoint_config: quinn::EndpointConfig,
    server_config: quinn::ServerConfig,
    client_config: quinn::ClientConfig,
    handshake_timeout: Duration,
}

impl QuicProvider {
    pub fn new(config: Config) -> io::Result<Self> {
        Ok(QuicProvider {
            endpoint_config: config.endpoint_config(),
            server_config: config.server_quinn_config()?,
            client_config: config.client_quinn_config()?,
            handshake_timeout: config.handshake_timeout,
        })
    }
}

impl Provider for QuicProvider {
    type Multiplexer = QuicMultiplexer;

    fn new_multiplexer(&self, socket: UdpSocket) -> io::Result<QuicMultiplexer> {
        // The endpoint registers its socket with the current runtime.
        tokio::runtime::Handle::try_current().map_err(io::Error::other)?;

        let endpoint = quinn::Endpoint::new(
            self.endpoint_config.clone(),
            Some(self.server_config.clone()),
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;
        Ok(QuicMultiplexer {
            local_addr: endpoint.local_addr()?,
            endpoint,
            client_config: self.client_config.clone(),
            handshake_timeout: self.handshake_timeout,
            handshakes: Default::default(),
        })
    }
}

/// A [`quinn::Endpoint`] serving both directions on one socket.
#[derive(Clone)]
pub struct QuicMultiplexer {
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    handshake_timeout: Duration,
    local_addr: SocketAddr,
    /// Inbound handshakes in progress, shared by every `accept` call.
    handshakes: Arc<Mutex<FuturesUnordered<Handshake>>>,
}

type Handshake = BoxFuture<'static, Option<QuicConnection>>;

impl Multiplexer for QuicMultiplexer {
    type Connection = QuicConnection;

    fn dial(&self, remote: SocketAddr) -> BoxFuture<'static, io::Result<QuicConnection>> {
        // This `"l"` seems necessary because an empty string is an invalid domain
        // name. While we don't use domain names, the underlying rustls library
        // is based upon the assumption that we do.
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), remote, "l");
        let handshake_timeout = self.handshake_timeout;
        let local_addr = self.local_addr;

        async move {
            let connecting = connecting.map_err(io::Error::other)?;
            match future::select(Box::pin(connecting), Delay::new(handshake_timeout)).await {
                Either::Left((Ok(connection), _)) => Ok(QuicConnection::new(connection, local_addr)),
                Either::Left((Err(error), _)) => Err(connection_error(error)),
                Either::Right(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake timed out",
                )),
            }
        }
        .boxed()
    }

    /// Handshakes run concurrently, so a slow peer does not hold up the
    /// ones behind it.
    fn accept(&self) -> BoxFuture<'static, io::Result<QuicConnection>> {
        let endpoint = self.endpoint.clone();
        let handshakes = self.handshakes.clone();
        let handshake_timeout = self.handshake_timeout;
        let local_addr = self.local_addr;
        let mut incoming = next_incoming(endpoint.clone());

        future::poll_fn(move |cx| loop {
            match incoming.poll_unpin(cx) {
                Poll::Ready(Some(next)) => {
                    handshakes
                        .lock()
                        .push(handshake(next, handshake_timeout, local_addr));
                    incoming = next_incoming(endpoint.clone());
                    continue;
                }
                Poll::Ready(None) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "endpoint closed",
                    )))
                }
                Poll::Pending => {}
            }
            match handshakes.lock().poll_next_unpin(cx) {
                Poll::Ready(Some(Some(connection))) => return Poll::Ready(Ok(connection)),
                Poll::Ready(Some(None)) => {}
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        })
        .boxed()
    }

    fn close(&self) -> io::Result<()> {
        self.endpoint.close(VarInt::from_u32(0), b"");
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }
}

fn next_incoming(endpoint: quinn::Endpoint) -> BoxFuture<'static, Option<quinn::Incoming>> {
    async move { endpoint.accept().await }.boxed()
}

/// Completes an inbound handshake. Failures are logged and yield `None`.
fn handshake(
    incoming: quinn::Incoming,
    handshake_timeout: Duration,
    local_addr: SocketAddr,
) -> Handshake {
    async move {
        let remote = incoming.remote_address();
        let connecting = match incoming.accept() {
            Ok(connecting) => connecting,
            Err(error) => {
                tracing::debug!(%remote, %error, "Refused incoming QUIC connection");
                return None;
            }
        };
        match future::select(Box::pin(connecting), Delay::new(handshake_timeout)).await {
            Either::Left((Ok(connection), _)) => Some(QuicConnection::new(connection, local_addr)),
            Either::Left((Err(error), _)) => {
                tracing::debug!(%remote, %error, "Incoming QUIC handshake failed");
                None
            }
            Either::Right(_) => {
                tracing::debug!(%remote, "Incoming QUIC handshake timed out");
                None
            }
        }
    }
    .boxed()
}

/// Handle to a [`quinn::Connection`].
#[derive(Clone)]
pub struct QuicConnection {
    connection: quinn::Connection,
    local_addr: SocketAddr,
}

impl QuicConnection {
    fn new(connection: quinn::Connection, local_addr: SocketAddr) -> Self {
        tracing::debug!(remote=%connection.remote_address(), "QUIC connection established");
        QuicConnection {
            connection,
            local_addr,
        }
    }
}

impl Connection for QuicConnection {
    type Stream = QuicStream;

    fn open_stream(&self) -> BoxFuture<'static, io::Result<QuicStream>> {
        let connection = self.connection.clone();
        async move {
            let (send, recv) = connection.open_bi().await.map_err(connection_error)?;
            Ok(QuicStream::new(send, recv))
        }
        .boxed()
    }

    fn accept_stream(&self) -> BoxFuture<'static, io::Result<QuicStream>> {
        let connection = self.connection.clone();
        async move {
            let (send, recv) = connection.accept_bi().await.map_err(connection_error)?;
            Ok(QuicStream::new(send, recv))
        }
        .boxed()
    }

    fn close(&self) -> io::Result<()> {
        self.connection.close(VarInt::from_u32(0), b"");
        Ok(())
    }

    fn close_with_error(&self, code: u32) -> io::Result<()> {
        self.connection.close(VarInt::from_u32(code), b"");
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    fn state(&self) -> ConnState {
        match self.connection.close_reason() {
            Some(_) => ConnState::Closed,
            None => ConnState::Open,
        }
    }

    fn remote_peer_id(&self) -> Option<PeerId> {
        let identity = self.connection.peer_identity()?;
        let certificates = identity.downcast::<Vec<CertificateDer<'static>>>().ok()?;
        let end_entity = certificates.first()?;
        let certificate = libp2p_tls::certificate::parse(end_entity).ok()?;
        Some(certificate.peer_id())
    }
}

/// A bidirectional QUIC stream.
pub struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl QuicStream {
    fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        QuicStream {
            send,
            recv,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.read_deadline.poll_expired(cx)?;
        AsyncRead::poll_read(Pin::new(&mut this.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.write_deadline.poll_expired(cx)?;
        AsyncWrite::poll_write(Pin::new(&mut this.send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_close(Pin::new(&mut self.get_mut().send), cx)
    }
}

impl Stream for QuicStream {
    fn close(&mut self) -> io::Result<()> {
        // Either half may already be finished by the remote or by us.
        let _ = self.send.finish();
        let _ = self.recv.stop(VarInt::from_u32(0));
        Ok(())
    }

    fn close_write(&mut self) -> io::Result<()> {
        self.send
            .finish()
            .map_err(|error| io::Error::new(io::ErrorKind::NotConnected, error))
    }

    fn reset(&mut self, code: u32) -> io::Result<()> {
        let code = VarInt::from_u32(code);
        let _ = self.recv.stop(code);
        self.send
            .reset(code)
            .map_err(|error| io::Error::new(io::ErrorKind::NotConnected, error))
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.read_deadline.set(deadline);
        Ok(())
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.write_deadline.set(deadline);
        Ok(())
    }
}

fn connection_error(error: quinn::ConnectionError) -> io::Error {
    use quinn::ConnectionError;

    let kind = match error {
        ConnectionError::TimedOut => io::ErrorKind::TimedOut,
        ConnectionError::Reset => io::ErrorKind::ConnectionReset,
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed => io::ErrorKind::ConnectionAborted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, error)
}
