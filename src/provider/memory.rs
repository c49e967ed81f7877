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

//! In-process substrate.
//!
//! Multiplexers find each other through a process-wide hub keyed by the local
//! address of their UDP socket. The socket only reserves the address, no
//! datagram ever crosses it. Connections and streams are plain in-memory
//! pipes, which makes this provider handy for tests that need to inject
//! failures at precise points of connection establishment.

use std::{
    collections::{hash_map::Entry, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, LazyLock, Weak,
    },
    task::{Context, Poll, Waker},
    time::Instant,
};

use fnv::FnvHashMap;
use futures::{
    channel::{mpsc, oneshot},
    future::{self, BoxFuture},
    prelude::*,
    task::AtomicWaker,
};
use parking_lot::Mutex;

use super::{ConnState, Connection, Deadline, Multiplexer, Provider, Stream};

type IncomingSender = mpsc::UnboundedSender<Incoming>;
type IncomingReceiver = mpsc::UnboundedReceiver<Incoming>;

static HUB: LazyLock<Hub> = LazyLock::new(|| Hub(Mutex::new(FnvHashMap::default())));

struct Hub(Mutex<FnvHashMap<SocketAddr, IncomingSender>>);

impl Hub {
    fn register_addr(&self, addr: SocketAddr) -> Option<IncomingReceiver> {
        let mut hub = self.0.lock();
        match hub.entry(addr) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded();
                entry.insert(tx);
                Some(rx)
            }
        }
    }

    fn unregister_addr(&self, addr: &SocketAddr) -> Option<IncomingSender> {
        self.0.lock().remove(addr)
    }

    /// Finds the multiplexer reachable at `addr`, including one bound to the
    /// unspecified address on the same port.
    fn get(&self, addr: &SocketAddr) -> Option<IncomingSender> {
        let hub = self.0.lock();
        let unspecified = match addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        hub.get(addr)
            .or_else(|| hub.get(&SocketAddr::new(unspecified, addr.port())))
            .cloned()
    }
}

/// A connection attempt queued at a listening multiplexer.
struct Incoming {
    connection: MemoryConnection,
    established: oneshot::Sender<()>,
}

/// Creates in-memory multiplexers.
///
/// Clones share their bookkeeping, which tests use to check that sockets are
/// released.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    bound: Arc<Mutex<FnvHashMap<SocketAddr, bool>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local addresses of every multiplexer created by this provider.
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.bound.lock().keys().copied().collect()
    }

    /// Number of multiplexers created by this provider that are still open.
    pub fn open_multiplexers(&self) -> usize {
        self.bound.lock().values().filter(|open| **open).count()
    }
}

impl Provider for MemoryProvider {
    type Multiplexer = MemoryMultiplexer;

    fn new_multiplexer(&self, socket: UdpSocket) -> io::Result<MemoryMultiplexer> {
        let local_addr = socket.local_addr()?;
        let incoming = HUB.register_addr(local_addr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{local_addr} is already served by another multiplexer"),
            )
        })?;
        self.bound.lock().insert(local_addr, true);

        Ok(MemoryMultiplexer {
            inner: Arc::new(MuxInner {
                local_addr,
                socket: Mutex::new(Some(socket)),
                incoming: Mutex::new(incoming),
                accept_waker: AtomicWaker::new(),
                closed: AtomicBool::new(false),
                connections: Mutex::new(Vec::new()),
                bound: self.bound.clone(),
            }),
        })
    }
}

/// In-memory multiplexer. Dropping the last handle closes it.
#[derive(Clone)]
pub struct MemoryMultiplexer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    local_addr: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
    incoming: Mutex<IncomingReceiver>,
    accept_waker: AtomicWaker,
    closed: AtomicBool,
    /// Every connection dialed or accepted, closed together with the multiplexer.
    connections: Mutex<Vec<MemoryConnection>>,
    bound: Arc<Mutex<FnvHashMap<SocketAddr, bool>>>,
}

impl MuxInner {
    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "multiplexer closed",
            ));
        }
        Ok(())
    }

    fn track(&self, connection: MemoryConnection) {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.state() == ConnState::Open);
        connections.push(connection);
    }

    fn poll_incoming(&self, cx: &mut Context<'_>) -> Poll<io::Result<Incoming>> {
        self.accept_waker.register(cx.waker());
        self.ensure_open()?;
        match self.incoming.lock().poll_next_unpin(cx) {
            Poll::Ready(Some(incoming)) => Poll::Ready(Ok(incoming)),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "multiplexer closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::trace!(address=%self.local_addr, "Closing in-memory multiplexer");

        HUB.unregister_addr(&self.local_addr);
        {
            let mut incoming = self.incoming.lock();
            incoming.close();
            while let Ok(queued) = incoming.try_recv() {
                let _ = queued.connection.close();
            }
        }
        self.accept_waker.wake();

        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in connections {
            let _ = connection.close();
        }

        self.socket.lock().take();
        if let Some(open) = self.bound.lock().get_mut(&self.local_addr) {
            *open = false;
        }
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl Multiplexer for MemoryMultiplexer {
    type Connection = MemoryConnection;

    fn dial(&self, remote: SocketAddr) -> BoxFuture<'static, io::Result<MemoryConnection>> {
        let inner = self.inner.clone();
        async move {
            inner.ensure_open()?;
            let refused = || {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no multiplexer accepting on {remote}"),
                )
            };
            let sender = HUB.get(&remote).ok_or_else(refused)?;

            // The remote sees us at the address we reached it on.
            let local_addr = if inner.local_addr.ip().is_unspecified() {
                SocketAddr::new(remote.ip(), inner.local_addr.port())
            } else {
                inner.local_addr
            };
            let (local, peer) = MemoryConnection::pair(local_addr, remote);

            let (established_tx, established_rx) = oneshot::channel();
            sender
                .unbounded_send(Incoming {
                    connection: peer,
                    established: established_tx,
                })
                .map_err(|_| refused())?;
            drop(sender);

            inner.track(local.clone());
            established_rx.await.map_err(|_| refused())?;
            Ok(local)
        }
        .boxed()
    }

    fn accept(&self) -> BoxFuture<'static, io::Result<MemoryConnection>> {
        let inner = self.inner.clone();
        async move {
            loop {
                let Incoming {
                    connection,
                    established,
                } = future::poll_fn(|cx| inner.poll_incoming(cx)).await?;

                if established.send(()).is_err() {
                    tracing::trace!(
                        remote=%connection.remote_addr(),
                        "Dialer went away before the connection was accepted"
                    );
                    let _ = connection.close();
                    continue;
                }
                inner.track(connection.clone());
                return Ok(connection);
            }
        }
        .boxed()
    }

    fn close(&self) -> io::Result<()> {
        self.inner.close();
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.ensure_open()?;
        Ok(self.inner.local_addr)
    }
}

/// One end of an in-memory connection.
#[derive(Clone)]
pub struct MemoryConnection {
    link: Arc<Link>,
    side: usize,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("side", &self.side)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl MemoryConnection {
    fn pair(dialer: SocketAddr, listener: SocketAddr) -> (Self, Self) {
        let link = Arc::new(Link::default());
        (
            MemoryConnection {
                link: link.clone(),
                side: 0,
                local_addr: dialer,
                remote_addr: listener,
            },
            MemoryConnection {
                link,
                side: 1,
                local_addr: listener,
                remote_addr: dialer,
            },
        )
    }
}

impl Connection for MemoryConnection {
    type Stream = MemoryStream;

    fn open_stream(&self) -> BoxFuture<'static, io::Result<MemoryStream>> {
        future::ready(self.link.open(self.side)).boxed()
    }

    fn accept_stream(&self) -> BoxFuture<'static, io::Result<MemoryStream>> {
        let link = self.link.clone();
        let side = self.side;
        future::poll_fn(move |cx| link.poll_accept(side, cx)).boxed()
    }

    fn close(&self) -> io::Result<()> {
        self.link.close(0);
        Ok(())
    }

    fn close_with_error(&self, code: u32) -> io::Result<()> {
        self.link.close(code);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn state(&self) -> ConnState {
        if self.link.0.lock().close_code.is_some() {
            ConnState::Closed
        } else {
            ConnState::Open
        }
    }
}

/// State shared by both ends of a connection.
#[derive(Default)]
struct Link(Mutex<LinkState>);

#[derive(Default)]
struct LinkState {
    close_code: Option<u32>,
    /// Streams opened by one side, waiting to be accepted by the side at that index.
    pending: [VecDeque<MemoryStream>; 2],
    accept_wakers: [Option<Waker>; 2],
    pipes: Vec<Weak<Pipe>>,
}

impl Link {
    fn open(&self, side: usize) -> io::Result<MemoryStream> {
        let mut state = self.0.lock();
        if state.close_code.is_some() {
            return Err(connection_closed());
        }

        let outbound = Arc::new(Pipe::default());
        let inbound = Arc::new(Pipe::default());
        state.pipes.retain(|pipe| pipe.strong_count() > 0);
        state.pipes.push(Arc::downgrade(&outbound));
        state.pipes.push(Arc::downgrade(&inbound));

        let remote = 1 - side;
        state.pending[remote].push_back(MemoryStream::new(outbound.clone(), inbound.clone()));
        if let Some(waker) = state.accept_wakers[remote].take() {
            waker.wake();
        }

        Ok(MemoryStream::new(inbound, outbound))
    }

    fn poll_accept(&self, side: usize, cx: &mut Context<'_>) -> Poll<io::Result<MemoryStream>> {
        let mut state = self.0.lock();
        if state.close_code.is_some() {
            return Poll::Ready(Err(connection_closed()));
        }
        if let Some(stream) = state.pending[side].pop_front() {
            return Poll::Ready(Ok(stream));
        }
        state.accept_wakers[side] = Some(cx.waker().clone());
        Poll::Pending
    }

    fn close(&self, code: u32) {
        let (pending, pipes, wakers) = {
            let mut state = self.0.lock();
            if state.close_code.is_some() {
                return;
            }
            state.close_code = Some(code);
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.pipes),
                std::mem::take(&mut state.accept_wakers),
            )
        };

        for pipe in pipes.iter().filter_map(Weak::upgrade) {
            pipe.update(|state| state.aborted = true);
        }
        drop(pending);
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

/// One direction of a stream.
#[derive(Default)]
struct Pipe(Mutex<PipeState>);

#[derive(Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    /// The writer is done; the reader sees end-of-input once the buffer drains.
    finished: bool,
    /// The reader went away; further writes fail.
    stopped: bool,
    reset: Option<u32>,
    /// The connection closed underneath the stream.
    aborted: bool,
    reader: Option<Waker>,
}

impl Pipe {
    fn update(&self, f: impl FnOnce(&mut PipeState)) {
        let waker = {
            let mut state = self.0.lock();
            f(&mut state);
            state.reader.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut state = self.0.lock();
        if state.aborted {
            return Poll::Ready(Err(connection_closed()));
        }
        if let Some(code) = state.reset {
            return Poll::Ready(Err(stream_reset(code)));
        }
        if !state.buffer.is_empty() {
            let n = buf.len().min(state.buffer.len());
            for (dst, src) in buf.iter_mut().zip(state.buffer.drain(..n)) {
                *dst = src;
            }
            return Poll::Ready(Ok(n));
        }
        if state.finished {
            return Poll::Ready(Ok(0));
        }
        state.reader = Some(cx.waker().clone());
        Poll::Pending
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let waker = {
            let mut state = self.0.lock();
            if state.aborted {
                return Err(connection_closed());
            }
            if let Some(code) = state.reset {
                return Err(stream_reset(code));
            }
            if state.finished {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write half of the stream is closed",
                ));
            }
            if state.stopped {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "remote stopped reading",
                ));
            }
            state.buffer.extend(data);
            state.reader.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(data.len())
    }
}

/// A stream over an in-memory connection.
pub struct MemoryStream {
    read: Arc<Pipe>,
    write: Arc<Pipe>,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl MemoryStream {
    fn new(read: Arc<Pipe>, write: Arc<Pipe>) -> Self {
        MemoryStream {
            read,
            write,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
        }
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.read_deadline.poll_expired(cx)?;
        this.read.poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.write_deadline.poll_expired(cx)?;
        Poll::Ready(this.write.write(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().close_write())
    }
}

impl Stream for MemoryStream {
    fn close(&mut self) -> io::Result<()> {
        self.write.update(|state| state.finished = true);
        self.read.update(|state| state.stopped = true);
        Ok(())
    }

    fn close_write(&mut self) -> io::Result<()> {
        self.write.update(|state| state.finished = true);
        Ok(())
    }

    fn reset(&mut self, code: u32) -> io::Result<()> {
        for pipe in [&self.read, &self.write] {
            pipe.update(|state| {
                state.reset.get_or_insert(code);
            });
        }
        Ok(())
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

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let _ = Stream::close(self);
    }
}

fn connection_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

fn stream_reset(code: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionReset,
        format!("stream reset with code {code}"),
    )
}
