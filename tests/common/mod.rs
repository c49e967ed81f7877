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

#![allow(dead_code)]

use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::{future, future::BoxFuture, AsyncReadExt, AsyncWriteExt, FutureExt};
use libp2p_identity::{Keypair, PeerId, PublicKey};
use libp2p_udx::{
    multiaddr::Multiaddr,
    network::{
        CapableConnection, ConnErrorCode, ConnectionScope, ConnectionState, Direction,
        MuxedStream, RawConnection, ResourceError, ResourceManager, Upgrader,
    },
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Authenticates both ends by exchanging length-prefixed protobuf public keys
/// over the upgrade stream.
pub struct IdentityUpgrader {
    keypair: Keypair,
}

impl IdentityUpgrader {
    pub fn new(keypair: Keypair) -> Arc<Self> {
        Arc::new(IdentityUpgrader { keypair })
    }
}

impl Upgrader for IdentityUpgrader {
    fn upgrade(
        &self,
        mut conn: Box<dyn RawConnection>,
        direction: Direction,
        remote_peer: Option<PeerId>,
        scope: Box<dyn ConnectionScope>,
    ) -> BoxFuture<'static, io::Result<Box<dyn CapableConnection>>> {
        let local_key = self.keypair.public();
        async move {
            conn.set_deadline(Some(Instant::now() + Duration::from_secs(5)))?;
            let remote_key = exchange_keys(&mut conn, &local_key).await?;
            conn.set_deadline(None)?;

            let peer = remote_key.to_peer_id();
            if remote_peer.is_some_and(|expected| expected != peer) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("unexpected peer {peer}"),
                ));
            }
            scope.set_peer(peer).map_err(io::Error::other)?;

            let connection = UpgradedConnection {
                local_peer: local_key.to_peer_id(),
                remote_key,
                local_multiaddr: conn.local_multiaddr().clone(),
                remote_multiaddr: conn.remote_multiaddr().clone(),
                direction,
                raw: Mutex::new(conn),
                closed: AtomicBool::new(false),
                scope,
            };
            Ok(Box::new(connection) as Box<dyn CapableConnection>)
        }
        .boxed()
    }
}

async fn exchange_keys(
    conn: &mut Box<dyn RawConnection>,
    local_key: &PublicKey,
) -> io::Result<PublicKey> {
    let encoded = local_key.encode_protobuf();
    let len = u16::try_from(encoded.len()).map_err(io::Error::other)?;
    conn.write_all(&len.to_be_bytes()).await?;
    conn.write_all(&encoded).await?;
    conn.flush().await?;

    let mut len = [0; 2];
    conn.read_exact(&mut len).await?;
    let mut buf = vec![0; usize::from(u16::from_be_bytes(len))];
    conn.read_exact(&mut buf).await?;
    PublicKey::try_decode_protobuf(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Connection produced by [`IdentityUpgrader`]. It only carries the upgrade
/// stream, so opening further streams is unsupported.
pub struct UpgradedConnection {
    raw: Mutex<Box<dyn RawConnection>>,
    closed: AtomicBool,
    local_peer: PeerId,
    remote_key: PublicKey,
    local_multiaddr: Multiaddr,
    remote_multiaddr: Multiaddr,
    direction: Direction,
    scope: Box<dyn ConnectionScope>,
}

impl CapableConnection for UpgradedConnection {
    fn open_stream(&self) -> BoxFuture<'_, io::Result<Box<dyn MuxedStream>>> {
        future::ready(Err(io::ErrorKind::Unsupported.into())).boxed()
    }

    fn accept_stream(&self) -> BoxFuture<'_, io::Result<Box<dyn MuxedStream>>> {
        future::ready(Err(io::ErrorKind::Unsupported.into())).boxed()
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.scope.done();
        RawConnection::close(&mut **self.raw.lock())
    }

    fn close_with_error(&self, _: ConnErrorCode) -> io::Result<()> {
        self.close()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn remote_peer(&self) -> Option<PeerId> {
        Some(self.remote_key.to_peer_id())
    }

    fn remote_public_key(&self) -> Option<&PublicKey> {
        Some(&self.remote_key)
    }

    fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_multiaddr
    }

    fn scope(&self) -> &dyn ConnectionScope {
        self.scope.as_ref()
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            transport: match self.direction {
                Direction::Inbound => "udx-inbound",
                Direction::Outbound => "udx-outbound",
            },
        }
    }
}

#[derive(Default)]
struct Counters {
    reject: AtomicUsize,
    rejected: AtomicUsize,
    opened: AtomicUsize,
    open: AtomicUsize,
}

/// Resource manager that refuses the first `n` requests and counts the
/// scopes it handed out.
#[derive(Clone, Default)]
pub struct CountingResourceManager {
    counters: Arc<Counters>,
}

impl CountingResourceManager {
    pub fn rejecting(n: usize) -> Self {
        let manager = Self::default();
        manager.counters.reject.store(n, Ordering::SeqCst);
        manager
    }

    pub fn rejected(&self) -> usize {
        self.counters.rejected.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Scopes handed out and not yet released.
    pub fn open_scopes(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }
}

impl ResourceManager for CountingResourceManager {
    fn open_connection(
        &self,
        _: Direction,
        _: bool,
        _: &Multiaddr,
    ) -> Result<Box<dyn ConnectionScope>, ResourceError> {
        let counters = &self.counters;
        if counters
            .reject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            counters.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ResourceError::LimitExceeded);
        }
        counters.opened.fetch_add(1, Ordering::SeqCst);
        counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingScope {
            counters: counters.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

struct CountingScope {
    counters: Arc<Counters>,
    released: AtomicBool,
}

impl CountingScope {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl ConnectionScope for CountingScope {
    fn set_peer(&self, _: PeerId) -> Result<(), ResourceError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(ResourceError::ScopeClosed);
        }
        Ok(())
    }

    fn done(&self) {
        self.release();
    }
}

impl Drop for CountingScope {
    fn drop(&mut self) {
        self.release();
    }
}
