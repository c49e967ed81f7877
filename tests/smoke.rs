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

#![cfg(feature = "quic")]

mod common;

use std::sync::Arc;

use common::{CountingResourceManager, IdentityUpgrader};
use futures::{future, AsyncReadExt, AsyncWriteExt};
use libp2p_identity::Keypair;
use libp2p_udx::{
    from_udx_multiaddr,
    multiaddr::Multiaddr,
    network::{CapableConnection, MuxedStream},
    parse_udx_multiaddr, Error, Transport,
};

fn listen_addr() -> Multiaddr {
    libp2p_udx::register_protocol();
    "/ip4/127.0.0.1/udp/0/udx".parse().unwrap()
}

fn transport() -> Transport {
    Transport::quic(Keypair::generate_ed25519()).unwrap()
}

#[tokio::test]
async fn ping_pong() {
    common::init_tracing();

    let server = transport();
    let client = transport();

    let listener = server.listen(&listen_addr()).unwrap();
    let port = from_udx_multiaddr(listener.multiaddr()).unwrap().port();
    assert_ne!(port, 0);
    assert_eq!(listener.local_addr().port(), port);
    assert_eq!(
        parse_udx_multiaddr(&listener.multiaddr().to_string()).unwrap(),
        listener.local_addr()
    );

    let (inbound, outbound) = future::join(
        listener.accept(),
        client.dial(listener.multiaddr(), Some(server.local_peer_id())),
    )
    .await;
    let (inbound, outbound) = (inbound.unwrap(), outbound.unwrap());

    // Both ends are authenticated by the TLS handshake.
    assert_eq!(outbound.remote_peer(), Some(server.local_peer_id()));
    assert_eq!(inbound.remote_peer(), Some(client.local_peer_id()));
    assert_eq!(outbound.remote_multiaddr(), listener.multiaddr());
    assert_eq!(inbound.local_multiaddr(), listener.multiaddr());

    let mut x = outbound.open_stream().await.unwrap();
    x.write_all(b"ping").await.unwrap();
    x.close_write().unwrap();

    let mut y = inbound.accept_stream().await.unwrap();
    let mut buf = Vec::new();
    y.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"ping");
    y.write_all(b"pong").await.unwrap();
    MuxedStream::close(&mut *y).unwrap();

    let mut buf = Vec::new();
    x.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"pong");

    outbound.close().unwrap();
}

#[tokio::test]
async fn closing_the_listener_fails_live_connections() {
    let server = transport();
    let client = transport();
    let listener = server.listen(&listen_addr()).unwrap();

    let mut streams = Vec::new();
    let mut connections = Vec::new();
    for _ in 0..2 {
        let (inbound, outbound) =
            future::join(listener.accept(), client.dial(listener.multiaddr(), None)).await;
        let (inbound, outbound) = (inbound.unwrap(), outbound.unwrap());

        let mut x = outbound.open_stream().await.unwrap();
        x.write_all(b"hello").await.unwrap();
        let mut y = inbound.accept_stream().await.unwrap();
        let mut buf = [0; 5];
        y.read_exact(&mut buf).await.unwrap();

        streams.push(y);
        connections.push((inbound, outbound, x));
    }

    listener.close().unwrap();

    for stream in &mut streams {
        let mut buf = [0; 1];
        assert!(stream.read(&mut buf).await.is_err());
        assert!(stream.write_all(b"more").await.is_err());
    }
    for (inbound, _, _) in &connections {
        assert!(inbound.is_closed());
    }
    assert!(matches!(listener.accept().await, Err(Error::Multiplexer(_))));
}

#[tokio::test]
async fn upgrader_runs_over_the_first_stream() {
    common::init_tracing();

    let server_key = Keypair::generate_ed25519();
    let rcmgr = CountingResourceManager::default();
    let server = Transport::quic(server_key.clone())
        .unwrap()
        .with_upgrader(IdentityUpgrader::new(server_key))
        .with_resource_manager(Arc::new(rcmgr.clone()));
    let client_key = Keypair::generate_ed25519();
    let client = Transport::quic(client_key.clone())
        .unwrap()
        .with_upgrader(IdentityUpgrader::new(client_key));
    assert!(server.upgrades_connections());

    let listener = server.listen(&listen_addr()).unwrap();
    let (inbound, outbound) = future::join(
        listener.accept(),
        client.dial(listener.multiaddr(), Some(server.local_peer_id())),
    )
    .await;
    let (inbound, outbound) = (inbound.unwrap(), outbound.unwrap());

    assert_eq!(inbound.remote_peer(), Some(client.local_peer_id()));
    assert_eq!(
        inbound.remote_public_key(),
        Some(&client.keypair().public())
    );
    assert_eq!(outbound.remote_peer(), Some(server.local_peer_id()));
    assert_eq!(rcmgr.open_scopes(), 1);

    inbound.close().unwrap();
    assert_eq!(rcmgr.open_scopes(), 0);
}

#[tokio::test]
async fn concurrent_handshakes_are_all_accepted() {
    let server = transport();
    let listener = server.listen(&listen_addr()).unwrap();
    let clients: Vec<_> = (0..3).map(|_| transport()).collect();

    let dials = future::try_join_all(
        clients
            .iter()
            .map(|client| client.dial(listener.multiaddr(), Some(server.local_peer_id()))),
    );
    let accepts = async {
        let mut inbound = Vec::new();
        for _ in 0..clients.len() {
            inbound.push(listener.accept().await.unwrap());
        }
        inbound
    };
    let (outbound, inbound) = future::join(dials, accepts).await;
    assert_eq!(outbound.unwrap().len(), 3);

    let mut remotes: Vec<_> = inbound.iter().filter_map(|c| c.remote_peer()).collect();
    let mut expected: Vec<_> = clients.iter().map(|c| c.local_peer_id()).collect();
    remotes.sort();
    expected.sort();
    assert_eq!(remotes, expected);
}

#[tokio::test]
async fn dial_refuses_unusable_addresses() {
    let client = transport();

    for addr in [
        "/ip4/127.0.0.1/udp/1234/quic-v1",
        "/ip4/127.0.0.1/tcp/1234/udx",
    ] {
        let addr: Multiaddr = addr.parse().unwrap();
        assert!(!client.can_dial(&addr));
        assert!(matches!(
            client.dial(&addr, None).await,
            Err(Error::AddressParse(_))
        ));
    }

    let addr: Multiaddr = "/ip4/127.0.0.1/udp/0/udx".parse().unwrap();
    assert!(matches!(
        client.dial(&addr, None).await,
        Err(Error::Resolution(_))
    ));
}
