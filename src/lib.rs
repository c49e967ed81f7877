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

//! Implementation of a UDX transport for libp2p-style networking stacks.
//!
//! Addresses have the form `/ip4/<ip>/udp/<port>/udx` or
//! `/ip6/<ip>/udp/<port>/udx`. Connections run over a datagram substrate that
//! multiplexes many connections on one UDP socket, see [`provider`].
//!
//! # Usage
//!
//! ```no_run
//! # #[cfg(feature = "quic")]
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use libp2p_identity::Keypair;
//! use libp2p_udx::network::CapableConnection;
//!
//! let transport = libp2p_udx::Transport::quic(Keypair::generate_ed25519())?;
//! let listener = transport.listen(&"/ip4/127.0.0.1/udp/0/udx".parse()?)?;
//! println!("listening on {}", listener.multiaddr());
//!
//! let connection = listener.accept().await?;
//! println!("accepted connection from {:?}", connection.remote_peer());
//! # Ok(())
//! # }
//! ```
//!
//! # Composition modes
//!
//! A transport either hands substrate connections to the application as they
//! are, relying on the substrate for security and multiplexing, or it runs an
//! external [`network::Upgrader`] over the first stream of every connection.
//! The mode is picked once, with [`GenTransport::with_upgrader`].
//!
//! # Listener fault isolation
//!
//! All inbound connections of a [`Listener`] share one multiplexer. Failures
//! of a single inbound attempt are logged and the attempt is discarded; only
//! the multiplexer shutting down is reported by [`Listener::accept`].

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod addr;
#[cfg(feature = "quic")]
mod config;
mod connection;
mod listener;
pub mod multiaddr;
pub mod network;
pub mod provider;
mod stream;
mod stream_conn;
mod transport;

use std::{io, net::SocketAddr};

pub use addr::{
    from_udx_multiaddr, is_udx_multiaddr, parse_udx_multiaddr, register_protocol,
    to_udx_multiaddr, Error as AddrError, P_UDX, UDX,
};
#[cfg(feature = "quic")]
pub use config::Config;
pub use connection::Connection;
pub use listener::Listener;
pub use multiaddr::Multiaddr;
pub use stream::Stream;
pub use transport::GenTransport;

/// Transport over the QUIC substrate.
#[cfg(feature = "quic")]
pub type Transport = GenTransport<provider::quic::QuicProvider>;

/// Name reported in [`network::ConnectionState::transport`].
pub(crate) const TRANSPORT_NAME: &str = "udx";

/// Error that can happen when dialing or listening.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The address is not a well-formed UDX address.
    #[error(transparent)]
    AddressParse(#[from] addr::Error),

    /// The address does not name a dialable endpoint.
    #[error("cannot dial {0}")]
    Resolution(SocketAddr),

    /// Binding the local UDP socket or setting up its multiplexer failed.
    #[error("failed to bind a local UDP socket")]
    Bind(#[source] io::Error),

    /// The substrate failed to establish the connection.
    #[error("failed to establish a substrate connection")]
    Dial(#[source] io::Error),

    /// The resource manager refused the connection.
    #[error(transparent)]
    Resource(#[from] network::ResourceError),

    /// The upgrader failed to secure or multiplex the connection.
    #[error("connection upgrade failed")]
    Upgrade(#[source] io::Error),

    /// The multiplexer is closed. Fatal for a listener.
    #[error("multiplexer closed")]
    Multiplexer(#[source] io::Error),
}
