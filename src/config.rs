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

use std::{io, sync::Arc, time::Duration};

use libp2p_identity::Keypair;
use quinn::{
    crypto::rustls::{QuicClientConfig, QuicServerConfig},
    TransportConfig, VarInt,
};

/// Config for the QUIC substrate.
#[derive(Clone)]
pub struct Config {
    /// Timeout for the initial handshake when establishing a connection.
    /// The actual timeout is the minimum of this and the [`Config::max_idle_timeout`].
    pub handshake_timeout: Duration,
    /// Maximum duration of inactivity in ms to accept before timing out the connection.
    pub max_idle_timeout: u32,
    /// Period of inactivity before sending a keep-alive packet.
    /// Must be set lower than the idle_timeout of both
    /// peers to be effective.
    ///
    /// See [`quinn::TransportConfig::keep_alive_interval`] for more
    /// info.
    pub keep_alive_interval: Duration,
    /// Maximum number of incoming bidirectional streams that may be open
    /// concurrently by the remote peer.
    pub max_concurrent_stream_limit: u32,

    /// Max unacknowledged data in bytes that may be send on a single stream.
    pub max_stream_data: u32,

    /// Max unacknowledged data in bytes that may be send in total on all streams
    /// of a connection.
    pub max_connection_data: u32,

    /// Libp2p identity of the node, used for the TLS certificates.
    keypair: Keypair,
}

impl Config {
    /// Creates a new configuration object with default values.
    pub fn new(keypair: &Keypair) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            max_idle_timeout: 10 * 1000,
            keep_alive_interval: Duration::from_secs(5),
            max_concurrent_stream_limit: 256,
            max_stream_data: 10_000_000,
            // Ensure that one stream is not consuming the whole connection.
            max_connection_data: 15_000_000,
            keypair: keypair.clone(),
        }
    }

    fn transport_config(&self) -> Arc<TransportConfig> {
        let mut transport = TransportConfig::default();
        // Disable uni-directional streams.
        transport.max_concurrent_uni_streams(0u32.into());
        transport.max_concurrent_bidi_streams(self.max_concurrent_stream_limit.into());
        // Disable datagrams.
        transport.datagram_receive_buffer_size(None);
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(VarInt::from_u32(self.max_idle_timeout).into()));
        transport.allow_spin(false);
        transport.stream_receive_window(self.max_stream_data.into());
        transport.receive_window(self.max_connection_data.into());
        Arc::new(transport)
    }

    pub(crate) fn server_quinn_config(&self) -> io::Result<quinn::ServerConfig> {
        let tls = libp2p_tls::make_server_config(&self.keypair).map_err(io::Error::other)?;
        let crypto = QuicServerConfig::try_from(tls).map_err(io::Error::other)?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(self.transport_config());
        // Connections are tied to the socket address they were accepted on.
        server_config.migration(false);
        Ok(server_config)
    }

    pub(crate) fn client_quinn_config(&self) -> io::Result<quinn::ClientConfig> {
        let tls = libp2p_tls::make_client_config(&self.keypair, None).map_err(io::Error::other)?;
        let crypto = QuicClientConfig::try_from(tls).map_err(io::Error::other)?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(self.transport_config());
        Ok(client_config)
    }

    pub(crate) fn endpoint_config(&self) -> quinn::EndpointConfig {
        let mut endpoint_config = quinn::EndpointConfig::default();
        endpoint_config.supported_versions(vec![1]);
        endpoint_config
    }
}
