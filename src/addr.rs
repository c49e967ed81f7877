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

//! Conversion between UDX multiaddrs and UDP socket addresses.

use std::net::{IpAddr, SocketAddr};

use crate::multiaddr::{self, Component, Multiaddr, Protocol, Value, ValueKind};

/// Multiaddr code of the `/udx` marker, taken from the private-use range.
pub const P_UDX: u32 = 0x0300;

/// The `/udx` marker protocol. It carries no value.
pub const UDX: Protocol = Protocol::new("udx", P_UDX, ValueKind::None);

/// Registers the `/udx` marker with the multiaddr registry.
///
/// Safe to call any number of times. A conflicting registration made by some
/// other component is logged and otherwise ignored.
pub fn register_protocol() {
    if let Err(error) = multiaddr::register(UDX) {
        tracing::warn!(%error, "Failed to register the /udx multiaddr protocol");
    }
}

/// Builds `/ip{4,6}/<ip>/udp/<port>/udx` from a socket address.
pub fn to_udx_multiaddr(socket_addr: SocketAddr) -> Multiaddr {
    register_protocol();
    Multiaddr::empty()
        .with(Component::ip(socket_addr.ip()))
        .with(Component::udp(socket_addr.port()))
        .with(Component {
            protocol: UDX,
            value: Value::None,
        })
}

/// Extracts the UDP endpoint from a multiaddr.
///
/// The components may appear in any order, but the address must contain
/// exactly one IP component and exactly one UDP port component. Anything else
/// (DNS names, `/p2p` suffixes, the `/udx` marker itself) is ignored.
pub fn from_udx_multiaddr(addr: &Multiaddr) -> Result<SocketAddr, Error> {
    let mut ip = None;
    let mut port = None;

    for component in addr.iter() {
        match component.value() {
            Value::Ip4(ip4) if component.protocol() == multiaddr::IP4 => {
                if ip.replace(IpAddr::V4(*ip4)).is_some() {
                    return Err(Error::DuplicateIp(addr.clone()));
                }
            }
            Value::Ip6(ip6) if component.protocol() == multiaddr::IP6 => {
                if ip.replace(IpAddr::V6(*ip6)).is_some() {
                    return Err(Error::DuplicateIp(addr.clone()));
                }
            }
            Value::Port(p) if component.protocol() == multiaddr::UDP => {
                if port.replace(*p).is_some() {
                    return Err(Error::DuplicatePort(addr.clone()));
                }
            }
            _ => {}
        }
    }

    let ip = ip.ok_or_else(|| Error::MissingIp(addr.clone()))?;
    let port = port.ok_or_else(|| Error::MissingPort(addr.clone()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Parses a text multiaddr and extracts its UDP endpoint.
pub fn parse_udx_multiaddr(s: &str) -> Result<SocketAddr, Error> {
    register_protocol();
    let addr = s.parse::<Multiaddr>()?;
    from_udx_multiaddr(&addr)
}

/// Returns `true` if the address carries exactly one `/udx` marker.
pub fn is_udx_multiaddr(addr: &Multiaddr) -> bool {
    addr.iter()
        .filter(|component| component.protocol().code() == P_UDX)
        .count()
        == 1
}

/// An address that cannot be used by the UDX transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no IP component in {0}")]
    MissingIp(Multiaddr),
    #[error("no UDP port component in {0}")]
    MissingPort(Multiaddr),
    #[error("more than one IP component in {0}")]
    DuplicateIp(Multiaddr),
    #[error("more than one UDP port component in {0}")]
    DuplicatePort(Multiaddr),
    #[error("{0} is not a UDX address")]
    NotUdx(Multiaddr),
    #[error("malformed multiaddr: {0}")]
    Malformed(#[from] multiaddr::Error),
}
