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

//! Self-describing, multi-segment network addresses.
//!
//! A [`Multiaddr`] is an ordered sequence of [`Component`]s, each one a
//! [`Protocol`] plus an optional value, e.g. `/ip4/127.0.0.1/udp/4001/udx`.
//!
//! Unlike a closed enum of protocols, the set of known protocols lives in a
//! process-wide registry. Transports for protocols that are not part of the
//! built-in set register their marker with [`register`] before parsing or
//! printing addresses that contain it.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    slice,
    str::{self, FromStr},
    sync::LazyLock,
};

use fnv::FnvHashMap;
use libp2p_identity::PeerId;
use parking_lot::RwLock;
use unsigned_varint::{decode, encode};

/// How the value of a protocol is represented, both in text and binary form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// The protocol carries no value, e.g. `/quic-v1`.
    None,
    /// Four bytes, dotted-quad text.
    Ip4,
    /// Sixteen bytes, RFC 5952 text.
    Ip6,
    /// Two bytes big-endian, decimal text.
    Port,
    /// Length-prefixed UTF-8.
    Text,
    /// Length-prefixed multihash, base58 text.
    PeerId,
}

/// Definition of a multiaddr protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protocol {
    name: &'static str,
    code: u32,
    kind: ValueKind,
}

impl Protocol {
    pub const fn new(name: &'static str, code: u32, kind: ValueKind) -> Self {
        Protocol { name, code, kind }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }
}

// Codes are taken from https://github.com/multiformats/multiaddr/blob/master/protocols.csv .
pub const IP4: Protocol = Protocol::new("ip4", 4, ValueKind::Ip4);
pub const TCP: Protocol = Protocol::new("tcp", 6, ValueKind::Port);
pub const IP6: Protocol = Protocol::new("ip6", 41, ValueKind::Ip6);
pub const DNS: Protocol = Protocol::new("dns", 53, ValueKind::Text);
pub const DNS4: Protocol = Protocol::new("dns4", 54, ValueKind::Text);
pub const DNS6: Protocol = Protocol::new("dns6", 55, ValueKind::Text);
pub const UDP: Protocol = Protocol::new("udp", 273, ValueKind::Port);
pub const P2P: Protocol = Protocol::new("p2p", 421, ValueKind::PeerId);
pub const QUIC_V1: Protocol = Protocol::new("quic-v1", 461, ValueKind::None);

const BUILTIN: [Protocol; 9] = [IP4, TCP, IP6, DNS, DNS4, DNS6, UDP, P2P, QUIC_V1];

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| {
    let mut registry = Registry::default();
    for protocol in BUILTIN {
        registry.insert(protocol);
    }
    RwLock::new(registry)
});

#[derive(Default)]
struct Registry {
    by_code: FnvHashMap<u32, Protocol>,
    by_name: FnvHashMap<&'static str, Protocol>,
}

impl Registry {
    fn insert(&mut self, protocol: Protocol) {
        self.by_code.insert(protocol.code, protocol);
        self.by_name.insert(protocol.name, protocol);
    }
}

/// Adds a protocol to the process-wide registry.
///
/// Registering a definition that is already present is a no-op. A definition
/// whose name or code collides with a *different* registered protocol is
/// rejected with [`Error::ProtocolConflict`].
pub fn register(protocol: Protocol) -> Result<(), Error> {
    let mut registry = REGISTRY.write();
    let by_code = registry.by_code.get(&protocol.code).copied();
    let by_name = registry.by_name.get(protocol.name).copied();

    match (by_code, by_name) {
        (None, None) => {
            registry.insert(protocol);
            Ok(())
        }
        (Some(a), Some(b)) if a == protocol && b == protocol => Ok(()),
        _ => Err(Error::ProtocolConflict {
            name: protocol.name,
            code: protocol.code,
        }),
    }
}

/// Looks up a registered protocol by its numeric code.
pub fn protocol_by_code(code: u32) -> Option<Protocol> {
    REGISTRY.read().by_code.get(&code).copied()
}

/// Looks up a registered protocol by its text name.
pub fn protocol_by_name(name: &str) -> Option<Protocol> {
    REGISTRY.read().by_name.get(name).copied()
}

/// The value attached to a [`Component`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    None,
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Port(u16),
    Text(String),
    PeerId(PeerId),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::Ip4(_) => ValueKind::Ip4,
            Value::Ip6(_) => ValueKind::Ip6,
            Value::Port(_) => ValueKind::Port,
            Value::Text(_) => ValueKind::Text,
            Value::PeerId(_) => ValueKind::PeerId,
        }
    }

    fn parse(kind: ValueKind, s: &str) -> Option<Value> {
        match kind {
            ValueKind::None => Some(Value::None),
            ValueKind::Ip4 => s.parse().ok().map(Value::Ip4),
            ValueKind::Ip6 => s.parse().ok().map(Value::Ip6),
            ValueKind::Port => s.parse().ok().map(Value::Port),
            ValueKind::Text if s.is_empty() => None,
            ValueKind::Text => Some(Value::Text(s.to_owned())),
            ValueKind::PeerId => s.parse().ok().map(Value::PeerId),
        }
    }
}

/// A single segment of a [`Multiaddr`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Component {
    pub(crate) protocol: Protocol,
    pub(crate) value: Value,
}

impl Component {
    /// Creates a component, checking that `value` has the shape `protocol` expects.
    pub fn new(protocol: Protocol, value: Value) -> Result<Self, Error> {
        if value.kind() != protocol.kind {
            return Err(Error::InvalidValue {
                protocol: protocol.name,
                value: format!("{value:?}"),
            });
        }
        Ok(Component { protocol, value })
    }

    /// An `/ip4` or `/ip6` component, depending on the address family.
    pub fn ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Component {
                protocol: IP4,
                value: Value::Ip4(ip),
            },
            IpAddr::V6(ip) => Component {
                protocol: IP6,
                value: Value::Ip6(ip),
            },
        }
    }

    pub fn udp(port: u16) -> Self {
        Component {
            protocol: UDP,
            value: Value::Port(port),
        }
    }

    pub fn tcp(port: u16) -> Self {
        Component {
            protocol: TCP,
            value: Value::Port(port),
        }
    }

    pub fn p2p(peer: PeerId) -> Self {
        Component {
            protocol: P2P,
            value: Value::PeerId(peer),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        let mut buf = encode::u32_buffer();
        out.extend_from_slice(encode::u32(self.protocol.code, &mut buf));
        match &self.value {
            Value::None => {}
            Value::Ip4(ip) => out.extend_from_slice(&ip.octets()),
            Value::Ip6(ip) => out.extend_from_slice(&ip.octets()),
            Value::Port(port) => out.extend_from_slice(&port.to_be_bytes()),
            Value::Text(text) => write_length_prefixed(out, text.as_bytes()),
            Value::PeerId(peer) => write_length_prefixed(out, &peer.to_bytes()),
        }
    }

    /// Parses a single component from its binary form, returning the rest of the input.
    fn from_bytes(input: &[u8]) -> Result<(Self, &[u8]), Error> {
        let (code, input) = decode::u32(input).map_err(|_| Error::InvalidVarint)?;
        let protocol = protocol_by_code(code).ok_or(Error::UnknownProtocolCode(code))?;
        let invalid = |data: &[u8]| Error::InvalidValue {
            protocol: protocol.name,
            value: format!("{data:02x?}"),
        };

        let (value, rest) = match protocol.kind {
            ValueKind::None => (Value::None, input),
            ValueKind::Ip4 => {
                let (data, rest) = split_at(4, input)?;
                let octets = <[u8; 4]>::try_from(data).map_err(|_| invalid(data))?;
                (Value::Ip4(Ipv4Addr::from(octets)), rest)
            }
            ValueKind::Ip6 => {
                let (data, rest) = split_at(16, input)?;
                let octets = <[u8; 16]>::try_from(data).map_err(|_| invalid(data))?;
                (Value::Ip6(Ipv6Addr::from(octets)), rest)
            }
            ValueKind::Port => {
                let (data, rest) = split_at(2, input)?;
                (Value::Port(u16::from_be_bytes([data[0], data[1]])), rest)
            }
            ValueKind::Text => {
                let (n, input) = decode::usize(input).map_err(|_| Error::InvalidVarint)?;
                let (data, rest) = split_at(n, input)?;
                let text = str::from_utf8(data).map_err(|_| invalid(data))?;
                (Value::Text(text.to_owned()), rest)
            }
            ValueKind::PeerId => {
                let (n, input) = decode::usize(input).map_err(|_| Error::InvalidVarint)?;
                let (data, rest) = split_at(n, input)?;
                let peer = PeerId::from_bytes(data).map_err(|_| invalid(data))?;
                (Value::PeerId(peer), rest)
            }
        };

        Ok((Component { protocol, value }, rest))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.protocol.name)?;
        match &self.value {
            Value::None => Ok(()),
            Value::Ip4(ip) => write!(f, "/{ip}"),
            Value::Ip6(ip) => write!(f, "/{ip}"),
            Value::Port(port) => write!(f, "/{port}"),
            Value::Text(text) => write!(f, "/{text}"),
            Value::PeerId(peer) => write!(f, "/{peer}"),
        }
    }
}

fn write_length_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    let mut buf = encode::usize_buffer();
    out.extend_from_slice(encode::usize(data.len(), &mut buf));
    out.extend_from_slice(data);
}

fn split_at(n: usize, input: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    if input.len() < n {
        return Err(Error::DataLessThanLen);
    }
    Ok(input.split_at(n))
}

/// Representation of a multiaddr.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    components: Vec<Component>,
}

impl Multiaddr {
    /// Creates a new, empty multiaddress.
    pub fn empty() -> Self {
        Multiaddr::default()
    }

    /// Adds an already-parsed component to the end of this multiaddr.
    pub fn push(&mut self, component: Component) {
        self.components.push(component)
    }

    /// Like [`Multiaddr::push`] but consumes `self`.
    pub fn with(mut self, component: Component) -> Self {
        self.push(component);
        self
    }

    /// Removes and returns the last component.
    pub fn pop(&mut self) -> Option<Component> {
        self.components.pop()
    }

    pub fn iter(&self) -> slice::Iter<'_, Component> {
        self.components.iter()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Returns the binary wire form of this multiaddr.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for component in &self.components {
            component.write_bytes(&mut out);
        }
        out
    }
}

impl fmt::Display for Multiaddr {
    /// Converts a multiaddr into its text form, e.g. `/ip4/127.0.0.1/udp/4001/udx`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            component.fmt(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Error> {
        let mut parts = input.split('/').peekable();

        if Some("") != parts.next() {
            // A multiaddr must start with `/`.
            return Err(Error::InvalidMultiaddr);
        }

        let mut components = Vec::new();
        while let Some(part) = parts.next() {
            if part.is_empty() {
                // Only a single trailing slash is tolerated.
                if parts.peek().is_none() {
                    break;
                }
                return Err(Error::InvalidMultiaddr);
            }

            let protocol = protocol_by_name(part)
                .ok_or_else(|| Error::UnknownProtocolString(part.to_owned()))?;
            let value = match protocol.kind {
                ValueKind::None => Value::None,
                kind => {
                    let raw = parts.next().ok_or(Error::MissingValue(protocol.name))?;
                    Value::parse(kind, raw).ok_or_else(|| Error::InvalidValue {
                        protocol: protocol.name,
                        value: raw.to_owned(),
                    })?
                }
            };
            components.push(Component { protocol, value });
        }

        Ok(Multiaddr { components })
    }
}

impl TryFrom<&[u8]> for Multiaddr {
    type Error = Error;

    fn try_from(mut input: &[u8]) -> Result<Self, Error> {
        let mut components = Vec::new();
        while !input.is_empty() {
            let (component, rest) = Component::from_bytes(input)?;
            components.push(component);
            input = rest;
        }
        Ok(Multiaddr { components })
    }
}

impl TryFrom<Vec<u8>> for Multiaddr {
    type Error = Error;

    fn try_from(input: Vec<u8>) -> Result<Self, Error> {
        Multiaddr::try_from(input.as_slice())
    }
}

impl FromIterator<Component> for Multiaddr {
    fn from_iter<T: IntoIterator<Item = Component>>(iter: T) -> Self {
        Multiaddr {
            components: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Multiaddr {
    type Item = &'a Component;
    type IntoIter = slice::Iter<'a, Component>;

    fn into_iter(self) -> Self::IntoIter {
        self.components.iter()
    }
}

/// Errors produced while parsing, encoding or registering multiaddrs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid multiaddr")]
    InvalidMultiaddr,
    #[error("unknown protocol string {0:?}")]
    UnknownProtocolString(String),
    #[error("unknown protocol code {0:#x}")]
    UnknownProtocolCode(u32),
    #[error("protocol /{0} requires a value, none given")]
    MissingValue(&'static str),
    #[error("invalid value {value:?} for protocol /{protocol}")]
    InvalidValue {
        protocol: &'static str,
        value: String,
    },
    #[error("not enough bytes for the announced length")]
    DataLessThanLen,
    #[error("invalid varint")]
    InvalidVarint,
    #[error("protocol /{name} ({code:#x}) conflicts with an already registered protocol")]
    ProtocolConflict { name: &'static str, code: u32 },
}
