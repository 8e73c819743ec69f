//! Client identity used as the admission key (spec §3 NetworkEndpoint).

use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// A capability-object identifying a client by address.
///
/// Equality and hashing are by normalized address content: two addresses
/// that map to the same underlying client (an IPv4-mapped IPv6 form of an
/// IPv4 address, e.g. `::ffff:10.0.0.1`) are folded onto a single canonical
/// key before use, so they share one [`crate::token_bucket::EndpointState`].
#[derive(Debug, Clone, Eq)]
pub struct NetworkEndpoint {
    address: String,
}

impl NetworkEndpoint {
    pub fn new(address: impl Into<String>) -> Self {
        let raw = address.into();
        let address = normalize(&raw);
        Self { address }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stable 32-bit hash of the normalized address, used by
    /// [`crate::token_bucket`] for shard selection.
    pub fn stable_hash(&self) -> u32 {
        fnv1a_32(self.address.as_bytes())
    }
}

impl PartialEq for NetworkEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Hash for NetworkEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// `(opcode, endpoint)` composite key used inside a `TokenBucketLimiter`
/// shared across many opcodes that quantize to the same policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeEndpointKey {
    pub opcode: u16,
    pub endpoint: NetworkEndpoint,
}

impl CompositeEndpointKey {
    pub fn new(opcode: u16, endpoint: NetworkEndpoint) -> Self {
        Self { opcode, endpoint }
    }
}

/// Normalize an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`, with or without
/// a `[..]:port` suffix) down to its plain IPv4 form. Addresses that do not
/// parse as an IP (unix-domain identifiers, opaque test keys, ...) pass
/// through unchanged.
fn normalize(raw: &str) -> String {
    if let Ok(sock) = raw.parse::<SocketAddr>() {
        return match sock {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => format!("{v4}:{}", v6.port()),
                None => sock.to_string(),
            },
            SocketAddr::V4(_) => sock.to_string(),
        };
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(|v4| v4.to_string()).unwrap_or(raw.to_string()),
            IpAddr::V4(_) => raw.to_string(),
        };
    }
    raw.to_string()
}

/// FNV-1a, 32-bit variant. Deterministic across processes (unlike
/// `std::collections::hash_map::RandomState`), which the avalanche mix in
/// `token_bucket`'s sharding relies on for reproducible shard placement
/// within a single run.
pub(crate) fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_mapped_ipv6_normalizes_to_ipv4() {
        let a = NetworkEndpoint::new("10.0.0.1");
        let b = NetworkEndpoint::new("::ffff:10.0.0.1");
        assert_eq!(a, b);
        assert_eq!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn ipv4_mapped_ipv6_with_port_normalizes() {
        let a = NetworkEndpoint::new("10.0.0.1:8080");
        let b = NetworkEndpoint::new("[::ffff:10.0.0.1]:8080");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_addresses_are_distinct() {
        let a = NetworkEndpoint::new("10.0.0.1");
        let b = NetworkEndpoint::new("10.0.0.2");
        assert_ne!(a, b);
    }

    #[test]
    fn opaque_addresses_pass_through() {
        let a = NetworkEndpoint::new("unix:/tmp/socket");
        assert_eq!(a.address(), "unix:/tmp/socket");
    }

    #[test]
    fn composite_key_equality_is_pointwise() {
        let e1 = NetworkEndpoint::new("10.0.0.1");
        let e2 = NetworkEndpoint::new("10.0.0.1");
        let k1 = CompositeEndpointKey::new(7, e1);
        let k2 = CompositeEndpointKey::new(7, e2);
        assert_eq!(k1, k2);
        let k3 = CompositeEndpointKey::new(8, NetworkEndpoint::new("10.0.0.1"));
        assert_ne!(k1, k3);
    }
}
