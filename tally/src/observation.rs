//! Observation keys and data points for the tally engine.
//!
//! These are the two inputs of every `add_data` call: a [`Key`] selecting
//! which running aggregate the observation belongs to, and an
//! [`Observation`] carrying the observed value itself. Keys are small
//! composites of optional alternative dimensions (a free-form string, a
//! host address, or a subnet); equality and hashing are over whichever
//! fields are populated, so two keys with the same populated dimensions
//! index the same aggregate.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// A network prefix: an address with its host bits zeroed plus a prefix
/// length.
///
/// Used both as a key dimension in its own right and as the result of
/// masking a host key through a filter's aggregation mask.
///
/// # Example
///
/// ```rust
/// use std::net::{IpAddr, Ipv4Addr};
/// use tally::Subnet;
///
/// let host = IpAddr::V4(Ipv4Addr::new(10, 0, 13, 7));
/// let net = Subnet::of(host, 24);
/// assert_eq!(net.to_string(), "10.0.13.0/24");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    /// The network address with host bits zeroed.
    pub addr: IpAddr,
    /// The prefix length in bits (0..=32 for v4, 0..=128 for v6).
    pub prefix: u8,
}

impl Subnet {
    /// Derives the subnet containing `host` for the given prefix length.
    ///
    /// Host bits beyond the prefix are zeroed. Prefix lengths larger than
    /// the address width are clamped (32 for IPv4, 128 for IPv6).
    pub fn of(host: IpAddr, prefix: u8) -> Self {
        match host {
            IpAddr::V4(v4) => {
                let prefix = prefix.min(32);
                let mask = if prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(prefix))
                };
                Self {
                    addr: IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask)),
                    prefix,
                }
            }
            IpAddr::V6(v6) => {
                let prefix = prefix.min(128);
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(prefix))
                };
                Self {
                    addr: IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask)),
                    prefix,
                }
            }
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Aggregation index distinguishing independent running aggregates.
///
/// A key is a composite of optional alternative dimensions. A brute-force
/// detector might key on `host` (one aggregate per attacking address), a
/// scan detector on `net` (one per /24), and an application-level metric
/// on a free-form `name` string. Dimensions can also be combined.
///
/// Equality and hashing are derived over all fields, so absence is part
/// of the identity: `Key::host(a)` and a key with the same host plus a
/// name are distinct indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Free-form string dimension.
    pub name: Option<String>,
    /// Host address dimension.
    pub host: Option<IpAddr>,
    /// Subnet dimension.
    pub net: Option<Subnet>,
}

impl Key {
    /// Creates a key with only the string dimension populated.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Creates a key with only the host dimension populated.
    pub fn host(host: IpAddr) -> Self {
        Self {
            host: Some(host),
            ..Self::default()
        }
    }

    /// Creates a key with only the subnet dimension populated.
    pub fn net(net: Subnet) -> Self {
        Self {
            net: Some(net),
            ..Self::default()
        }
    }

    /// Returns a copy of this key with the host dimension replaced by the
    /// subnet that contains it at the given prefix length.
    ///
    /// This is the aggregation-mask transformation: observations for
    /// individual hosts collapse onto one aggregate per network. Keys
    /// without a host dimension are returned unchanged.
    pub fn masked(&self, prefix: u8) -> Self {
        match self.host {
            Some(host) => Self {
                name: self.name.clone(),
                host: None,
                net: Some(Subnet::of(host, prefix)),
            },
            None => self.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if let Some(name) = &self.name {
            parts.push(name.clone());
        }
        if let Some(host) = &self.host {
            parts.push(host.to_string());
        }
        if let Some(net) = &self.net {
            parts.push(net.to_string());
        }
        if parts.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "{}", parts.join("/"))
        }
    }
}

/// A single keyed data point: exactly one of an unsigned count, a
/// floating-point value, or a string.
///
/// String observations contribute a default scalar of 1.0 to the numeric
/// calculations (each occurrence counts as one) while remaining eligible
/// for reservoir sampling, so a filter can both count failed-login
/// attempts and retain example usernames.
///
/// `Eq` and `Hash` are implemented over the exact bit pattern of float
/// values so observations can be members of the exact unique-value set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Observation {
    /// An unsigned count, e.g. bytes transferred.
    Count(u64),
    /// A floating-point measurement, e.g. a latency in seconds.
    Value(f64),
    /// A string sample, e.g. a username or URI.
    Text(String),
}

impl Observation {
    /// The scalar contribution of this observation to numeric
    /// calculations: the float value if present, else the count, else 1.0
    /// for strings.
    #[allow(clippy::cast_precision_loss)] // counts beyond 2^52 lose precision, accepted
    pub fn scalar(&self) -> f64 {
        match self {
            Self::Count(n) => *n as f64,
            Self::Value(v) => *v,
            Self::Text(_) => 1.0,
        }
    }

    /// The string payload, if this observation carries one.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for Observation {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Count(a), Self::Count(b)) => a == b,
            (Self::Value(a), Self::Value(b)) => a.to_bits() == b.to_bits(),
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Observation {}

impl std::hash::Hash for Observation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Self::Count(n) => n.hash(state),
            Self::Value(v) => v.to_bits().hash(state),
            Self::Text(s) => s.hash(state),
        }
    }
}
