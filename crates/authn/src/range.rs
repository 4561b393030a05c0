//! Address and CIDR arithmetic.
//!
//! Pure functions that turn address text into closed numeric intervals and
//! test membership. IPv4 values live in the low 32 bits of a `u128`, IPv6
//! values use the full width; the two spaces are never compared.
//!
//! # Usable bounds
//!
//! Stored ranges record their first and last *usable* address:
//!
//! | Range            | First usable | Last usable     |
//! |------------------|--------------|-----------------|
//! | `4.148.0.0/16`   | `4.148.0.1`  | `4.148.255.254` |
//! | `10.0.0.8/31`    | `10.0.0.8`   | `10.0.0.9`      |
//! | `4.149.10.20`    | `4.149.10.20`| `4.149.10.20`   |
//! | `2001:db8::/126` | `2001:db8::` | `2001:db8::3`   |
//!
//! IPv4 prefixes shorter than /31 exclude the network and broadcast
//! addresses. IPv6 has no broadcast, so the whole prefix is usable.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use crate::error::{GateError, Result};

/// A parsed network: base address plus prefix length.
///
/// The stored address is always the network address; host bits supplied in
/// the text are cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

impl IpRange {
    /// Builds an IPv4 network from octets; host bits are cleared.
    ///
    /// `prefix` values above 32 are clamped to 32.
    #[must_use]
    pub const fn v4(octets: [u8; 4], prefix: u8) -> Self {
        let prefix = if prefix > 32 { 32 } else { prefix };
        let [a, b, c, d] = octets;
        let raw = Ipv4Addr::new(a, b, c, d).to_bits() & v4_mask(prefix);
        Self { network: IpAddr::V4(Ipv4Addr::from_bits(raw)), prefix }
    }

    /// The single-address network for `addr` (`/32` or `/128`).
    #[must_use]
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { network: addr, prefix }
    }

    /// Parses `a.b.c.d[/n]` or an IPv6 literal with optional `/n`.
    ///
    /// Without a prefix the result is a host route.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidFormat`] for anything that is not a
    /// well-formed address with an in-range prefix.
    ///
    /// # Examples
    ///
    /// ```
    /// use signgate_authn::range::IpRange;
    ///
    /// let range = IpRange::parse("4.148.0.0/16").unwrap();
    /// assert_eq!(range.prefix(), 16);
    /// assert!(IpRange::parse("4.148.0.0/33").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let (addr_text, prefix_text) = match trimmed.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (trimmed, None),
        };

        let addr: IpAddr = addr_text.parse().map_err(|_| GateError::invalid_format(trimmed))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };

        let prefix = match prefix_text {
            None => max,
            Some(p) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => p
                .parse::<u8>()
                .ok()
                .filter(|&n| n <= max)
                .ok_or_else(|| GateError::invalid_format(trimmed))?,
            Some(_) => return Err(GateError::invalid_format(trimmed)),
        };

        let network = match addr {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(prefix))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(prefix))),
        };
        Ok(Self { network, prefix })
    }

    /// Network (lowest) address.
    #[must_use]
    pub fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Returns `true` for IPv6 networks.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.network.is_ipv6()
    }

    /// Highest address covered by the prefix.
    #[must_use]
    pub fn last_address(&self) -> IpAddr {
        match self.network {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) | !v4_mask(self.prefix))),
            IpAddr::V6(v6) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) | !v6_mask(self.prefix)))
            },
        }
    }

    /// First and last usable addresses.
    #[must_use]
    pub fn bounds(&self) -> (IpAddr, IpAddr) {
        let (first, last) = self.numeric_bounds();
        (from_numeric(first, self.is_ipv6()), from_numeric(last, self.is_ipv6()))
    }

    /// Numeric form of [`bounds`](Self::bounds).
    #[must_use]
    pub fn numeric_bounds(&self) -> (u128, u128) {
        let network = to_numeric(self.network);
        let last = to_numeric(self.last_address());
        if self.network.is_ipv4() && self.prefix < 31 {
            (network + 1, last - 1)
        } else {
            (network, last)
        }
    }

    /// Returns `true` if `addr` lies anywhere in the prefix, network and
    /// last address included.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        let (network, last) = (to_numeric(self.network), to_numeric(self.last_address()));
        addr.is_ipv6() == self.is_ipv6() && contains(to_numeric(addr), network, last)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Parses a single address; prefixes are rejected.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are returned as IPv4.
///
/// # Errors
///
/// Returns [`GateError::InvalidFormat`] if `text` is not one address.
pub fn parse_address(text: &str) -> Result<IpAddr> {
    let trimmed = text.trim();
    trimmed
        .parse::<IpAddr>()
        .map(|addr| addr.to_canonical())
        .map_err(|_| GateError::invalid_format(trimmed))
}

/// Maps an address onto an order-preserving unsigned integer.
#[must_use]
pub fn to_numeric(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Inverse of [`to_numeric`] for the given family.
///
/// IPv4 values above `u32::MAX` saturate to `255.255.255.255`.
#[must_use]
pub fn from_numeric(value: u128, is_ipv6: bool) -> IpAddr {
    if is_ipv6 {
        IpAddr::V6(Ipv6Addr::from(value))
    } else {
        IpAddr::V4(Ipv4Addr::from(u32::try_from(value).unwrap_or(u32::MAX)))
    }
}

/// `first <= value <= last`.
#[must_use]
pub fn contains(value: u128, first: u128, last: u128) -> bool {
    first <= value && value <= last
}

const fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) }
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}
