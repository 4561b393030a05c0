//! Gate configuration.
//!
//! [`GateSettings`] is deserialized from the service's configuration source
//! and validated once at startup; the validated value is then passed down
//! explicitly to every component that needs it.
//!
//! Field names accept both `snake_case` and the PascalCase spellings used by
//! existing deployments:
//!
//! ```
//! use signgate_authn::GateSettings;
//!
//! let settings: GateSettings = serde_json::from_str(
//!     r#"{ "EnableIPsWhitelist": true, "AllowCGNatIPs": true }"#,
//! ).unwrap();
//! assert!(settings.enable_ips_whitelist);
//! assert!(settings.enable_authentication, "authentication is on by default");
//! settings.validate().unwrap();
//! ```

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use signgate_storage::CacheConfig;

use crate::error::{GateError, Result};

/// Default lifetime of the cached active-token and active-range lists.
pub const DEFAULT_LIST_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Default cache capacity.
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 10_000;

fn default_true() -> bool {
    true
}

fn default_known_proxies() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)]
}

fn default_list_ttl() -> Duration {
    DEFAULT_LIST_TTL
}

fn default_max_entries() -> u64 {
    DEFAULT_CACHE_MAX_ENTRIES
}

/// Access-control settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Enforce the IP allow-list.
    #[serde(alias = "EnableIPsWhitelist")]
    pub enable_ips_whitelist: bool,

    /// Enforce bearer-token authentication.
    #[serde(alias = "EnableAuthentication", default = "default_true")]
    pub enable_authentication: bool,

    /// Let loopback callers skip the allow-list (not the token check).
    /// Only consulted when the allow-list is enabled.
    #[serde(alias = "BypassAuthenticationLoopback", default = "default_true")]
    pub bypass_authentication_loopback: bool,

    /// Let every reserved private block through the allow-list.
    #[serde(alias = "AllowAllPrivateIanaReservedIPs")]
    pub allow_all_private_iana_reserved_ips: bool,

    /// Let `10.0.0.0/8` through the allow-list.
    #[serde(alias = "AllowClassAReservedIPs")]
    pub allow_class_a_reserved_ips: bool,

    /// Let `172.16.0.0/12` through the allow-list.
    #[serde(alias = "AllowClassBReservedIPs")]
    pub allow_class_b_reserved_ips: bool,

    /// Let `192.168.0.0/16` through the allow-list.
    #[serde(alias = "AllowClassCReservedIPs")]
    pub allow_class_c_reserved_ips: bool,

    /// Let carrier-grade NAT space (`100.64.0.0/10`) through the allow-list.
    #[serde(alias = "AllowCGNatIPs")]
    pub allow_cgnat_ips: bool,

    /// Resolve the caller from `X-Forwarded-For` instead of the socket peer,
    /// for requests whose peer is one of `known_proxies`.
    #[serde(alias = "TrustForwardedHeaders")]
    pub trust_forwarded_headers: bool,

    /// Peers allowed to supply `X-Forwarded-For`. Loopback by default.
    #[serde(alias = "KnownProxies", default = "default_known_proxies")]
    pub known_proxies: Vec<IpAddr>,

    /// Include internal error detail in response bodies.
    #[serde(alias = "DebugErrors")]
    pub debug_errors: bool,

    /// Cache tuning.
    #[serde(alias = "Cache")]
    pub cache: CacheSettings,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            enable_ips_whitelist: false,
            enable_authentication: true,
            bypass_authentication_loopback: true,
            allow_all_private_iana_reserved_ips: false,
            allow_class_a_reserved_ips: false,
            allow_class_b_reserved_ips: false,
            allow_class_c_reserved_ips: false,
            allow_cgnat_ips: false,
            trust_forwarded_headers: false,
            known_proxies: default_known_proxies(),
            debug_errors: false,
            cache: CacheSettings::default(),
        }
    }
}

/// Cache lifetimes and capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Lifetime of the cached active-token list.
    #[serde(with = "humantime_serde", alias = "TokenListTtl", default = "default_list_ttl")]
    pub token_list_ttl: Duration,

    /// Lifetime of the cached active-range list.
    #[serde(with = "humantime_serde", alias = "RangeListTtl", default = "default_list_ttl")]
    pub range_list_ttl: Duration,

    /// Maximum number of cache entries.
    #[serde(alias = "MaxEntries", default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            token_list_ttl: DEFAULT_LIST_TTL,
            range_list_ttl: DEFAULT_LIST_TTL,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl CacheSettings {
    /// Builds a validated [`CacheConfig`] whose lifetime cap covers both lists.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfiguration`] for a zero capacity or a
    /// lifetime under one second.
    pub fn cache_config(&self) -> Result<CacheConfig> {
        CacheConfig::builder()
            .max_entries(self.max_entries)
            .ttl(self.token_list_ttl.max(self.range_list_ttl))
            .build()
            .map_err(|e| GateError::invalid_configuration(e.to_string()))
    }
}

impl GateSettings {
    /// Checks cross-field rules.
    ///
    /// Allowing every reserved block while disallowing one of the class
    /// blocks is contradictory and rejected.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::InvalidConfiguration`] naming the first violated
    /// rule.
    pub fn validate(&self) -> Result<()> {
        if self.allow_all_private_iana_reserved_ips {
            let classes = [
                ("A", self.allow_class_a_reserved_ips),
                ("B", self.allow_class_b_reserved_ips),
                ("C", self.allow_class_c_reserved_ips),
            ];
            if let Some((class, _)) = classes.iter().find(|(_, allowed)| !allowed) {
                return Err(GateError::invalid_configuration(format!(
                    "Cannot disallow Class {class} reserved IPs when IANA reserved IPs are allowed"
                )));
            }
        }
        if self.trust_forwarded_headers && self.known_proxies.is_empty() {
            return Err(GateError::invalid_configuration(
                "KnownProxies must not be empty when forwarded headers are trusted",
            ));
        }
        let ttls = [
            ("token_list_ttl", self.cache.token_list_ttl),
            ("range_list_ttl", self.cache.range_list_ttl),
        ];
        for (field, ttl) in ttls {
            if ttl < Duration::from_secs(1) {
                return Err(GateError::invalid_configuration(format!(
                    "{field} must be at least 1s, got {}ms",
                    ttl.as_millis()
                )));
            }
        }
        self.cache.cache_config().map(|_| ())
    }
}
