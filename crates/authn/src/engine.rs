//! Per-request gate decisions.
//!
//! [`GateEngine`] holds no persistent state. It reads the settings it was
//! built with and consults the [`AllowListStore`] and [`TokenStore`].
//!
//! # Stages
//!
//! ```text
//! whitelist stage (EnableIPsWhitelist)
//!   loopback + BypassAuthenticationLoopback ──► allow
//!   reserved block enabled in the table     ──► allow
//!   allow-list contains caller              ──► allow
//!   otherwise                               ──► Forbidden
//!
//! token stage (EnableAuthentication)
//!   Authorization: <scheme> <token>
//!   missing / empty / unknown / revoked     ──► Unauthorized
//!   otherwise                               ──► Identity
//! ```
//!
//! Loopback skips the whitelist stage only; the token stage still runs.

use std::{net::IpAddr, sync::Arc};

use tracing::{trace, warn};

use crate::{
    allow_list::AllowListStore,
    error::{GateError, Result},
    range::IpRange,
    settings::GateSettings,
    tokens::{Identity, TokenStore},
};

/// Carrier-grade NAT block.
pub const CGNAT_BLOCK: IpRange = IpRange::v4([100, 64, 0, 0], 10);
/// Private class A block.
pub const CLASS_A_BLOCK: IpRange = IpRange::v4([10, 0, 0, 0], 8);
/// Private class B block.
pub const CLASS_B_BLOCK: IpRange = IpRange::v4([172, 16, 0, 0], 12);
/// Private class C block.
pub const CLASS_C_BLOCK: IpRange = IpRange::v4([192, 168, 0, 0], 16);

/// Outcome of the whitelist stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Decision {
    /// Continue to the next stage.
    Allow,
    /// Reject the request.
    Deny,
}

/// One row of the reserved-range table: the block is let through when
/// `enabled`; a `None` block matches every reserved address.
pub type ReservedRule = (bool, Option<IpRange>);

/// Builds the reserved-range table in evaluation order.
#[must_use]
pub fn reserved_table(settings: &GateSettings) -> [ReservedRule; 5] {
    [
        (settings.allow_cgnat_ips, Some(CGNAT_BLOCK)),
        (settings.allow_all_private_iana_reserved_ips, None),
        (settings.allow_class_a_reserved_ips, Some(CLASS_A_BLOCK)),
        (settings.allow_class_b_reserved_ips, Some(CLASS_B_BLOCK)),
        (settings.allow_class_c_reserved_ips, Some(CLASS_C_BLOCK)),
    ]
}

/// Returns `true` for addresses in the private class A/B/C blocks or the
/// CGNAT block.
#[must_use]
pub fn is_iana_reserved(addr: IpAddr) -> bool {
    let addr = addr.to_canonical();
    [CLASS_A_BLOCK, CLASS_B_BLOCK, CLASS_C_BLOCK, CGNAT_BLOCK]
        .iter()
        .any(|block| block.contains(addr))
}

/// Extracts the credential from an `Authorization` header value.
///
/// The text after the first space is the token; the scheme is discarded
/// unchecked. A value without a space is taken whole. A scheme followed only
/// by whitespace carries no token.
///
/// # Examples
///
/// ```
/// use signgate_authn::engine::extract_token;
///
/// assert_eq!(extract_token("Bearer abc"), Some("abc"));
/// assert_eq!(extract_token("abc"), Some("abc"));
/// assert_eq!(extract_token("Bearer   "), None);
/// ```
#[must_use]
pub fn extract_token(header: &str) -> Option<&str> {
    let token = match header.trim_start().split_once(' ') {
        Some((_, rest)) => rest.trim(),
        None => header.trim(),
    };
    (!token.is_empty()).then_some(token)
}

/// Applies the whitelist and token stages.
#[derive(Debug, Clone)]
pub struct GateEngine {
    settings: Arc<GateSettings>,
    reserved: [ReservedRule; 5],
    allow_list: AllowListStore,
    tokens: TokenStore,
}

impl GateEngine {
    /// Creates an engine. `settings` are expected to be validated already.
    pub fn new(
        settings: Arc<GateSettings>,
        allow_list: AllowListStore,
        tokens: TokenStore,
    ) -> Self {
        let reserved = reserved_table(&settings);
        Self { settings, reserved, allow_list, tokens }
    }

    /// Settings the engine was built with.
    #[must_use]
    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    /// Decides the whitelist stage for `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Storage`] if the allow-list cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn check_whitelist(&self, addr: IpAddr) -> Result<Decision> {
        if !self.settings.enable_ips_whitelist {
            return Ok(Decision::Allow);
        }
        let addr = addr.to_canonical();

        if self.settings.bypass_authentication_loopback && addr.is_loopback() {
            trace!(%addr, "loopback bypass");
            return Ok(Decision::Allow);
        }

        if is_iana_reserved(addr)
            && self
                .reserved
                .iter()
                .any(|(enabled, block)| *enabled && block.is_none_or(|b| b.contains(addr)))
        {
            trace!(%addr, "reserved range bypass");
            return Ok(Decision::Allow);
        }

        if self.allow_list.contains(addr).await? {
            Ok(Decision::Allow)
        } else {
            Ok(Decision::Deny)
        }
    }

    /// Runs the whitelist stage, turning a denial into an error.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Forbidden`] when the caller is not allowed.
    pub async fn enforce_whitelist(&self, addr: IpAddr) -> Result<()> {
        match self.check_whitelist(addr).await? {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                warn!(remote_addr = %addr, "request from remote address is forbidden");
                Err(GateError::forbidden(addr.to_string()))
            },
        }
    }

    /// Runs the token stage on the raw `Authorization` header value.
    ///
    /// Returns `Ok(None)` when authentication is disabled.
    ///
    /// # Errors
    ///
    /// - [`GateError::Unauthorized`] for a missing, empty, unknown, or
    ///   revoked token
    /// - [`GateError::Storage`] if the token store cannot be read
    #[tracing::instrument(skip_all)]
    pub async fn authenticate(&self, header: Option<&str>) -> Result<Option<Identity>> {
        if !self.settings.enable_authentication {
            return Ok(None);
        }

        let token = header.and_then(extract_token).ok_or(GateError::Unauthorized)?;
        match self.tokens.validate(token).await {
            Ok(record) => Ok(Some(Identity::from(&record))),
            Err(GateError::NotFound(_)) => Err(GateError::Unauthorized),
            Err(other) => Err(other),
        }
    }

    /// Runs both stages: whitelist first, then token.
    ///
    /// # Errors
    ///
    /// The first terminal error of either stage.
    pub async fn evaluate(&self, addr: IpAddr, header: Option<&str>) -> Result<Option<Identity>> {
        self.enforce_whitelist(addr).await?;
        self.authenticate(header).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use signgate_storage::{CacheAside, CacheConfig, MemoryCacheBackend, MemoryRepository};

    use super::*;

    fn engine(settings: GateSettings) -> GateEngine {
        let repo = Arc::new(MemoryRepository::new());
        let cache = CacheAside::new(Arc::new(MemoryCacheBackend::new(&CacheConfig::default())));
        let ttl = Duration::from_secs(3600);
        GateEngine::new(
            Arc::new(settings),
            AllowListStore::new(repo.clone(), cache.clone(), ttl),
            TokenStore::new(repo, cache, ttl),
        )
    }

    fn whitelist_only() -> GateSettings {
        GateSettings {
            enable_ips_whitelist: true,
            enable_authentication: false,
            ..GateSettings::default()
        }
    }

    fn addr(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[rstest]
    #[case::bearer("Bearer abc", Some("abc"))]
    #[case::other_scheme("Token abc", Some("abc"))]
    #[case::bare("abc", Some("abc"))]
    #[case::padded("  Bearer   abc  ", Some("abc"))]
    #[case::empty("", None)]
    #[case::scheme_only("Bearer ", None)]
    #[case::scheme_then_spaces("  Bearer   ", None)]
    #[case::whitespace_only("   ", None)]
    fn header_parsing(#[case] header: &str, #[case] expected: Option<&str>) {
        assert_eq!(extract_token(header), expected);
    }

    #[rstest]
    #[case::class_a("10.1.2.3", true)]
    #[case::class_b("172.31.255.1", true)]
    #[case::class_b_edge("172.32.0.1", false)]
    #[case::class_c("192.168.4.4", true)]
    #[case::cgnat("100.100.0.1", true)]
    #[case::public("8.8.8.8", false)]
    #[case::mapped("::ffff:10.0.0.1", true)]
    #[case::v6("2001:db8::1", false)]
    fn reserved_detection(#[case] text: &str, #[case] reserved: bool) {
        assert_eq!(is_iana_reserved(addr(text)), reserved);
    }

    #[rstest]
    #[case::nothing_enabled(GateSettings::default(), "10.0.0.5", Decision::Deny)]
    #[case::class_a(
        GateSettings { allow_class_a_reserved_ips: true, ..GateSettings::default() },
        "10.0.0.5",
        Decision::Allow
    )]
    #[case::class_a_does_not_cover_c(
        GateSettings { allow_class_a_reserved_ips: true, ..GateSettings::default() },
        "192.168.1.1",
        Decision::Deny
    )]
    #[case::class_b(
        GateSettings { allow_class_b_reserved_ips: true, ..GateSettings::default() },
        "172.16.9.9",
        Decision::Allow
    )]
    #[case::class_c(
        GateSettings { allow_class_c_reserved_ips: true, ..GateSettings::default() },
        "192.168.1.1",
        Decision::Allow
    )]
    #[case::cgnat(
        GateSettings { allow_cgnat_ips: true, ..GateSettings::default() },
        "100.64.0.9",
        Decision::Allow
    )]
    #[case::allow_all(
        GateSettings {
            allow_all_private_iana_reserved_ips: true,
            allow_class_a_reserved_ips: true,
            allow_class_b_reserved_ips: true,
            allow_class_c_reserved_ips: true,
            ..GateSettings::default()
        },
        "100.64.0.9",
        Decision::Allow
    )]
    #[case::reserved_flags_do_not_cover_public(
        GateSettings { allow_class_a_reserved_ips: true, ..GateSettings::default() },
        "8.8.8.8",
        Decision::Deny
    )]
    #[tokio::test]
    async fn reserved_table_decisions(
        #[case] flags: GateSettings,
        #[case] caller: &str,
        #[case] expected: Decision,
    ) {
        let settings = GateSettings { enable_ips_whitelist: true, ..flags };
        let engine = engine(settings);
        assert_eq!(engine.check_whitelist(addr(caller)).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn whitelist_disabled_allows_everyone() {
        let engine = engine(GateSettings::default());
        assert_eq!(engine.check_whitelist(addr("203.0.113.9")).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn loopback_bypasses_empty_allow_list() {
        let engine = engine(whitelist_only());
        assert_eq!(engine.check_whitelist(addr("127.0.0.1")).await.unwrap(), Decision::Allow);
        assert_eq!(engine.check_whitelist(addr("::1")).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn loopback_bypass_can_be_turned_off() {
        let engine =
            engine(GateSettings { bypass_authentication_loopback: false, ..whitelist_only() });
        assert_eq!(engine.check_whitelist(addr("127.0.0.1")).await.unwrap(), Decision::Deny);
    }

    #[tokio::test]
    async fn allow_list_entry_is_honoured() {
        let engine = engine(whitelist_only());
        engine.allow_list.add(&["203.0.113.0/24"], "partner").await.unwrap();
        engine.enforce_whitelist(addr("203.0.113.9")).await.unwrap();
        let err = engine.enforce_whitelist(addr("198.51.100.1")).await.unwrap_err();
        assert!(matches!(err, GateError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn authentication_disabled_yields_no_identity() {
        let settings = GateSettings { enable_authentication: false, ..GateSettings::default() };
        let engine = engine(settings);
        assert_eq!(engine.authenticate(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_or_unknown_token_is_unauthorized() {
        let engine = engine(GateSettings::default());
        for header in [None, Some("Bearer "), Some("Bearer nope")] {
            let result = engine.authenticate(header).await;
            assert!(matches!(result, Err(GateError::Unauthorized)), "{header:?}");
        }
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let engine = engine(GateSettings::default());
        let issued = engine.tokens.issue("release").await.unwrap();
        let header = format!("Bearer {}", issued.token.as_str());

        let identity = engine.authenticate(Some(header.as_str())).await.unwrap().unwrap();
        assert_eq!(identity.token_id, issued.id);
        assert_eq!(identity.token_description, "release");
    }

    #[tokio::test]
    async fn loopback_still_needs_a_token() {
        let engine = engine(GateSettings { enable_ips_whitelist: true, ..GateSettings::default() });
        let err = engine.evaluate(addr("127.0.0.1"), None).await.unwrap_err();
        assert!(matches!(err, GateError::Unauthorized));
    }
}
