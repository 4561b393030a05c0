//! Record types owned by the persistence collaborator.
//!
//! Two record kinds are stored: [`AuthToken`] (revocable bearer credentials)
//! and [`AllowListRange`] (explicitly allowed IPv4/IPv6 ranges). Neither is
//! ever physically deleted; tokens are revoked and ranges deactivated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Macro to define a newtype wrapper around `i64` with standard trait
/// implementations.
///
/// Each generated type:
/// - Is a transparent wrapper around `i64` (zero runtime cost)
/// - Derives `Copy`, `Clone`, `Debug`, `Default`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Derives `Serialize` and `Deserialize` (transparent)
/// - Implements `From<i64>` and `Into<i64>`
/// - Implements `Display` that outputs the inner value
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of an [`AuthToken`], assigned by the store.
    ///
    /// Ids are positive and never reused. The unassigned value is `0`.
    ///
    /// # Examples
    ///
    /// ```
    /// use signgate_storage::TokenId;
    ///
    /// let id = TokenId::from(7);
    /// assert_eq!(i64::from(id), 7);
    /// assert_eq!(id.to_string(), "7");
    /// ```
    TokenId
);

define_id!(
    /// Identifier of an [`AllowListRange`], assigned by the store.
    RangeId
);

/// Id of the reserved system token seeded into every store.
pub const SYSTEM_TOKEN_ID: TokenId = TokenId(1);

/// Description of the reserved system token.
pub const SYSTEM_TOKEN_DESCRIPTION: &str = "System";

/// Value of the reserved system token.
pub const SYSTEM_TOKEN_VALUE: &str = "SYSTEM";

/// A revocable bearer credential.
///
/// The `token` value is unique across all records. A record only ever
/// changes by flipping `is_revoked` to `true` and stamping `revoked_at`.
///
/// # Example
///
/// ```
/// use signgate_storage::AuthToken;
///
/// let token = AuthToken::builder()
///     .token("c2VjcmV0LXZhbHVl".to_owned())
///     .description("build server")
///     .build();
///
/// assert!(!token.is_revoked);
/// assert_eq!(i64::from(token.id), 0, "id is assigned on insert");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
pub struct AuthToken {
    /// Store-assigned identifier (`0` until inserted).
    #[builder(default)]
    pub id: TokenId,

    /// Opaque credential presented by callers.
    #[builder(into)]
    pub token: Zeroizing<String>,

    /// Human label of the token holder.
    #[builder(into)]
    pub description: String,

    /// Whether the token has been revoked.
    #[builder(default)]
    pub is_revoked: bool,

    /// Creation time.
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    /// Revocation time, set exactly once.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AuthToken {
    /// Returns `true` for the reserved system token.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_TOKEN_ID
    }

    /// Returns `true` when the token can authenticate a request.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.is_revoked && !self.is_system()
    }
}

/// An explicitly allowed address range.
///
/// `literal` is the text as supplied by the operator and is unique among all
/// records, active or not. Bounds are derived from `literal` when the record
/// is created and never edited afterwards.
///
/// Numeric bounds are stored as `u128` so IPv6 ranges fit; IPv4 bounds live
/// in the low 32 bits. `is_ipv6` records which space the bounds belong to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct AllowListRange {
    /// Store-assigned identifier (`0` until inserted).
    #[builder(default)]
    pub id: RangeId,

    /// Original CIDR or address text.
    #[builder(into)]
    pub literal: String,

    /// Human label supplied with the allow request.
    #[builder(into)]
    pub description: String,

    /// Text form of the first usable address.
    #[builder(into)]
    pub first_usable: String,

    /// Text form of the last usable address.
    #[builder(into)]
    pub last_usable: String,

    /// Numeric form of `first_usable`.
    pub first_usable_numeric: u128,

    /// Numeric form of `last_usable`.
    pub last_usable_numeric: u128,

    /// Address family of the bounds.
    #[builder(default)]
    pub is_ipv6: bool,

    /// Whether the range currently grants access.
    #[builder(default = true)]
    pub is_active: bool,
}

impl AllowListRange {
    /// Returns `true` if `numeric` of the given family lies inside this range.
    ///
    /// Addresses of the other family never match.
    #[must_use]
    pub fn contains_numeric(&self, numeric: u128, is_ipv6: bool) -> bool {
        self.is_ipv6 == is_ipv6
            && self.first_usable_numeric <= numeric
            && numeric <= self.last_usable_numeric
    }
}
