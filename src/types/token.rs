//! Token Types
//!
//! Access/refresh token material and the refresh endpoint wire format.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// In-memory token state owned by the token manager.
#[derive(Clone, Default)]
pub struct TokenSet {
    /// Current access token.
    pub access_token: Option<SecretString>,
    /// Current refresh token.
    pub refresh_token: Option<SecretString>,
    /// Expiry of the access token. Only meaningful when `access_token` is set.
    pub access_expiry_date: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// Access token value, if any.
    pub fn access_token(&self) -> Option<String> {
        self.access_token
            .as_ref()
            .map(|token| token.expose_secret().to_string())
    }

    /// Refresh token value, if any.
    pub fn refresh_token(&self) -> Option<String> {
        self.refresh_token
            .as_ref()
            .map(|token| token.expose_secret().to_string())
    }

    /// Check whether `now` falls inside the expiry margin.
    ///
    /// An unset expiry date counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: std::time::Duration) -> bool {
        let Some(expiry) = self.access_expiry_date else {
            return true;
        };

        match Duration::from_std(margin) {
            Ok(margin) => match expiry.checked_sub_signed(margin) {
                Some(conservative_expiry) => now >= conservative_expiry,
                None => true,
            },
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("access_expiry_date", &self.access_expiry_date)
            .finish()
    }
}

/// Tokens handed to the manager after an issuance response.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTokens {
    /// Newly issued access token.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Newly issued refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    #[serde(default)]
    pub expires_in_seconds: Option<u64>,
}

impl NewTokens {
    /// Access token update, present only when both token and lifetime are usable.
    pub fn access_update(&self) -> Option<(&str, u64)> {
        match (self.access_token.as_deref(), self.expires_in_seconds) {
            (Some(token), Some(secs)) if !token.is_empty() && secs > 0 => Some((token, secs)),
            _ => None,
        }
    }

    /// Refresh token update, if a non-empty one is present.
    pub fn refresh_update(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|token| !token.is_empty())
    }
}

/// Access token as persisted by a token store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredAccessToken {
    /// Token value.
    pub token: String,
    /// Persisted expiry, if one was recorded.
    pub expiry_date: Option<DateTime<Utc>>,
}

/// Body of the refresh endpoint request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: Option<&'a str>,
}

/// Body of the refresh endpoint response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in_seconds: Option<u64>,
}

/// Result of a refresh attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Token was still outside the expiry margin; nothing was sent.
    NotNeeded,
    /// A new access token was applied.
    Refreshed { expires_at: DateTime<Utc> },
    /// The endpoint answered without a usable token. Prior state is kept.
    Rejected { reason: String },
}
