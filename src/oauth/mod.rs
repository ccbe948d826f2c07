/// OAuth 2.1 provider: PKCE + PAR + DPoP, with `none` and `private_key_jwt`
/// client authentication.
pub mod client;
pub mod dpop;
pub mod provider;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// How long a pushed authorization request stays redeemable
pub fn par_lifetime() -> Duration {
    Duration::seconds(300)
}

/// Access token lifetime
pub fn token_max_age() -> Duration {
    Duration::seconds(3600)
}

/// Freshness window for `private_key_jwt` client assertions
pub fn assertion_max_age() -> Duration {
    Duration::seconds(30)
}

/// Session/refresh lifetimes. Public clients are kept on a short leash;
/// confidential clients (attested by private_key_jwt) get long sessions.
pub struct SessionLimits {
    pub session_max_age: Duration,
    pub refresh_max_age: Duration,
}

pub fn session_limits(confidential: bool) -> SessionLimits {
    if confidential {
        SessionLimits {
            session_max_age: Duration::days(365),
            refresh_max_age: Duration::days(180),
        }
    } else {
        SessionLimits {
            session_max_age: Duration::days(7),
            refresh_max_age: Duration::days(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAge {
    pub session_expired: bool,
    pub refresh_expired: bool,
}

/// Age out a token row: the session clock starts at creation, the refresh
/// clock restarts on every rotation.
pub fn session_age(
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    confidential: bool,
    now: DateTime<Utc>,
) -> SessionAge {
    let limits = session_limits(confidential);
    SessionAge {
        session_expired: now - created_at > limits.session_max_age,
        refresh_expired: now - updated_at > limits.refresh_max_age,
    }
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Opaque token id carried in the access JWT `jti`
pub fn generate_token_id() -> String {
    format!("tok-{}", hex::encode(random_bytes(16)))
}

/// Refresh tokens are 32 random bytes, base64url
pub fn generate_refresh_token() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes(32))
}

/// Authorization codes are 32 random bytes, base64url
pub fn generate_code() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes(32))
}

/// PAR request ids are 32 random bytes, base64url
pub fn generate_request_id() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes(32))
}

pub fn encode_request_uri(request_id: &str) -> String {
    format!("{}{}", REQUEST_URI_PREFIX, request_id)
}

pub fn decode_request_uri(request_uri: &str) -> Option<&str> {
    request_uri.strip_prefix(REQUEST_URI_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uri_round_trip() {
        let id = generate_request_id();
        let uri = encode_request_uri(&id);
        assert_eq!(decode_request_uri(&uri), Some(id.as_str()));
        assert_eq!(decode_request_uri("urn:something:else"), None);
    }

    #[test]
    fn test_generated_tokens_are_distinct() {
        assert_ne!(generate_refresh_token(), generate_refresh_token());
        assert_ne!(generate_code(), generate_code());
        assert!(generate_token_id().starts_with("tok-"));
    }

    #[test]
    fn test_session_age_policy() {
        let now = Utc::now();

        // young session, fresh refresh
        let age = session_age(now - Duration::hours(1), now - Duration::hours(1), false, now);
        assert!(!age.session_expired);
        assert!(!age.refresh_expired);

        // public session past 7 days is over
        let age = session_age(now - Duration::days(8), now - Duration::hours(1), false, now);
        assert!(age.session_expired);

        // the same age is fine for a confidential client
        let age = session_age(now - Duration::days(8), now - Duration::hours(1), true, now);
        assert!(!age.session_expired);

        // stale refresh on a public client
        let age = session_age(now - Duration::days(3), now - Duration::days(3), false, now);
        assert!(age.refresh_expired);
    }
}
