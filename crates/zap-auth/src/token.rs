//! Shared-token authentication

use crate::config::AuthScope;
use crate::validator::{AuthError, AuthSetter, AuthVerifier};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use subtle::ConstantTimeEq;
use tracing::debug;
use zap_proto::{Login, NewWorkConn, Ping};

/// Compute the proof for a token at a timestamp
///
/// Lowercase hex of SHA-256 over the token followed by the decimal timestamp.
pub fn auth_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two proofs without leaking the position of the first difference
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Token authentication, usable as both setter and verifier
#[derive(Debug, Clone)]
pub struct TokenAuth {
    additional_scopes: HashSet<AuthScope>,
    token: String,
}

impl TokenAuth {
    pub fn new(scopes: impl IntoIterator<Item = AuthScope>, token: impl Into<String>) -> Self {
        Self {
            additional_scopes: scopes.into_iter().collect(),
            token: token.into(),
        }
    }

    fn has_scope(&self, scope: AuthScope) -> bool {
        self.additional_scopes.contains(&scope)
    }

    fn matches(&self, privilege_key: &str, timestamp: i64) -> bool {
        constant_time_eq(&auth_key(&self.token, timestamp), privilege_key)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl AuthSetter for TokenAuth {
    fn set_login(&self, login: &mut Login) -> Result<(), AuthError> {
        login.timestamp = now();
        login.privilege_key = auth_key(&self.token, login.timestamp);
        Ok(())
    }

    fn set_ping(&self, ping: &mut Ping) -> Result<(), AuthError> {
        if !self.has_scope(AuthScope::HeartBeats) {
            return Ok(());
        }
        ping.timestamp = now();
        ping.privilege_key = auth_key(&self.token, ping.timestamp);
        Ok(())
    }

    fn set_new_work_conn(&self, msg: &mut NewWorkConn) -> Result<(), AuthError> {
        if !self.has_scope(AuthScope::NewWorkConns) {
            return Ok(());
        }
        msg.timestamp = now();
        msg.privilege_key = auth_key(&self.token, msg.timestamp);
        Ok(())
    }
}

impl AuthVerifier for TokenAuth {
    fn verify_login(&self, login: &Login) -> Result<(), AuthError> {
        if !self.matches(&login.privilege_key, login.timestamp) {
            debug!(user = %login.user, "login proof mismatch");
            return Err(AuthError::Mismatch(
                "token in login doesn't match token from configuration",
            ));
        }
        Ok(())
    }

    fn verify_ping(&self, ping: &Ping) -> Result<(), AuthError> {
        if !self.has_scope(AuthScope::HeartBeats) {
            return Ok(());
        }
        if !self.matches(&ping.privilege_key, ping.timestamp) {
            return Err(AuthError::Mismatch(
                "token in heartbeat doesn't match token from configuration",
            ));
        }
        Ok(())
    }

    fn verify_new_work_conn(&self, msg: &NewWorkConn) -> Result<(), AuthError> {
        if !self.has_scope(AuthScope::NewWorkConns) {
            return Ok(());
        }
        if !self.matches(&msg.privilege_key, msg.timestamp) {
            return Err(AuthError::Mismatch(
                "token in NewWorkConn doesn't match token from configuration",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_auth_key_is_sha256_hex() {
        // sha256("abc123")
        assert_eq!(
            auth_key("abc", 123),
            "6ca13d52ca70c883e0f0bb101e425a89e8624de51db2d2392593af6a84118090"
        );
        assert_eq!(auth_key("abc", 123).len(), 64);
    }

    #[test]
    fn test_login_always_verified() {
        let auth = TokenAuth::new([], "secret");
        let login = Login {
            privilege_key: "bogus".to_string(),
            timestamp: 1,
            ..Default::default()
        };
        assert!(auth.verify_login(&login).is_err());

        let login = Login {
            privilege_key: auth_key("secret", 1),
            timestamp: 1,
            ..Default::default()
        };
        assert!(auth.verify_login(&login).is_ok());
    }

    #[test]
    fn test_ping_skipped_without_scope() {
        let auth = TokenAuth::new([], "secret");
        let ping = Ping {
            privilege_key: "bogus".to_string(),
            timestamp: 42,
        };
        assert!(auth.verify_ping(&ping).is_ok());

        let mut ping = Ping::default();
        auth.set_ping(&mut ping).unwrap();
        assert!(ping.privilege_key.is_empty());
    }

    #[test]
    fn test_ping_checked_with_scope() {
        let auth = TokenAuth::new([AuthScope::HeartBeats], "secret");
        let ping = Ping {
            privilege_key: auth_key("other", 42),
            timestamp: 42,
        };
        assert!(matches!(auth.verify_ping(&ping), Err(AuthError::Mismatch(_))));

        // Proof for a different timestamp is stale
        let ping = Ping {
            privilege_key: auth_key("secret", 41),
            timestamp: 42,
        };
        assert!(auth.verify_ping(&ping).is_err());
    }

    #[test]
    fn test_new_work_conn_scope() {
        let scoped = TokenAuth::new([AuthScope::NewWorkConns], "secret");
        let unscoped = TokenAuth::new([AuthScope::HeartBeats], "secret");
        let msg = NewWorkConn {
            run_id: "run".to_string(),
            privilege_key: String::new(),
            timestamp: 7,
        };
        assert!(scoped.verify_new_work_conn(&msg).is_err());
        assert!(unscoped.verify_new_work_conn(&msg).is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("abcd", "abc"));
        assert!(!constant_time_eq("", "a"));
    }

    fn median_batch(expected: &str, supplied: &str, batches: usize, per_batch: usize) -> Duration {
        let mut samples = Vec::with_capacity(batches);
        for _ in 0..batches {
            let start = Instant::now();
            for _ in 0..per_batch {
                std::hint::black_box(constant_time_eq(
                    std::hint::black_box(expected),
                    std::hint::black_box(supplied),
                ));
            }
            samples.push(start.elapsed());
        }
        samples.sort();
        samples[samples.len() / 2]
    }

    #[test]
    fn test_comparison_time_independent_of_mismatch_position() {
        let expected = auth_key("secret", 1_700_000_000);
        let flip = |pos: usize| {
            let mut bytes = expected.clone().into_bytes();
            bytes[pos] = if bytes[pos] == b'0' { b'1' } else { b'0' };
            String::from_utf8(bytes).unwrap()
        };
        let early = flip(0);
        let late = flip(expected.len() - 1);

        // Warm up, then interleave measurements so drift hits both sides
        median_batch(&expected, &early, 20, 1000);
        let mut ratios = Vec::new();
        for _ in 0..5 {
            let a = median_batch(&expected, &early, 101, 1000).as_nanos().max(1) as f64;
            let b = median_batch(&expected, &late, 101, 1000).as_nanos().max(1) as f64;
            ratios.push(a / b);
        }
        ratios.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let ratio = ratios[ratios.len() / 2];
        assert!(
            (0.5..2.0).contains(&ratio),
            "comparison time depends on mismatch position: ratio {ratio}"
        );
    }

    proptest! {
        #[test]
        fn any_single_byte_change_is_rejected(pos in 0usize..64, byte in any::<u8>(), ts in any::<i64>()) {
            let auth = TokenAuth::new([AuthScope::HeartBeats], "secret");
            let mut key = auth_key("secret", ts).into_bytes();
            prop_assume!(key[pos] != byte);
            key[pos] = byte;
            let ping = Ping {
                privilege_key: String::from_utf8_lossy(&key).into_owned(),
                timestamp: ts,
            };
            prop_assert!(auth.verify_ping(&ping).is_err());
        }
    }
}
