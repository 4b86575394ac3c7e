//! Authentication traits for pluggable authentication methods
//!
//! Setters run on the client and fill in proofs, verifiers run on the server
//! and check them. Which method backs them is decided once, from configuration.

use crate::config::{AuthConfig, AuthMethod};
use crate::token::TokenAuth;
use std::sync::Arc;
use thiserror::Error;
use zap_proto::{Login, NewWorkConn, Ping};

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unsupported authentication method: {0}")]
    UnsupportedMethod(String),

    #[error("{0}")]
    Mismatch(&'static str),

    #[error("Token source error: {0}")]
    TokenSource(String),
}

/// Client side: stamps outgoing messages with an authentication proof
pub trait AuthSetter: Send + Sync {
    fn set_login(&self, login: &mut Login) -> Result<(), AuthError>;

    fn set_ping(&self, ping: &mut Ping) -> Result<(), AuthError>;

    fn set_new_work_conn(&self, msg: &mut NewWorkConn) -> Result<(), AuthError>;
}

/// Server side: recomputes and checks the proof carried by a message
///
/// Login proofs are always checked. Ping and NewWorkConn proofs are checked
/// only when the matching scope is configured.
pub trait AuthVerifier: Send + Sync {
    fn verify_login(&self, login: &Login) -> Result<(), AuthError>;

    fn verify_ping(&self, ping: &Ping) -> Result<(), AuthError>;

    fn verify_new_work_conn(&self, msg: &NewWorkConn) -> Result<(), AuthError>;
}

/// Build the client-side setter for a completed configuration
pub fn new_auth_setter(config: &AuthConfig) -> Result<Arc<dyn AuthSetter>, AuthError> {
    match config.method {
        AuthMethod::Token => Ok(Arc::new(TokenAuth::new(
            config.additional_scopes.iter().copied(),
            config.token.clone(),
        ))),
        AuthMethod::Oidc => Err(AuthError::UnsupportedMethod(config.method.to_string())),
    }
}

/// Build the server-side verifier for a completed configuration
pub fn new_auth_verifier(config: &AuthConfig) -> Result<Arc<dyn AuthVerifier>, AuthError> {
    match config.method {
        AuthMethod::Token => Ok(Arc::new(TokenAuth::new(
            config.additional_scopes.iter().copied(),
            config.token.clone(),
        ))),
        AuthMethod::Oidc => Err(AuthError::UnsupportedMethod(config.method.to_string())),
    }
}
