//! Authentication configuration

use crate::validator::AuthError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Authentication method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Token,
    /// Recognised in configuration files, rejected when building setters/verifiers
    Oidc,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Token => write!(f, "token"),
            AuthMethod::Oidc => write!(f, "oidc"),
        }
    }
}

/// Message kinds that additionally require an authentication proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthScope {
    HeartBeats,
    NewWorkConns,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSource {
    pub path: PathBuf,
}

/// Where to load the token from when it is not written inline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSource>,
}

impl TokenSource {
    /// Load the value this source points at, trimmed of surrounding whitespace
    pub fn resolve(&self) -> Result<String, AuthError> {
        match self.kind.as_str() {
            "file" => {
                let file = self.file.as_ref().ok_or_else(|| {
                    AuthError::TokenSource("file configuration is required".to_string())
                })?;
                let content = std::fs::read_to_string(&file.path).map_err(|e| {
                    AuthError::TokenSource(format!(
                        "failed to read {}: {}",
                        file.path.display(),
                        e
                    ))
                })?;
                Ok(content.trim().to_string())
            }
            other => Err(AuthError::TokenSource(format!(
                "unsupported token source type: {other:?}"
            ))),
        }
    }
}

/// Authentication settings shared by client and server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub additional_scopes: Vec<AuthScope>,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_source: Option<TokenSource>,
}

pub type AuthServerConfig = AuthConfig;
pub type AuthClientConfig = AuthConfig;

impl AuthConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<AuthScope>) -> Self {
        self.additional_scopes = scopes;
        self
    }

    /// Resolve the token source once; afterwards `token` holds the secret
    pub fn complete(&mut self) -> Result<(), AuthError> {
        if let Some(source) = self.token_source.take() {
            if !self.token.is_empty() {
                return Err(AuthError::TokenSource(
                    "cannot specify both token and tokenSource".to_string(),
                ));
            }
            self.token = source.resolve()?;
        }
        self.additional_scopes.sort_by_key(|scope| *scope as u8);
        self.additional_scopes.dedup();
        Ok(())
    }
}
