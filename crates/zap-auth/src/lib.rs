//! Authentication for the zap control protocol
//!
//! A client stamps its Login, Ping and NewWorkConn messages through an
//! [`AuthSetter`]; the server checks the same messages with an [`AuthVerifier`].
//! Both sides derive the proof from a shared token and the message timestamp.

pub mod config;
pub mod token;
pub mod validator;

pub use config::{
    AuthClientConfig, AuthConfig, AuthMethod, AuthScope, AuthServerConfig, FileSource, TokenSource,
};
pub use token::{auth_key, constant_time_eq, TokenAuth};
pub use validator::{new_auth_setter, new_auth_verifier, AuthError, AuthSetter, AuthVerifier};
