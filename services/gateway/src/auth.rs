//! Connection identification without the command server.
//!
//! When a JWT secret is configured, a valid token carried in the configured
//! query param (or a header of the same name) supplies the session
//! identifiers directly and skips the Connect RPC. `jwt_force` turns a
//! missing token into a rejection; `skip_auth` accepts everyone (local
//! development).

use gw_protocol::SessionEnv;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Query param / header carrying the token.
    pub jwt_param: String,
    pub jwt_secret: Option<String>,
    /// Reject connections without a token instead of falling back to RPC.
    pub jwt_force: bool,
    /// Accept every connection with empty identifiers.
    pub skip_auth: bool,
}

impl AuthConfig {
    pub fn new() -> Self {
        AuthConfig {
            jwt_param: "jid".to_owned(),
            ..AuthConfig::default()
        }
    }
}

/// What the entry point should do with a fresh connection.
#[derive(Debug, PartialEq, Eq)]
pub enum Identification {
    /// Accept with these identifiers; no RPC needed.
    Approved { identifiers: String },
    /// Close with an unauthorized disconnect.
    Rejected,
    /// Fall through to the Connect RPC.
    Rpc,
}

#[derive(Debug, Deserialize)]
struct Claims {
    /// Serialized identifiers, stored verbatim as the session identity.
    ext: String,
    #[allow(dead_code)]
    exp: usize,
}

pub fn identify(env: &SessionEnv, config: &AuthConfig) -> Identification {
    if config.skip_auth {
        return Identification::Approved {
            identifiers: String::new(),
        };
    }

    let Some(secret) = &config.jwt_secret else {
        return Identification::Rpc;
    };

    let token = query_param(&env.url, &config.jwt_param)
        .or_else(|| env.headers.get(&config.jwt_param).cloned());

    let Some(token) = token else {
        return if config.jwt_force {
            Identification::Rejected
        } else {
            Identification::Rpc
        };
    };

    let validation = Validation::new(Algorithm::HS256);
    match decode::<Claims>(
        &token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => Identification::Approved {
            identifiers: data.claims.ext,
        },
        Err(e) => {
            debug!(error = %e, "JWT verification failed");
            Identification::Rejected
        }
    }
}

/// Extract a raw query param value from a request URL. Tokens are URL-safe,
/// so no percent-decoding is needed.
fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_owned())
    })
}
