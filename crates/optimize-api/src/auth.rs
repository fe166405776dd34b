//! Bearer token resolution
//!
//! The token is read from the environment variable named in the
//! configuration (`OPTIMIZE_TOKEN` by default). Running without a token is
//! allowed for local servers; the API answers `unauthorized` otherwise.

use std::env;

/// Get the bearer token from the named environment variable
pub fn resolve_token(token_env: &str) -> Option<String> {
    match env::var(token_env) {
        Ok(token) if !token.trim().is_empty() => {
            tracing::debug!("Using bearer token from {}", token_env);
            Some(token.trim().to_string())
        }
        _ => {
            tracing::warn!("{} is not set, requests will be unauthenticated", token_env);
            None
        }
    }
}
