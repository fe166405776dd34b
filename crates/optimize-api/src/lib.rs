//! # optimize-api
//!
//! Typed bindings for the Optimize REST API.
//!
//! Resources are discovered through hypermedia links rather than by
//! building URLs: a fetched resource's [`Metadata`](optimize_core::Metadata)
//! names its `self`, `up`, `trials`, `next-trial` (and so on) relations, and
//! callers follow those.
//!
//! - [`applications`]: applications, scenarios, templates and the activity
//!   feed, including the polling [`Subscription`](applications::Subscription)
//! - [`experiments`]: experiments, trials and experiment name generation
//! - [`mock`]: an in-memory server implementing both API traits

/// Declare an opaque, string-like resource name
macro_rules! resource_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self(name.to_string())
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(name)
            }
        }
    };
}

pub mod applications;
mod auth;
mod client;
pub mod experiments;
pub mod mock;

pub use auth::resolve_token;
pub use client::{metadata_from_headers, ApiClient, ApiResponse};
