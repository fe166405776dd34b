//! # optimize-core
//!
//! Core types shared by the Optimize API bindings and the activity runner.
//!
//! - [`OptimizeError`] and the typed [`ApiError`] reported by the server
//! - [`Metadata`], the header-style envelope every response carries, and
//!   [`Relation`] lookups over its hypermedia links
//! - [`OptimizeConfig`], loaded from TOML

mod config;
mod error;
mod metadata;

pub use config::{ActivityConfig, ClientConfig, OptimizeConfig, ADDRESS_ENV};
pub use error::{ApiError, ErrorType, OptimizeError, Result};
pub use metadata::{parse_link_header, LinkValue, Metadata, Relation};
