//! Shared building blocks for the Supabase client crates.
//!
//! Holds the project-level [`SupabaseConfig`], the umbrella [`SupabaseError`],
//! the [`AccessTokenProvider`] seam used by HTTP services that authenticate
//! with the current user's token, and small async [`platform`] helpers.

pub mod config;
pub mod error;
pub mod platform;
pub mod token;

pub use config::SupabaseConfig;
pub use error::{SupabaseError, SupabaseResult};
pub use token::{bearer_token, AccessTokenProvider, StaticTokenProvider};

/// Value sent in the `X-Client-Info` header on every request.
pub const CLIENT_INFO: &str = concat!("supabase-client-rs/", env!("CARGO_PKG_VERSION"));
