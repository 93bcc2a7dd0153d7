//! Supabase Auth (GoTrue) client.
//!
//! Besides the HTTP endpoints at `/auth/v1/...` this crate owns the session
//! lifecycle: a [`SessionManager`] that caches the current session and
//! coalesces refreshes, an [`AuthEventEmitter`] that tells listeners about
//! sign-in, sign-out and refresh, and pluggable local persistence.
//!
//! # Usage
//!
//! ```ignore
//! use supabase_client_auth::{AuthClient, AuthConfig, SignUpOptions};
//!
//! let auth = AuthClient::new(AuthConfig::new("https://your-project.supabase.co", "anon-key"))?;
//! auth.initialize().await;
//!
//! let _sub = auth.on_auth_state_change(|event, session| {
//!     println!("{event}: {:?}", session.map(|s| &s.user.id));
//! });
//!
//! auth.sign_in_with_password_email("user@example.com", "password").await?;
//! let session = auth.session().await?; // refreshed transparently when stale
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod jwt;
pub mod params;
pub mod pkce;
pub mod session;
pub mod storage;
pub mod types;

pub use client::{AuthClient, AuthConfig};
pub use error::{AuthError, AuthErrorCode, GoTrueErrorResponse, LocalStorageError};
pub use events::{AuthEventEmitter, AuthStateCallback, AuthStateChanges, AuthSubscription};
pub use params::*;
pub use session::{SessionManager, SessionRefresher, DEFAULT_EXPIRY_MARGIN};
pub use storage::{
    AuthLocalStorage, FileStorage, InMemoryStorage, SessionStorage, StoredSession, STORAGE_KEY,
};
pub use types::*;
