//! Supabase client for Rust.
//!
//! [`SupabaseClient`] composes the service crates for one project and wires
//! them together; each service crate can also be used on its own.
//!
//! ```ignore
//! use supabase_client::prelude::*;
//!
//! let client = SupabaseClient::new(
//!     SupabaseConfig::new("https://your-project.supabase.co", "anon-key"),
//!     SupabaseClientOptions::new(),
//! )
//! .await?;
//!
//! client
//!     .auth()
//!     .sign_in_with_password_email("user@example.com", "password")
//!     .await?;
//! ```

mod client;
mod options;

pub use client::SupabaseClient;
pub use options::{AuthOptions, RealtimeOptions, SupabaseClientOptions};

pub use supabase_client_core::{
    AccessTokenProvider, SupabaseConfig, SupabaseError, SupabaseResult, CLIENT_INFO,
};

pub use supabase_client_auth as auth;
#[cfg(feature = "functions")]
pub use supabase_client_functions as functions;
pub use supabase_client_realtime as realtime;
#[cfg(feature = "storage")]
pub use supabase_client_storage as storage;

/// Common imports.
///
/// ```ignore
/// use supabase_client::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{AuthOptions, RealtimeOptions, SupabaseClient, SupabaseClientOptions};
    pub use supabase_client_core::{SupabaseConfig, SupabaseError, SupabaseResult};

    pub use supabase_client_auth::{
        AuthChangeEvent, AuthClient, AuthError, AuthFlowType, AuthLocalStorage, AuthStateChange,
        AuthSubscription, FileStorage, InMemoryStorage, Session, SignOutScope, User,
    };

    pub use supabase_client_realtime::{
        ChannelStatus, PostgresChangePayload, PostgresChangesEvent, PostgresChangesFilter,
        PresenceMeta, PresenceState, PushStatus, RealtimeChannel, RealtimeClient, RealtimeError,
        SocketStatus,
    };

    #[cfg(feature = "storage")]
    pub use supabase_client_storage::{
        BucketOptions, FileOptions, ResumableUpload, StorageClient, StorageError, StorageFileApi,
        UploadStatus,
    };

    #[cfg(feature = "functions")]
    pub use supabase_client_functions::{
        FunctionResponse, FunctionsClient, FunctionsError, InvokeOptions,
    };
}
