use std::sync::Arc;

use futures_util::StreamExt;
use supabase_client_auth::{AuthChangeEvent, AuthClient, AuthConfig, AuthStateChanges};
use supabase_client_core::platform::{self, SpawnHandle};
use supabase_client_core::{SupabaseConfig, SupabaseResult};
use supabase_client_realtime::{RealtimeClient, RealtimeConfig};
use tracing::debug;

#[cfg(feature = "functions")]
use supabase_client_functions::{FunctionsClient, FunctionsConfig};
#[cfg(feature = "storage")]
use supabase_client_storage::{StorageClient, StorageConfig};

use crate::options::SupabaseClientOptions;

/// One Supabase project: auth, realtime, storage and functions built from
/// the same config and wired together.
///
/// Storage and functions requests carry the signed-in user's token, and a
/// background listener keeps the realtime socket's token in step with the
/// auth session. Clones share everything; the listener stops when the last
/// clone is dropped.
///
/// # Example
/// ```ignore
/// use supabase_client::prelude::*;
///
/// let client = SupabaseClient::new(
///     SupabaseConfig::new("https://your-project.supabase.co", "anon-key"),
///     SupabaseClientOptions::new(),
/// )
/// .await?;
/// client.auth().sign_in_with_password_email("user@example.com", "password").await?;
/// let channel = client.realtime().channel("room").subscribe().await?;
/// ```
#[derive(Clone)]
pub struct SupabaseClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SupabaseConfig,
    auth: AuthClient,
    realtime: RealtimeClient,
    #[cfg(feature = "storage")]
    storage: StorageClient,
    #[cfg(feature = "functions")]
    functions: FunctionsClient,
    listener: SpawnHandle,
}

impl SupabaseClient {
    /// Build every service client, start forwarding auth tokens to realtime
    /// and load the persisted session.
    pub async fn new(config: SupabaseConfig, options: SupabaseClientOptions) -> SupabaseResult<Self> {
        config.validate()?;

        let mut auth_config = AuthConfig::from_supabase(&config)
            .flow_type(options.auth.flow_type)
            .storage_key(options.auth.storage_key.clone())
            .expiry_margin(options.auth.expiry_margin);
        if let Some(storage) = &options.auth.storage {
            auth_config = auth_config.storage(Arc::clone(storage));
        }
        let auth = AuthClient::new(auth_config)?;

        let realtime = RealtimeClient::with_config(realtime_config(&config, &options))?;

        #[cfg(feature = "storage")]
        let storage = {
            let mut storage_config =
                StorageConfig::from_supabase(&config).token_provider(Arc::new(auth.clone()));
            if let Some(size) = options.upload_chunk_size {
                storage_config = storage_config.upload_chunk_size(size);
            }
            StorageClient::with_config(storage_config)?
        };

        #[cfg(feature = "functions")]
        let functions = FunctionsClient::with_config(
            FunctionsConfig::from_supabase(&config).token_provider(Arc::new(auth.clone())),
        )?;

        let listener = platform::spawn(forward_auth_to_realtime(
            auth.auth_state_changes(),
            realtime.clone(),
        ));

        auth.initialize().await;
        if options.auth.auto_refresh_token {
            auth.start_auto_refresh();
        }
        debug!(url = %config.supabase_url, "Supabase client ready");

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                auth,
                realtime,
                #[cfg(feature = "storage")]
                storage,
                #[cfg(feature = "functions")]
                functions,
                listener,
            }),
        })
    }

    pub fn config(&self) -> &SupabaseConfig {
        &self.inner.config
    }

    pub fn auth(&self) -> &AuthClient {
        &self.inner.auth
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.inner.realtime
    }

    #[cfg(feature = "storage")]
    pub fn storage(&self) -> &StorageClient {
        &self.inner.storage
    }

    #[cfg(feature = "functions")]
    pub fn functions(&self) -> &FunctionsClient {
        &self.inner.functions
    }
}

impl std::fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("url", &self.inner.config.supabase_url)
            .finish_non_exhaustive()
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn realtime_config(config: &SupabaseConfig, options: &SupabaseClientOptions) -> RealtimeConfig {
    let realtime = &options.realtime;
    let mut realtime_config = RealtimeConfig::new(&config.supabase_url, &config.supabase_key)
        .heartbeat_interval(realtime.heartbeat_interval)
        .reconnect_delay(realtime.reconnect_delay)
        .timeout_interval(realtime.timeout_interval)
        .disconnect_on_session_loss(realtime.disconnect_on_session_loss)
        .connect_on_subscribe(realtime.connect_on_subscribe);
    for (key, value) in &config.headers {
        realtime_config = realtime_config.header(key, value);
    }
    realtime_config
}

/// Keep the socket's access token equal to the current session's.
async fn forward_auth_to_realtime(mut changes: AuthStateChanges, realtime: RealtimeClient) {
    while let Some(change) = changes.next().await {
        match change.event {
            AuthChangeEvent::InitialSession
            | AuthChangeEvent::SignedIn
            | AuthChangeEvent::TokenRefreshed => {
                let token = change.session.map(|session| session.access_token);
                debug!(event = %change.event, signed_in = token.is_some(), "Updating realtime token");
                realtime.set_auth(token);
            }
            AuthChangeEvent::SignedOut => {
                debug!("Session lost, clearing realtime token");
                realtime.set_auth(None);
                if realtime.config().disconnect_on_session_loss {
                    realtime.disconnect().await;
                }
            }
            AuthChangeEvent::UserUpdated | AuthChangeEvent::PasswordRecovery => {}
        }
    }
}
