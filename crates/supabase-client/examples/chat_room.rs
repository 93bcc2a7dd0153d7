//! Sign in, join a broadcast and presence room for a minute and log what
//! happens.
//!
//! SUPABASE_URL=... SUPABASE_ANON_KEY=... EMAIL=... PASSWORD=... \
//!     RUST_LOG=supabase_client_realtime=debug cargo run --example chat_room

use std::time::Duration;

use serde_json::json;
use supabase_client::prelude::*;
use tracing_subscriber::EnvFilter;

fn env(name: &str) -> Result<String, SupabaseError> {
    std::env::var(name).map_err(|_| SupabaseError::config(format!("{} is not set", name)))
}

#[tokio::main]
async fn main() -> Result<(), SupabaseError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let client = SupabaseClient::new(
        SupabaseConfig::new(env("SUPABASE_URL")?, env("SUPABASE_ANON_KEY")?),
        SupabaseClientOptions::new(),
    )
    .await?;

    let _events = client.auth().on_auth_state_change(|event, session| {
        tracing::info!(%event, user = ?session.map(|s| &s.user.id), "auth state changed");
    });
    client
        .auth()
        .sign_in_with_password_email(&env("EMAIL")?, &env("PASSWORD")?)
        .await?;

    let room = client
        .realtime()
        .channel("lobby")
        .broadcast_self(true)
        .on_broadcast("message", |payload| {
            tracing::info!(%payload, "message");
        })
        .on_presence_sync(|state| {
            tracing::info!(online = state.len(), "presence sync");
        })
        .subscribe()
        .await?;

    room.track(json!({ "status": "online" })).await?;
    let status = room.send("message", json!({ "text": "hello" })).await?;
    tracing::info!(%status, "message sent");

    tokio::time::sleep(Duration::from_secs(60)).await;
    client.realtime().remove_all_channels().await?;
    client.auth().sign_out(SignOutScope::Local).await?;
    Ok(())
}
