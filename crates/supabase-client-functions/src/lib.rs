//! Supabase Edge Functions client.
//!
//! Invokes functions deployed at `/functions/v1/{name}`, authenticating with
//! the signed-in user's token when an access token provider is configured.
//!
//! # Usage
//!
//! ```ignore
//! use supabase_client_functions::{FunctionsClient, InvokeOptions};
//! use serde_json::json;
//!
//! let functions = FunctionsClient::new("https://your-project.supabase.co", "anon-key")?;
//! let response = functions
//!     .invoke("hello", InvokeOptions::new().body(json!({ "name": "World" })))
//!     .await?;
//! let data: serde_json::Value = response.json()?;
//! ```

pub mod client;
pub mod error;
pub mod types;

pub use client::{FunctionsClient, FunctionsConfig};
pub use error::{FunctionsApiErrorResponse, FunctionsError};
pub use types::{FunctionResponse, InvokeBody, InvokeOptions};
