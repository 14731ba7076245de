#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! docbrain-gateway — the local side of docbrain.
//!
//! - `tunnel` — provider seam, ngrok and fixed-URL providers, the supervisor
//! - `dispatcher` — cache → tunnel check → remote with retries → local fallback
//! - `cache` — request-digest keyed result cache
//! - `client` — HTTP client for the remote brain
//! - `fallback` — local Ollama vision model
//! - `security` — authentication-failure monitor
//! - `signature` — HMAC request signatures
//! - `context` — builds all of the above from a [`Config`]

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod security;
pub mod signature;
pub mod tunnel;

pub use config::Config;
pub use context::GatewayContext;
pub use dispatcher::InferenceDispatcher;
pub use error::GatewayError;
