#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::unused_async)]

//! docbrain library: the remote inference service behind the tunnel.
//!
//! - `auth` — primary token and legacy bearer guards, constant-time comparison
//! - `config` — TOML + env-var configuration
//! - `engine` — vision model seam and the OpenAI-compatible backend
//! - `routes` — `/`, `/health`, `/analyze`, `/shutdown` and router assembly
//! - `state` — dependency-injected handler state

pub mod auth;
pub mod config;
pub mod engine;
pub mod routes;
pub mod state;

pub use config::Config;
pub use routes::router;
pub use state::AppState;
