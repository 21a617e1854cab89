//! # berth-api
//!
//! The JSON-over-HTTP surface of berth: container lifecycle endpoints,
//! scheduler status endpoints, the bearer-token gate, and the response
//! envelope. All domain work is delegated to the replica-set controller.

pub mod auth;
pub mod containers;
pub mod response;
pub mod schedulers;
pub mod server;

pub use auth::ApiKey;
pub use server::{build_router, serve, AppState};
