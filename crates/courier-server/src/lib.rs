//! Dispatch gateway: WebSocket endpoints, cross-instance fanout, and the
//! internal HTTP surface the order workflows call.

pub mod auth;
pub mod config;
pub mod fanout;
pub mod gateway;
pub mod health;
pub mod push;
pub mod registry;
pub mod relay;
pub mod server;

pub use auth::{resolver_from_config, AuthError, IdentityResolver, JwtResolver, StaticResolver};
pub use config::{load_config, ConfigError, CourierConfig};
pub use server::{build_router, start, AppState, ServerHandle};
