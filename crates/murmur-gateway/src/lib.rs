pub mod auth;
pub mod connection;
pub mod handlers;

pub use connection::{Gateway, GatewayConfig, handle_connection};
