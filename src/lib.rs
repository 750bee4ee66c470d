pub mod address;
pub mod auth;
pub mod config;
pub mod dkim;
pub mod dns;
pub mod error;
pub mod forward;
pub mod limiter;
pub mod logging;
pub mod message;
pub mod smtp;
pub mod tls;

pub use config::RelayConfig;
pub use error::RelayError;
pub use logging::set_verbose;
pub use smtp::{serve, Relay};
