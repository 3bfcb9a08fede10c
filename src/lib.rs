//! Relays remote display-protocol clients to a local compositor socket, one
//! compositor connection per client, from a single readiness-driven task.

pub mod buffer;
pub mod compositor;
pub mod config;
pub mod conn;
pub mod endpoint;
pub mod fdpass;
pub mod listener;
pub mod relay;
pub mod session;

pub use config::Config;
pub use listener::{ListenAddr, Listener};
pub use relay::Relay;
