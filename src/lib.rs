//! # Rusqara
//!
//! Asynchronous Mi/Aqara LAN protocol implementation for discovering gateways
//! and their sub-devices on the local network and controlling them without
//! cloud dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rusqara::{AqaraClient, Config, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> rusqara::Result<()> {
//!     let config = Config::new()
//!         .with_gateway(GatewayConfig::new("7811dcb28f68", "o8cwp5hsyfnsyqbe"));
//!     let client = AqaraClient::start(config)?;
//!
//!     let mut events = client.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod index;
pub mod protocol;

pub use client::{AqaraClient, LightCommand};
pub use config::{Config, GatewayConfig};
pub use device::{Device, DeviceRegistry};
pub use engine::{AqaraEvent, ChangeRequest};
pub use error::{AqaraError, Result};
pub use gateway::{Gateway, GatewayRegistry};
pub use index::DeviceMap;
pub use protocol::{CommandTag, Envelope};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
