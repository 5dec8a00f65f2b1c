//! Connectivity between the edge gateway and the cloud MQTT broker.
//!
//! [`CloudLink`] wraps a `rumqttc` client with the behaviour the gateway
//! relies on: a persistent broker session, automatic reconnection within
//! bounded exponential backoff, a non-blocking QoS 1 publish gated on the
//! connection state, subscriptions re-applied on every connect, and
//! connection listeners for reacting to state changes.
//!
//! ```no_run
//! use mqtt_link::{CloudLink, LinkConfig};
//!
//! # fn main() -> Result<(), mqtt_link::LinkError> {
//! let config = LinkConfig::default()
//!     .with_host("mqtt.example.com")
//!     .with_client_id("vineguard-gateway");
//!
//! let link = CloudLink::new(&config, |command| {
//!     println!("{}: {} bytes", command.topic, command.payload.len());
//! })?;
//!
//! link.subscribe("vineguard/+/+/+/cmd")?;
//! link.start();
//!
//! if !link.publish("vineguard/o/s/n/telemetry", b"{}") {
//!     // broker unreachable: spool the message for later
//! }
//! # Ok(())
//! # }
//! ```
#![forbid(unsafe_code)]

mod config;
mod errors;
mod link;
mod messages;
mod topics;

pub use config::*;
pub use errors::*;
pub use link::*;
pub use messages::*;
pub use topics::*;

pub use rumqttc::QoS;
