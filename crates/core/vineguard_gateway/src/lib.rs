//! The VineGuard edge gateway.
//!
//! Sits between the field transports (UDP JSON from lab nodes and the
//! simulator, LoRa frames from a concentrator or its simulation) and the
//! cloud MQTT broker. Uplinks are validated, enriched with gateway metadata
//! and published with QoS 1; while the broker is unreachable they are
//! spooled to disk and replayed in order on reconnect. Downlink commands
//! received from the cloud are routed back to the transport that last saw
//! the target node. A small HTTP endpoint exposes the gateway state.
#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod gateway;
pub mod health;
pub mod sources;
pub mod telemetry;
