//! Ingress sources for field telemetry.
//!
//! A [`PacketSource`] produces JSON payloads plus a transport-specific
//! [`IngressContext`] and hands them to the gateway over a bounded channel.
//! Each source also accepts downlink bytes for nodes it has previously seen,
//! which is how cloud commands find their way back into the field.

pub mod lora;
pub mod udp;

use crate::telemetry::NodeKey;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the source-to-gateway channel; applies backpressure to the
/// receive loops instead of buffering unboundedly in memory.
pub const SOURCE_CHANNEL_CAPACITY: usize = 64;

pub type MessageSender = mpsc::Sender<SourceMessage>;

/// A decoded payload on its way from a source into the gateway core.
pub struct SourceMessage {
    pub source: Arc<dyn PacketSource>,
    pub payload: Value,
    pub context: IngressContext,
}

/// Transport-side metadata attached to every uplink.
///
/// Serialised into the enriched message under `ingress`; absent fields are
/// omitted rather than written as null.
#[derive(Debug, Clone, Serialize)]
pub struct IngressContext {
    pub transport: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulated: Option<bool>,
}

impl IngressContext {
    pub fn udp(remote: SocketAddr) -> IngressContext {
        IngressContext {
            transport: "udp",
            remote: Some(remote),
            rssi: None,
            snr: None,
            simulated: None,
        }
    }

    pub fn lora_simulated(rssi: i64, snr: f64) -> IngressContext {
        IngressContext {
            transport: "lora",
            remote: None,
            rssi: Some(rssi),
            snr: Some(snr),
            simulated: Some(true),
        }
    }

    pub fn lora_hardware() -> IngressContext {
        IngressContext {
            transport: "lora",
            remote: None,
            rssi: None,
            snr: None,
            simulated: Some(false),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("Failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// An ingress transport.
///
/// `start` spawns whatever background work the transport needs and is given
/// the channel into the gateway; `stop` cancels that work and must be
/// idempotent. The downlink methods have failing defaults: a transport that
/// cannot address nodes simply never routes commands.
#[async_trait]
pub trait PacketSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(self: Arc<Self>, messages: MessageSender) -> Result<(), SourceError>;

    async fn stop(&self);

    /// Hint that this source saw `node` with the given context.
    fn register_node(&self, _node: &NodeKey, _context: &IngressContext) {}

    /// Deliver raw downlink bytes to `node`; `true` on success.
    fn send_downlink(&self, _node: &NodeKey, _payload: &[u8]) -> bool {
        false
    }
}
