use super::IngressContext;
use super::MessageSender;
use super::PacketSource;
use super::SourceError;
use super::SourceMessage;
use crate::clock::to_rfc3339;
use crate::telemetry::NodeKey;
use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// Idle delay of the hardware poll loop.
const HARDWARE_POLL_DELAY: Duration = Duration::from_millis(100);

/// Node ids emitted by the simulation loop.
const SIMULATED_NODES: [&str; 2] = ["lora-node-1", "lora-node-2"];

/// A LoRa concentrator board, as seen by the gateway.
///
/// `recv` is non-blocking and returns `None` when no demodulated frame is
/// pending; `send` queues a downlink frame and reports acceptance.
pub trait Concentrator: Send + Sync {
    fn recv(&self) -> Option<Vec<u8>>;
    fn send(&self, frame: &[u8]) -> bool;
}

fn detect_concentrator() -> Option<Arc<dyn Concentrator>> {
    // TODO: probe the SX130x board over SPI once the HAL bindings land.
    None
}

/// LoRa ingress, demodulated frames courtesy of the concentrator driver.
///
/// Without a concentrator (or when simulation is forced) the source emits a
/// plausible reading for one of two virtual nodes every 5 to 10 seconds, so
/// the rest of the pipeline can be exercised end to end on any machine.
pub struct LoraSource {
    concentrator: Option<Arc<dyn Concentrator>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoraSource {
    pub fn new(force_simulation: bool) -> LoraSource {
        let concentrator = if force_simulation {
            None
        } else {
            let detected = detect_concentrator();
            if detected.is_none() {
                warn!("no LoRa concentrator detected, falling back to simulation");
            }
            detected
        };
        LoraSource {
            concentrator,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Drive the hardware loop with an explicit driver.
    pub fn with_concentrator(concentrator: Arc<dyn Concentrator>) -> LoraSource {
        LoraSource {
            concentrator: Some(concentrator),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    fn is_simulated(&self) -> bool {
        self.concentrator.is_none()
    }
}

#[async_trait]
impl PacketSource for LoraSource {
    fn name(&self) -> &'static str {
        "lora"
    }

    async fn start(self: Arc<Self>, messages: MessageSender) -> Result<(), SourceError> {
        let source = self.clone();
        let task = if self.is_simulated() {
            info!("LoRa simulation started");
            tokio::spawn(async move { source.simulation_loop(messages).await })
        } else {
            info!("LoRa hardware loop started");
            tokio::spawn(async move { source.hardware_loop(messages).await })
        };
        *self.task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("LoRa source stopped");
        }
    }

    fn send_downlink(&self, node: &NodeKey, payload: &[u8]) -> bool {
        match &self.concentrator {
            None => {
                info!(
                    node = %node,
                    payload = %String::from_utf8_lossy(payload),
                    "simulated LoRa downlink"
                );
                true
            }
            Some(concentrator) => {
                if concentrator.send(payload) {
                    info!(node = %node, "LoRa downlink queued");
                    true
                } else {
                    warn!(node = %node, "concentrator refused the LoRa downlink");
                    false
                }
            }
        }
    }
}

impl LoraSource {
    async fn simulation_loop(self: Arc<Self>, messages: MessageSender) {
        loop {
            let source: Arc<dyn PacketSource> = self.clone();
            let message = SourceMessage {
                source,
                payload: simulated_payload(),
                context: IngressContext::lora_simulated(
                    fastrand::i64(-110..=-70),
                    round2(-12.0 + fastrand::f64() * 17.0),
                ),
            };
            if messages.send(message).await.is_err() {
                break;
            }

            let delay = Duration::from_secs_f64(5.0 + fastrand::f64() * 5.0);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => (),
            }
        }
    }

    async fn hardware_loop(self: Arc<Self>, messages: MessageSender) {
        let Some(concentrator) = self.concentrator.clone() else {
            return;
        };
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Some(frame) = concentrator.recv() else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(HARDWARE_POLL_DELAY) => (),
                }
                continue;
            };
            let payload: Value = match serde_json::from_slice(&frame) {
                Ok(payload) => payload,
                Err(_) => {
                    warn!(frame_len = frame.len(), "dropping LoRa frame that is not valid JSON");
                    continue;
                }
            };
            let source: Arc<dyn PacketSource> = self.clone();
            let message = SourceMessage {
                source,
                payload,
                context: IngressContext::lora_hardware(),
            };
            if messages.send(message).await.is_err() {
                break;
            }
        }
    }
}

fn simulated_payload() -> Value {
    let node = SIMULATED_NODES[fastrand::usize(0..SIMULATED_NODES.len())];
    json!({
        "nodeId": node,
        "orgId": "sim-org",
        "siteId": "sim-site",
        "timestamp": to_rfc3339(OffsetDateTime::now_utc()),
        "metrics": {
            "temperature": round2(10.0 + fastrand::f64() * 22.0),
            "humidity": round2(40.0 + fastrand::f64() * 30.0),
        }
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct StubConcentrator {
        frames: Mutex<VecDeque<Vec<u8>>>,
        sent: Mutex<Vec<Vec<u8>>>,
        accept_downlinks: bool,
    }

    impl StubConcentrator {
        fn with_frames(frames: &[&[u8]]) -> Arc<StubConcentrator> {
            Arc::new(StubConcentrator {
                frames: Mutex::new(frames.iter().map(|f| f.to_vec()).collect()),
                sent: Mutex::new(Vec::new()),
                accept_downlinks: true,
            })
        }
    }

    impl Concentrator for StubConcentrator {
        fn recv(&self) -> Option<Vec<u8>> {
            self.frames.lock().unwrap().pop_front()
        }

        fn send(&self, frame: &[u8]) -> bool {
            if self.accept_downlinks {
                self.sent.lock().unwrap().push(frame.to_vec());
            }
            self.accept_downlinks
        }
    }

    #[tokio::test]
    async fn simulation_emits_valid_telemetry_immediately() {
        let source = Arc::new(LoraSource::new(true));
        let (tx, mut rx) = mpsc::channel(8);
        source.clone().start(tx).await.unwrap();

        let message = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no simulated uplink within 2s")
            .unwrap();

        assert_eq!(message.context.transport, "lora");
        assert_eq!(message.context.simulated, Some(true));
        assert!(message.context.rssi.is_some());

        let telemetry = telemetry::validate(&message.payload).unwrap();
        assert_eq!(telemetry.node.org_id, "sim-org");
        assert!(SIMULATED_NODES.contains(&telemetry.node.node_id.as_str()));

        source.stop().await;
    }

    #[tokio::test]
    async fn hardware_frames_are_decoded_and_dispatched() {
        let concentrator = StubConcentrator::with_frames(&[
            br#"{"nodeId":"field-9"}"#,
            b"garbled \xff frame",
            br#"{"nodeId":"field-10"}"#,
        ]);
        let source = Arc::new(LoraSource::with_concentrator(concentrator));
        let (tx, mut rx) = mpsc::channel(8);
        source.clone().start(tx).await.unwrap();

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.payload["nodeId"], "field-9");
        assert_eq!(first.context.simulated, Some(false));

        // the garbled frame is skipped
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second.payload["nodeId"], "field-10");

        source.stop().await;
    }

    #[tokio::test]
    async fn downlink_reaches_the_concentrator() {
        let concentrator = StubConcentrator::with_frames(&[]);
        let source = LoraSource::with_concentrator(concentrator.clone());

        let node = NodeKey::new("o", "s", "field-9");
        assert!(source.send_downlink(&node, b"PING"));
        assert_eq!(*concentrator.sent.lock().unwrap(), [b"PING".to_vec()]);
    }

    #[test]
    fn simulated_downlink_always_succeeds() {
        let source = LoraSource::new(true);
        let node = NodeKey::new("o", "s", "lora-node-1");
        assert!(source.send_downlink(&node, b"PING"));
    }
}
