use crate::clock::to_rfc3339;
use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::sources::lora::LoraSource;
use crate::sources::udp::UdpJsonSource;
use crate::sources::IngressContext;
use crate::sources::MessageSender;
use crate::sources::PacketSource;
use crate::sources::SourceError;
use crate::sources::SourceMessage;
use crate::telemetry;
use crate::telemetry::NodeKey;
use crate::telemetry::Telemetry;
use mqtt_link::CloudLink;
use mqtt_link::LinkError;
use mqtt_link::Message;
use serde::Serialize;
use serde_json::Value;
use spool::Spool;
use spool::SpoolError;
use spool::DEFAULT_BATCH_LIMIT;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Downlink commands arrive on this pattern; segment two, three and four
/// address the node.
pub const COMMAND_TOPIC_FILTER: &str = "vineguard/+/+/+/cmd";

/// Events delivered by the MQTT connection listener; drained by the gateway
/// task so all reactions happen off the network loop.
pub type ConnectionEvents = mpsc::UnboundedReceiver<bool>;

/// The gateway core: fans in uplinks from the sources, validates and
/// enriches them, publishes them (or spools them while the broker is away),
/// drains the spool on reconnect and routes cloud commands back to the
/// source that last saw the target node.
pub struct Gateway {
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    spool: Arc<Spool>,
    link: Arc<CloudLink>,
    sources: Mutex<Vec<Arc<dyn PacketSource>>>,
    node_sources: Mutex<HashMap<NodeKey, Arc<dyn PacketSource>>>,
    last_message_received: Mutex<Option<OffsetDateTime>>,
    last_publish_success: Mutex<Option<OffsetDateTime>>,
    mqtt_connected: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
}

/// Point-in-time gateway state, served on `/healthz`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub mqtt_connected: bool,
    pub queued_messages: usize,
    pub last_message_received: Option<String>,
    pub last_publish_success: Option<String>,
}

impl Gateway {
    /// Wire the gateway to its collaborators.
    ///
    /// Registers the connection listener on the link and subscribes to the
    /// command topic. The listener only posts the new state onto the
    /// returned channel: it runs on the MQTT network loop, which must never
    /// be blocked.
    pub fn new(
        config: GatewayConfig,
        clock: Arc<dyn Clock>,
        spool: Arc<Spool>,
        link: Arc<CloudLink>,
    ) -> Result<(Arc<Gateway>, ConnectionEvents), LinkError> {
        let gateway = Arc::new(Gateway {
            config,
            clock,
            spool,
            link: link.clone(),
            sources: Mutex::new(Vec::new()),
            node_sources: Mutex::new(HashMap::new()),
            last_message_received: Mutex::new(None),
            last_publish_success: Mutex::new(None),
            mqtt_connected: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        });

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        link.add_connection_listener(move |connected| {
            let _ = connection_tx.send(connected);
        });
        link.subscribe(COMMAND_TOPIC_FILTER)?;

        Ok((gateway, connection_rx))
    }

    /// Start the sources enabled by the configuration.
    ///
    /// Failing to bind the UDP socket is a startup failure and is returned
    /// to the caller.
    pub async fn start_sources(&self, messages: &MessageSender) -> Result<(), SourceError> {
        if self.config.enable_udp_source {
            let source = Arc::new(UdpJsonSource::new(
                self.config.udp_listen_host.clone(),
                self.config.udp_listen_port,
            ));
            source.clone().start(messages.clone()).await?;
            self.sources.lock().unwrap().push(source);
        }

        if self.config.enable_lora_source {
            let source = Arc::new(LoraSource::new(self.config.lora_force_simulation));
            source.clone().start(messages.clone()).await?;
            self.sources.lock().unwrap().push(source);
        }

        Ok(())
    }

    pub async fn stop_sources(&self) {
        let sources: Vec<_> = self.sources.lock().unwrap().drain(..).collect();
        for source in sources {
            source.stop().await;
        }
    }

    /// Drive the gateway until `shutdown` fires.
    ///
    /// Every uplink, command and connection change is handled here, on one
    /// task; the spool drain is the only work spawned elsewhere.
    pub async fn run(
        self: Arc<Self>,
        mut messages: mpsc::Receiver<SourceMessage>,
        mut commands: mpsc::UnboundedReceiver<Message>,
        mut connections: ConnectionEvents,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(message) = messages.recv() => self.handle_message(message),
                Some(command) = commands.recv() => self.handle_command(&command),
                Some(connected) = connections.recv() => self.clone().handle_connection_change(connected),
                else => break,
            }
        }
    }

    /// The uplink path: validate, enrich, publish or spool.
    pub fn handle_message(&self, message: SourceMessage) {
        let SourceMessage {
            source,
            payload,
            context,
        } = message;

        let telemetry = match telemetry::validate(&payload) {
            Ok(telemetry) => telemetry,
            Err(err) => {
                warn!(source = source.name(), error = %err, "dropping telemetry that failed validation");
                return;
            }
        };

        let node = telemetry.node.clone();
        let topic = format!(
            "vineguard/{}/{}/{}/telemetry",
            node.org_id, node.site_id, node.node_id
        );
        let serialised = match self.enrich(&telemetry, source.name(), &context) {
            Ok(serialised) => serialised,
            Err(err) => {
                error!(topic, error = %err, "failed to serialise enriched telemetry");
                return;
            }
        };

        source.register_node(&node, &context);
        self.node_sources.lock().unwrap().insert(node, source);
        *self.last_message_received.lock().unwrap() = Some(self.clock.now());

        if self.link.publish(&topic, serialised.as_bytes()) {
            *self.last_publish_success.lock().unwrap() = Some(self.clock.now());
        } else {
            warn!(topic, "MQTT offline, spooling telemetry");
            if let Err(err) = self.spool.enqueue(&topic, &serialised) {
                error!(topic, error = %err, "failed to spool telemetry, message lost");
            }
        }
    }

    /// The validated payload plus `gatewayId`, `receivedAt` and the ingress
    /// context, as compact JSON with lexicographically sorted keys.
    ///
    /// Key order and compactness matter: identical inputs must serialise to
    /// identical bytes.
    fn enrich(
        &self,
        telemetry: &Telemetry,
        source_name: &str,
        context: &IngressContext,
    ) -> Result<String, serde_json::Error> {
        let mut ingress = serde_json::to_value(context)?;
        if let Some(ingress) = ingress.as_object_mut() {
            ingress
                .entry("source")
                .or_insert_with(|| Value::String(source_name.to_string()));
        }

        let mut enriched = telemetry.payload.clone();
        enriched.insert(
            "gatewayId".to_string(),
            Value::String(self.config.gateway_id.clone()),
        );
        enriched.insert(
            "receivedAt".to_string(),
            Value::String(to_rfc3339(self.clock.now())),
        );
        enriched.insert("ingress".to_string(), ingress);

        serde_json::to_string(&Value::Object(enriched))
    }

    fn handle_connection_change(self: Arc<Self>, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::SeqCst);
        if connected {
            info!("MQTT link is up, draining the spool");
            tokio::spawn(async move { self.flush_queue().await });
        } else {
            warn!("MQTT link is down, telemetry will be spooled");
        }
    }

    /// Drain the spool through the link, oldest first.
    ///
    /// Single-flight: overlapping reconnects queue up on the lock and find
    /// the spool already drained. Rows are only removed after a successful
    /// publish; a failed publish stops the current batch, and the loop keeps
    /// retrying the remaining rows for as long as the link stays up.
    pub async fn flush_queue(&self) {
        let _guard = self.flush_lock.lock().await;

        while self.link.is_connected() {
            let batch = match self.spool.get_batch(DEFAULT_BATCH_LIMIT) {
                Ok(batch) => batch,
                Err(err) => {
                    error!(error = %err, "failed to read the spool while draining");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let mut published = Vec::with_capacity(batch.len());
            for item in &batch {
                if self.link.publish(&item.topic, item.payload.as_bytes()) {
                    published.push(item.id);
                } else {
                    warn!(id = item.id, "publish failed while draining the spool");
                    break;
                }
            }

            if !published.is_empty() {
                if let Err(err) = self.spool.remove(&published) {
                    error!(error = %err, "failed to remove drained messages from the spool");
                    break;
                }
                *self.last_publish_success.lock().unwrap() = Some(self.clock.now());
            }

            tokio::task::yield_now().await;
        }
    }

    /// The downlink path: parse the command topic and hand the payload to
    /// the source that last saw the node.
    pub fn handle_command(&self, command: &Message) {
        let Some(node) = parse_command_topic(&command.topic) else {
            warn!(topic = %command.topic, "unexpected command topic");
            return;
        };

        let source = self.node_sources.lock().unwrap().get(&node).cloned();
        let Some(source) = source else {
            warn!(topic = %command.topic, "no known source for command target");
            return;
        };

        if source.send_downlink(&node, &command.payload) {
            info!(topic = %command.topic, source = source.name(), "forwarded command to source");
        } else {
            warn!(topic = %command.topic, source = source.name(), "failed to forward command");
        }
    }

    /// Point-in-time snapshot for the health endpoint.
    pub fn build_health_status(&self) -> Result<HealthStatus, SpoolError> {
        let connected = self.mqtt_connected.load(Ordering::SeqCst);
        Ok(HealthStatus {
            status: if connected { "ok" } else { "degraded" },
            mqtt_connected: connected,
            queued_messages: self.spool.count()?,
            last_message_received: self
                .last_message_received
                .lock()
                .unwrap()
                .map(to_rfc3339),
            last_publish_success: self.last_publish_success.lock().unwrap().map(to_rfc3339),
        })
    }
}

/// A command topic has exactly five segments and ends in `cmd`; the middle
/// three address the node.
fn parse_command_topic(topic: &str) -> Option<NodeKey> {
    let mut parts = topic.split('/');
    match (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) {
        (Some(_), Some(org), Some(site), Some(node), Some("cmd"), None) => {
            Some(NodeKey::new(org, site, node))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use async_trait::async_trait;
    use mqtt_link::LinkConfig;
    use serde_json::json;
    use tempfile::TempDir;
    use time::macros::datetime;

    struct FixedClock(OffsetDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> OffsetDateTime {
            self.0
        }
    }

    struct StubSource {
        name: &'static str,
        accept_downlinks: bool,
        downlinks: Mutex<Vec<(NodeKey, Vec<u8>)>>,
        registered: Mutex<Vec<NodeKey>>,
    }

    impl StubSource {
        fn named(name: &'static str) -> Arc<StubSource> {
            Arc::new(StubSource {
                name,
                accept_downlinks: true,
                downlinks: Mutex::new(Vec::new()),
                registered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PacketSource for StubSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(self: Arc<Self>, _messages: MessageSender) -> Result<(), SourceError> {
            Ok(())
        }

        async fn stop(&self) {}

        fn register_node(&self, node: &NodeKey, _context: &IngressContext) {
            self.registered.lock().unwrap().push(node.clone());
        }

        fn send_downlink(&self, node: &NodeKey, payload: &[u8]) -> bool {
            if self.accept_downlinks {
                self.downlinks
                    .lock()
                    .unwrap()
                    .push((node.clone(), payload.to_vec()));
            }
            self.accept_downlinks
        }
    }

    struct TestGateway {
        gateway: Arc<Gateway>,
        _dir: TempDir,
    }

    fn test_gateway() -> TestGateway {
        let dir = TempDir::new().unwrap();
        let db = camino::Utf8PathBuf::from_path_buf(dir.path().join("spool.db")).unwrap();
        let spool = Arc::new(Spool::open(&db).unwrap());
        // never started: the link stays disconnected, so publishes are refused
        let link = Arc::new(CloudLink::new(&LinkConfig::default(), |_| ()).unwrap());
        let config =
            GatewayConfig::from_lookup(|key| (key == "GATEWAY_ID").then(|| "gw-test".into()))
                .unwrap();
        let clock = Arc::new(FixedClock(datetime!(2024-01-01 00:00:00 UTC)));
        let (gateway, _connections) = Gateway::new(config, clock, spool, link).unwrap();
        TestGateway { gateway, _dir: dir }
    }

    fn sample_message(source: Arc<dyn PacketSource>, node_id: &str) -> SourceMessage {
        SourceMessage {
            source,
            payload: json!({
                "orgId": "o",
                "siteId": "s",
                "nodeId": node_id,
                "timestamp": "2024-01-01T00:00:00Z",
                "metrics": {"t": 21.0}
            }),
            context: IngressContext::udp("127.0.0.1:9999".parse().unwrap()),
        }
    }

    #[test]
    fn command_topic_parsing_requires_five_segments_ending_in_cmd() {
        assert_eq!(
            parse_command_topic("vineguard/o/s/n/cmd"),
            Some(NodeKey::new("o", "s", "n"))
        );
        assert_eq!(parse_command_topic("vineguard/o/s/cmd"), None);
        assert_eq!(parse_command_topic("vineguard/o/s/n/x/cmd"), None);
        assert_eq!(parse_command_topic("vineguard/o/s/n/telemetry"), None);
        assert_eq!(parse_command_topic(""), None);
    }

    #[tokio::test]
    async fn uplink_is_spooled_while_the_link_is_down() {
        let test = test_gateway();
        let source = StubSource::named("udp");

        test.gateway.handle_message(sample_message(source, "n1"));

        let batch = test.gateway.spool.get_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].topic, "vineguard/o/s/n1/telemetry");
    }

    #[tokio::test]
    async fn enriched_output_is_byte_stable_and_sorted() {
        let test = test_gateway();
        let source = StubSource::named("udp");

        test.gateway
            .handle_message(sample_message(source.clone(), "n1"));
        test.gateway.handle_message(sample_message(source, "n1"));

        let batch = test.gateway.spool.get_batch(10).unwrap();
        assert_eq!(batch[0].payload, batch[1].payload);

        let expected = concat!(
            r#"{"gatewayId":"gw-test","#,
            r#""ingress":{"remote":"127.0.0.1:9999","source":"udp","transport":"udp"},"#,
            r#""metrics":{"t":21.0},"#,
            r#""nodeId":"n1","orgId":"o","#,
            r#""receivedAt":"2024-01-01T00:00:00Z","siteId":"s","#,
            r#""timestamp":"2024-01-01T00:00:00Z"}"#,
        );
        assert_eq!(batch[0].payload, expected);
    }

    #[tokio::test]
    async fn rejected_uplinks_touch_neither_spool_nor_registry() {
        let test = test_gateway();
        let source = StubSource::named("udp");

        test.gateway.handle_message(SourceMessage {
            source: source.clone(),
            payload: json!({"orgId": "o", "siteId": "s", "nodeId": "n",
                            "timestamp": "2024-01-01T00:00:00Z", "metrics": {}}),
            context: IngressContext::udp("127.0.0.1:9999".parse().unwrap()),
        });

        assert_eq!(test.gateway.spool.count().unwrap(), 0);
        assert!(test.gateway.node_sources.lock().unwrap().is_empty());
        assert!(source.registered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commands_are_routed_to_the_last_source_that_saw_the_node() {
        let test = test_gateway();
        let first = StubSource::named("udp");
        let second = StubSource::named("lora");

        test.gateway
            .handle_message(sample_message(first.clone(), "n1"));
        test.gateway
            .handle_message(sample_message(second.clone(), "n1"));

        test.gateway.handle_command(&Message::new("vineguard/o/s/n1/cmd", &b"PING"[..]));

        assert!(first.downlinks.lock().unwrap().is_empty());
        let downlinks = second.downlinks.lock().unwrap();
        assert_eq!(*downlinks, [(NodeKey::new("o", "s", "n1"), b"PING".to_vec())]);
    }

    #[tokio::test]
    async fn commands_for_unknown_nodes_are_dropped() {
        let test = test_gateway();
        let source = StubSource::named("udp");
        test.gateway
            .handle_message(sample_message(source.clone(), "n1"));

        test.gateway.handle_command(&Message::new("vineguard/x/y/z/cmd", &b"PING"[..]));
        test.gateway.handle_command(&Message::new("vineguard/too/short/cmd", &b"PING"[..]));

        assert!(source.downlinks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn uplinks_register_the_node_with_its_source() {
        let test = test_gateway();
        let source = StubSource::named("udp");

        test.gateway
            .handle_message(sample_message(source.clone(), "n1"));

        assert_eq!(
            *source.registered.lock().unwrap(),
            [NodeKey::new("o", "s", "n1")]
        );
    }

    #[tokio::test]
    async fn flush_with_a_disconnected_link_leaves_the_spool_intact() {
        let test = test_gateway();
        let source = StubSource::named("udp");
        test.gateway.handle_message(sample_message(source, "n1"));

        test.gateway.flush_queue().await;

        assert_eq!(test.gateway.spool.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn health_reflects_traffic_and_connection_state() {
        let test = test_gateway();

        let initial = test.gateway.build_health_status().unwrap();
        assert_eq!(
            initial,
            HealthStatus {
                status: "degraded",
                mqtt_connected: false,
                queued_messages: 0,
                last_message_received: None,
                last_publish_success: None,
            }
        );

        let source = StubSource::named("udp");
        test.gateway.handle_message(sample_message(source, "n1"));

        let after_uplink = test.gateway.build_health_status().unwrap();
        assert_eq!(after_uplink.queued_messages, 1);
        assert_eq!(
            after_uplink.last_message_received.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(after_uplink.last_publish_success, None);
    }

    #[tokio::test]
    async fn health_serialises_with_camel_case_fields() {
        let test = test_gateway();
        let status = test.gateway.build_health_status().unwrap();
        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(
            value,
            json!({
                "status": "degraded",
                "mqttConnected": false,
                "queuedMessages": 0,
                "lastMessageReceived": null,
                "lastPublishSuccess": null,
            })
        );
    }
}
