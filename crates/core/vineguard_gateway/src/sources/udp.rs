use super::IngressContext;
use super::MessageSender;
use super::PacketSource;
use super::SourceError;
use super::SourceMessage;
use crate::telemetry::NodeKey;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

/// Largest datagram the source will accept.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Ingress for lab nodes and the simulator: one UTF-8 JSON telemetry
/// document per UDP datagram.
///
/// The peer address of the latest uplink is remembered per node, so
/// downlink commands can be sent back to wherever the node last spoke from.
pub struct UdpJsonSource {
    host: String,
    port: u16,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    node_addresses: Mutex<HashMap<NodeKey, SocketAddr>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpJsonSource {
    pub fn new(host: impl Into<String>, port: u16) -> UdpJsonSource {
        UdpJsonSource {
            host: host.into(),
            port,
            socket: Mutex::new(None),
            node_addresses: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// The bound address, once started. Binding to port 0 picks a free port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.socket.lock().unwrap();
        socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl PacketSource for UdpJsonSource {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn start(self: Arc<Self>, messages: MessageSender) -> Result<(), SourceError> {
        let socket = UdpSocket::bind((self.host.as_str(), self.port))
            .await
            .map(Arc::new)
            .map_err(|source| SourceError::Bind {
                addr: format!("{}:{}", self.host, self.port),
                source,
            })?;
        info!(host = %self.host, port = self.port, "UDP source started");
        *self.socket.lock().unwrap() = Some(socket.clone());

        let source = self.clone();
        let task = tokio::spawn(async move {
            source.receive_loop(socket, messages).await;
        });
        *self.task.lock().unwrap() = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("UDP source stopped");
        }
        *self.socket.lock().unwrap() = None;
    }

    fn register_node(&self, node: &NodeKey, context: &IngressContext) {
        if let Some(remote) = context.remote {
            self.node_addresses.lock().unwrap().insert(node.clone(), remote);
        }
    }

    fn send_downlink(&self, node: &NodeKey, payload: &[u8]) -> bool {
        let socket = self.socket.lock().unwrap().clone();
        let Some(socket) = socket else {
            warn!(node = %node, "UDP transport not ready for downlink");
            return false;
        };
        let remote = self.node_addresses.lock().unwrap().get(node).copied();
        let Some(remote) = remote else {
            warn!(node = %node, "no UDP endpoint known for node");
            return false;
        };
        match socket.try_send_to(payload, remote) {
            Ok(_) => {
                info!(node = %node, remote = %remote, "sent UDP downlink");
                true
            }
            Err(err) => {
                warn!(node = %node, remote = %remote, error = %err, "failed to send UDP downlink");
                false
            }
        }
    }
}

impl UdpJsonSource {
    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>, messages: MessageSender) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(error = %err, "UDP receive error");
                            continue;
                        }
                    };
                    let payload: Value = match serde_json::from_slice(&buf[..len]) {
                        Ok(payload) => payload,
                        Err(_) => {
                            warn!(remote = %peer, "dropping datagram that is not valid JSON");
                            continue;
                        }
                    };
                    let source: Arc<dyn PacketSource> = self.clone();
                    let message = SourceMessage {
                        source,
                        payload,
                        context: IngressContext::udp(peer),
                    };
                    if messages.send(message).await.is_err() {
                        // gateway is gone, nothing left to deliver to
                        break;
                    }
                }
            }
        }
    }
}
