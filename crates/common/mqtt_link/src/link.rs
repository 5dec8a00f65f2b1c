use crate::config::Backoff;
use crate::config::LinkConfig;
use crate::errors::LinkError;
use crate::messages::Message;
use crate::topics::TopicFilter;
use rumqttc::AsyncClient;
use rumqttc::ConnectReturnCode;
use rumqttc::Event;
use rumqttc::EventLoop;
use rumqttc::Incoming;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Invoked with `true` on every successful connect and `false` on every
/// disconnect. Runs on the event-loop task: implementations must only
/// schedule work, never block or await.
pub type ConnectionListener = Box<dyn Fn(bool) + Send + Sync>;

/// Invoked from the event-loop task for every message received on a
/// subscribed topic.
pub type CommandHandler = Box<dyn Fn(Message) + Send + Sync>;

/// How long `stop` waits for a clean disconnect before aborting the loop.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// A connection to the cloud MQTT broker.
///
/// The broker session is persistent (named after the client id) and the
/// connection self-heals: the background task reconnects with exponential
/// backoff and re-applies the registered subscriptions on every connect.
/// Publishing is gated on the connection state and never blocks; a refused
/// publish is the caller's signal to spool the message instead.
pub struct CloudLink {
    state: Arc<LinkState>,
    backoff: Backoff,
    event_loop: Mutex<Option<EventLoop>>,
    on_message: Mutex<Option<CommandHandler>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct LinkState {
    client: AsyncClient,
    connected: AtomicBool,
    stopping: AtomicBool,
    listeners: Mutex<Vec<ConnectionListener>>,
    subscriptions: Mutex<TopicFilter>,
    publish_gate: Mutex<()>,
}

impl CloudLink {
    /// Build the client for the given `config`.
    ///
    /// Nothing touches the network until [`CloudLink::start`] is called;
    /// `on_command` will be invoked for every publish received on the
    /// subscribed topics.
    pub fn new(
        config: &LinkConfig,
        on_command: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<CloudLink, LinkError> {
        let options = config.rumqttc_options()?;
        let (client, event_loop) = AsyncClient::new(options, config.queue_capacity);

        Ok(CloudLink {
            state: Arc::new(LinkState {
                client,
                connected: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(TopicFilter::empty()),
                publish_gate: Mutex::new(()),
            }),
            backoff: config.backoff,
            event_loop: Mutex::new(Some(event_loop)),
            on_message: Mutex::new(Some(Box::new(on_command))),
            task: Mutex::new(None),
        })
    }

    /// Spawn the network loop and let it connect in the background.
    ///
    /// An unreachable broker is not an error: the loop keeps retrying within
    /// the configured backoff bounds.
    pub fn start(&self) {
        let Some(event_loop) = self.event_loop.lock().unwrap().take() else {
            debug!("MQTT link already started");
            return;
        };
        let Some(on_message) = self.on_message.lock().unwrap().take() else {
            return;
        };

        let state = self.state.clone();
        let backoff = self.backoff;
        let task = tokio::spawn(run_event_loop(state, event_loop, on_message, backoff));
        *self.task.lock().unwrap() = Some(task);
    }

    /// Disconnect and halt the network loop. Errors are logged only.
    pub async fn stop(&self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = self.state.client.try_disconnect() {
            debug!(error = %err, "MQTT disconnect request was not accepted");
        }

        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task)
                .await
                .is_err()
            {
                task.abort();
                let _ = task.await;
            }
        }
    }

    /// Best-effort QoS 1 publish.
    ///
    /// Returns `false` when the link is down or the client refuses the
    /// message; it does not wait for the broker acknowledgement.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        let _gate = self.state.publish_gate.lock().unwrap();
        if !self.state.connected.load(Ordering::SeqCst) {
            return false;
        }
        match self
            .state
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
        {
            Ok(()) => true,
            Err(err) => {
                warn!(topic, error = %err, "MQTT publish refused by the client");
                false
            }
        }
    }

    /// Register a QoS 1 subscription.
    ///
    /// Applied immediately when connected; otherwise deferred to the next
    /// successful connect. Either way the pattern is re-applied on every
    /// reconnect.
    pub fn subscribe(&self, pattern: &str) -> Result<(), LinkError> {
        let filter = TopicFilter::new(pattern)?;
        self.state
            .subscriptions
            .lock()
            .unwrap()
            .add_all(filter.clone());

        if self.is_connected() {
            if let Err(err) = self.state.client.try_subscribe_many(filter.filters()) {
                warn!(pattern, error = %err, "MQTT subscription deferred to next reconnect");
            }
        } else {
            debug!(pattern, "MQTT subscription deferred until connected");
        }
        Ok(())
    }

    /// Register a connection listener. Listeners are expected to be
    /// registered before `start` and are never removed.
    pub fn add_connection_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        self.state.listeners.lock().unwrap().push(Box::new(listener));
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }
}

impl LinkState {
    fn notify_listeners(&self, connected: bool) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener(connected);
        }
    }

    fn apply_subscriptions(&self) {
        let filters = self.subscriptions.lock().unwrap().filters();
        if filters.is_empty() {
            return;
        }
        // rumqttc does not replay subscriptions client-side, and the broker
        // may have lost the session: re-subscribing is idempotent.
        if let Err(err) = self.client.try_subscribe_many(filters) {
            warn!(error = %err, "failed to re-apply MQTT subscriptions");
        }
    }
}

async fn run_event_loop(
    state: Arc<LinkState>,
    mut event_loop: EventLoop,
    on_message: CommandHandler,
    backoff: Backoff,
) {
    let mut delay = backoff.base;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!(session_present = ack.session_present, "MQTT connection established");
                    delay = backoff.base;
                    state.connected.store(true, Ordering::SeqCst);
                    state.apply_subscriptions();
                    state.notify_listeners(true);
                } else {
                    error!(code = ?ack.code, "MQTT broker refused the connection");
                }
            }

            Ok(Event::Incoming(Packet::Publish(publish))) => {
                on_message(Message::from(publish));
            }

            Ok(Event::Incoming(Incoming::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                if state.connected.swap(false, Ordering::SeqCst) {
                    state.notify_listeners(false);
                }
                info!("MQTT connection closed");
                if state.stopping.load(Ordering::SeqCst) {
                    break;
                }
            }

            Ok(_) => (),

            Err(err) => {
                if state.connected.swap(false, Ordering::SeqCst) {
                    state.notify_listeners(false);
                }
                if state.stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %err, next_attempt_in = ?delay, "MQTT connection error, backing off");
                tokio::time::sleep(delay).await;
                delay = backoff.advance(delay);
            }
        }
    }
}
