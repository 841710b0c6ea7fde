//! MQTT transport.
//!
//! One background listener per connector is the only thing touching the wire
//! for inbound traffic: it polls the rumqttc event loop, decodes every
//! publish under the protocol namespace and pushes the results into the
//! shared [`InboundQueue`]. `send_request`/`send_broadcast` never read the
//! wire; they poll the queue with the correlation predicates from
//! [`crate::connector`]. The queue may be shared by several connector
//! instances, and that filtering keeps one instance from consuming another's
//! traffic.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use homelink_core::paths::PROTOCOL_TOPIC_FILTER;
use homelink_core::{Publisher, Request, Subscriber};

use crate::codec;
use crate::connector::{await_broadcast, await_unicast, NetworkConnector, RequestOutcome};
use crate::error::{NetworkError, Result};
use crate::inbound::InboundQueue;

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host.
    pub broker: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client id; a random one is generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

impl MqttConfig {
    /// Create a configuration for `broker` with defaults.
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set authentication.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

/// Connector over an MQTT broker.
///
/// Subscribes once, at construction, to the whole protocol namespace.
/// [`MqttConnector::shutdown`] disconnects exactly once; later sends fail
/// with [`NetworkError::NotConnected`]. Losing the broker mid-call fails the
/// pending wait with [`NetworkError::Transport`] instead of letting it run
/// out its timeout.
pub struct MqttConnector {
    own_id: String,
    broker_addr: String,
    client: parking_lot::Mutex<Option<AsyncClient>>,
    inbound: Arc<InboundQueue>,
    publisher: Publisher,
    connected: Arc<watch::Sender<bool>>,
    listener: parking_lot::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl MqttConnector {
    /// Connect to the broker and start the background listener feeding
    /// `inbound`.
    pub async fn connect(
        config: &MqttConfig,
        own_id: impl Into<String>,
        inbound: Arc<InboundQueue>,
    ) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("homelink_{}", Uuid::new_v4()));

        let mut opts = MqttOptions::new(client_id, &config.broker, config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            opts.set_credentials(username, password);
        }

        let (client, mut event_loop) = AsyncClient::new(opts, 64);
        client
            .subscribe(PROTOCOL_TOPIC_FILTER, QoS::AtMostOnce)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("mqtt subscribe failed: {e}")))?;

        let broker_addr = config.broker_addr();
        let (connected, _) = watch::channel(true);
        let connected = Arc::new(connected);

        let listener = {
            let inbound = Arc::clone(&inbound);
            let connected = Arc::clone(&connected);
            let broker_addr = broker_addr.clone();
            tokio::spawn(async move {
                info!(broker = %broker_addr, "launching mqtt listener");
                loop {
                    match event_loop.poll().await {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            match codec::decode_body(&publish.topic, &publish.payload) {
                                Ok(req) => {
                                    if !inbound.push(req) {
                                        debug!(topic = %publish.topic, "no inbound receivers, message dropped");
                                    }
                                }
                                Err(e) => {
                                    debug!(topic = %publish.topic, error = %e, "dropping undecodable mqtt message");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            connected.send_replace(false);
                            error!(broker = %broker_addr, error = %e, "mqtt listener stopping");
                            return Err(NetworkError::Transport(format!(
                                "mqtt event loop failed: {e}"
                            )));
                        }
                    }
                }
            })
        };

        Ok(Self {
            own_id: own_id.into(),
            broker_addr,
            client: parking_lot::Mutex::new(Some(client)),
            inbound,
            publisher: Publisher::new(),
            connected,
            listener: parking_lot::Mutex::new(Some(listener)),
        })
    }

    /// Take ownership of the listener task, e.g. to join on it and decide
    /// what a transport fault means for the application.
    pub fn take_listener(&self) -> Option<JoinHandle<Result<()>>> {
        self.listener.lock().take()
    }

    /// Disconnect from the broker. The first call tears the connection down
    /// and fails any in-flight wait with a transport fault; any later call is
    /// a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let client = self.client.lock().take();
        let Some(client) = client else {
            return Ok(());
        };
        self.connected.send_replace(false);
        info!(broker = %self.broker_addr, "mqtt connector shutting down");
        if let Err(e) = client.disconnect().await {
            // The broker may already be gone; shutdown still succeeded.
            debug!(broker = %self.broker_addr, error = %e, "mqtt disconnect failed");
        }
        Ok(())
    }

    async fn publish_request(&self, req: &Request) -> Result<()> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or(NetworkError::NotConnected)?;
        client
            .publish(req.path(), QoS::AtMostOnce, false, codec::encode_body(req))
            .await
            .map_err(|e| NetworkError::Transport(format!("mqtt publish failed: {e}")))
    }

    fn link_lost(&self) -> NetworkError {
        NetworkError::Transport(format!("mqtt connection to {} lost", self.broker_addr))
    }
}

impl Drop for MqttConnector {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl NetworkConnector for MqttConnector {
    fn connector_type(&self) -> &str {
        "mqtt"
    }

    fn own_id(&self) -> &str {
        &self.own_id
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow() && self.client.lock().is_some()
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.publisher.subscribe(subscriber);
    }

    fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> homelink_core::Result<()> {
        self.publisher.unsubscribe(subscriber)
    }

    async fn send_request(&self, req: &Request, timeout: Duration) -> Result<RequestOutcome> {
        // Subscribe before publishing so the response cannot slip past, and
        // hold the claim for the whole wait so the dispatcher leaves this
        // session's traffic alone.
        let mut rx = self.inbound.subscribe();
        let mut link = self.connected.subscribe();
        let _claim = self.inbound.claim(req.session_id());
        self.publish_request(req).await?;
        tokio::select! {
            outcome = await_unicast(&mut rx, &self.inbound, &self.publisher, req, timeout) => {
                outcome
            }
            _ = link.wait_for(|up| !up) => Err(self.link_lost()),
        }
    }

    async fn send_broadcast(
        &self,
        req: &Request,
        timeout: Duration,
        responses_awaited: usize,
    ) -> Result<Vec<Request>> {
        let mut rx = self.inbound.subscribe();
        let mut link = self.connected.subscribe();
        let _claim = self.inbound.claim(req.session_id());
        self.publish_request(req).await?;
        tokio::select! {
            responses = await_broadcast(
                &mut rx,
                &self.inbound,
                &self.publisher,
                req,
                timeout,
                responses_awaited,
            ) => responses,
            _ = link.wait_for(|up| !up) => Err(self.link_lost()),
        }
    }
}
