//! Serial transport.
//!
//! A [`SerialConnector`] exclusively owns one open serial port and speaks the
//! line framing from [`crate::codec`] over it. Waits hold the I/O lock for
//! their whole duration, which serializes the idle listener against in-flight
//! calls on a port only one party may read.
//!
//! The connector is generic over the byte stream so tests can drive it with
//! an in-memory duplex pipe; production code uses [`SerialConnector::open`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use homelink_core::{Publisher, Request, Subscriber};

use crate::codec::{self, Decoded};
use crate::connector::{
    matches_broadcast, matches_unicast, poll_slice, NetworkConnector, RequestOutcome,
    MAX_POLL_SLICE,
};
use crate::dispatch::RequestHandler;
use crate::error::{NetworkError, Result};

/// Serial port configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name, e.g. `/dev/ttyUSB0`.
    pub port: String,

    /// Baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    115_200
}

impl SerialConfig {
    /// Create a configuration for `port` at the default baud rate.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
        }
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// One decoded read attempt on the port.
enum SerialEvent {
    Frame(Request),
    RemoteFault(String),
}

/// Connector over one exclusively-owned serial port.
pub struct SerialConnector<S = SerialStream> {
    own_id: String,
    port_name: String,
    io: Mutex<Framed<S, LinesCodec>>,
    publisher: Publisher,
    connected: AtomicBool,
}

impl SerialConnector<SerialStream> {
    /// Open the configured port.
    pub fn open(config: &SerialConfig, own_id: impl Into<String>) -> Result<Self> {
        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .open_native_async()
            .map_err(|e| {
                NetworkError::ConnectionFailed(format!(
                    "cannot open serial port '{}': {e}",
                    config.port
                ))
            })?;
        info!(port = %config.port, baud_rate = config.baud_rate, "serial port opened");
        Ok(Self::from_stream(stream, own_id, &config.port))
    }
}

impl<S> SerialConnector<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Build a connector over an arbitrary byte stream.
    ///
    /// Used by tests and loopback setups; `open` is the production entry
    /// point.
    pub fn from_stream(stream: S, own_id: impl Into<String>, port_name: &str) -> Self {
        Self {
            own_id: own_id.into(),
            port_name: port_name.to_string(),
            io: Mutex::new(Framed::new(stream, LinesCodec::new())),
            publisher: Publisher::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Write one framed request to the port.
    async fn write_frame(&self, io: &mut Framed<S, LinesCodec>, req: &Request) -> Result<()> {
        let line = codec::encode_frame(req);
        let stream = io.get_mut();
        if let Err(e) = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        }
        .await
        {
            self.connected.store(false, Ordering::SeqCst);
            return Err(NetworkError::Io(e));
        }
        Ok(())
    }

    /// Try to read one protocol event within `slice`.
    ///
    /// `Ok(None)` means the slice elapsed or the line was noise or
    /// undecodable; the caller rechecks its deadline and polls again. I/O
    /// failures are fatal for the connector.
    async fn read_event(
        &self,
        io: &mut Framed<S, LinesCodec>,
        slice: Duration,
    ) -> Result<Option<SerialEvent>> {
        let line = match tokio::time::timeout(slice, io.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(NetworkError::Transport(format!(
                    "serial port '{}' closed",
                    self.port_name
                )));
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(NetworkError::Io(e));
            }
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                warn!(port = %self.port_name, "dropping overlong serial line");
                return Ok(None);
            }
            Ok(Some(Ok(line))) => line,
        };

        match codec::decode_frame(&line) {
            Ok(Decoded::Request(req)) => Ok(Some(SerialEvent::Frame(req))),
            Ok(Decoded::RemoteFault(backtrace)) => Ok(Some(SerialEvent::RemoteFault(backtrace))),
            Ok(Decoded::Noise) => Ok(None),
            Err(e) => {
                debug!(port = %self.port_name, error = %e, "dropping undecodable serial line");
                Ok(None)
            }
        }
    }

    /// Run the idle read-and-dispatch loop for this port.
    ///
    /// Every decoded frame goes to `handler` and to this connector's
    /// subscribers. Remote faults are logged; a transport fault ends the task
    /// with the error so the owner can decide whether to reopen the port.
    pub fn spawn_listener(
        self: &Arc<Self>,
        handler: Arc<dyn RequestHandler>,
    ) -> JoinHandle<Result<()>> {
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            info!(port = %connector.port_name, "launching serial listener");
            loop {
                // Re-acquired every pass so pending sends get the port.
                let mut io = connector.io.lock().await;
                match connector.read_event(&mut io, MAX_POLL_SLICE).await {
                    Ok(Some(SerialEvent::Frame(req))) => {
                        drop(io);
                        handler.handle_request(req.clone()).await;
                        connector.publisher.publish(req).await;
                    }
                    Ok(Some(SerialEvent::RemoteFault(backtrace))) => {
                        warn!(port = %connector.port_name, %backtrace, "serial client crashed");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(port = %connector.port_name, error = %e, "serial listener stopping");
                        return Err(e);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<S> NetworkConnector for SerialConnector<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn connector_type(&self) -> &str {
        "serial"
    }

    fn own_id(&self) -> &str {
        &self.own_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.publisher.subscribe(subscriber);
    }

    fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> homelink_core::Result<()> {
        self.publisher.unsubscribe(subscriber)
    }

    async fn send_request(&self, req: &Request, timeout: Duration) -> Result<RequestOutcome> {
        let mut io = self.io.lock().await;
        self.write_frame(&mut io, req).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(RequestOutcome::no_response());
            }
            match self.read_event(&mut io, poll_slice(remaining)).await? {
                Some(SerialEvent::Frame(res)) => {
                    if matches_unicast(req, &res) {
                        return Ok(RequestOutcome::from_response(res));
                    }
                    // Unrelated traffic on the shared channel still reaches
                    // interested parties.
                    self.publisher.publish(res).await;
                }
                Some(SerialEvent::RemoteFault(backtrace)) => {
                    warn!(port = %self.port_name, %backtrace, "serial client crashed during request");
                    return Ok(RequestOutcome::remote_fault(&backtrace));
                }
                None => {}
            }
        }
    }

    async fn send_broadcast(
        &self,
        req: &Request,
        timeout: Duration,
        responses_awaited: usize,
    ) -> Result<Vec<Request>> {
        let mut io = self.io.lock().await;
        self.write_frame(&mut io, req).await?;

        let mut responses = Vec::new();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(responses);
            }
            match self.read_event(&mut io, poll_slice(remaining)).await? {
                Some(SerialEvent::Frame(res)) => {
                    if matches_broadcast(req, &res) {
                        responses.push(res);
                        if responses_awaited > 0 && responses.len() >= responses_awaited {
                            return Ok(responses);
                        }
                    } else {
                        self.publisher.publish(res).await;
                    }
                }
                Some(SerialEvent::RemoteFault(backtrace)) => {
                    warn!(port = %self.port_name, %backtrace, "serial client crashed during broadcast");
                    return Ok(responses);
                }
                None => {}
            }
        }
    }
}
