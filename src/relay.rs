// The relay consumer. `Relay` holds everything the connect and message
// handlers need (topic, subscriber, optional forwarder, output sink) and
// processes `RelayEvent`s strictly one at a time from the pump's channel.
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::cellular::CellularSession;
use crate::error::RelayError;
use crate::message::{Message, RelayEvent};

/// Anything that can register a subscription with the broker.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), RelayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Connecting,
    Subscribed,
    Forwarding,
    Crashed,
    ShutDown,
}

pub struct Relay<S, W> {
    topic: String,
    qos: QoS,
    subscriber: S,
    forwarder: Option<Arc<dyn CellularSession>>,
    out: W,
    state: RelayState,
}

impl<S: Subscriber, W: Write + Send> Relay<S, W> {
    pub fn new(topic: impl Into<String>, qos: QoS, subscriber: S, out: W) -> Self {
        Self {
            topic: topic.into(),
            qos,
            subscriber,
            forwarder: None,
            out,
            state: RelayState::Init,
        }
    }

    /// Forward every message through `session` after printing it.
    pub fn with_forwarder(mut self, session: Arc<dyn CellularSession>) -> Self {
        self.forwarder = Some(session);
        self
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Consume events until `shutdown` resolves, the broker goes away or a
    /// handler fails. Already queued events are handled before shutdown is
    /// honoured, but a handler still in flight is abandoned when it fires.
    /// The idle tick only logs.
    pub async fn run<F>(
        &mut self,
        mut events: mpsc::Receiver<RelayEvent>,
        shutdown: F,
        idle: Duration,
    ) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = time::interval(idle);
        self.state = RelayState::Connecting;

        loop {
            tokio::select! {
                biased;

                ev = events.recv() => {
                    let Some(ev) = ev else {
                        return self.crash(RelayError::EventStreamClosed);
                    };
                    tokio::select! {
                        biased;

                        outcome = self.handle(ev) => {
                            if let Err(e) = outcome {
                                return self.crash(e);
                            }
                        }
                        _ = &mut shutdown => {
                            warn!("interrupted while a handler was in flight");
                            self.interrupted();
                            return Ok(());
                        }
                    }
                }
                _ = &mut shutdown => {
                    self.interrupted();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    debug!(state = ?self.state, "relay idle");
                }
            }
        }
    }

    fn crash(&mut self, e: RelayError) -> Result<(), RelayError> {
        error!(error = %e, "relay crashed");
        self.state = RelayState::Crashed;
        Err(e)
    }

    fn interrupted(&mut self) {
        info!("interrupted, shutting down relay");
        self.state = RelayState::ShutDown;
    }

    pub async fn handle(&mut self, event: RelayEvent) -> Result<(), RelayError> {
        match event {
            RelayEvent::Connected { code } => self.on_connect(code).await,
            RelayEvent::Message(msg) => self.on_message(&msg).await,
            RelayEvent::BrokerLost(reason) => Err(RelayError::BrokerLost(reason)),
        }
    }

    /// Subscribe once per connection. A repeated CONNACK does not subscribe again.
    pub async fn on_connect(&mut self, code: u8) -> Result<(), RelayError> {
        writeln!(self.out, "Connected with result code {code}")?;
        if code != 0 {
            return Err(RelayError::ConnectionRefused(code));
        }
        if self.state != RelayState::Connecting {
            warn!(state = ?self.state, "duplicate CONNACK ignored");
            return Ok(());
        }

        self.subscriber.subscribe(&self.topic, self.qos).await?;
        info!(topic = %self.topic, "subscribed");
        self.state = if self.forwarder.is_some() {
            RelayState::Forwarding
        } else {
            RelayState::Subscribed
        };
        Ok(())
    }

    pub async fn on_message(&mut self, msg: &Message) -> Result<(), RelayError> {
        if !msg.is_text() {
            warn!(
                topic = %msg.topic(),
                bytes = msg.payload().len(),
                "payload is not valid UTF-8, relaying lossy text"
            );
        }
        let text = msg.payload_text();
        writeln!(self.out, "{} {}", msg.topic(), text)?;

        if let Some(session) = &self.forwarder {
            let response = session.send_message(&text, &[msg.topic().to_string()]).await?;
            if !response.is_ok() {
                warn!(
                    code = response.code.code(),
                    "cloud rejected message: {}",
                    response.code.description()
                );
            }
            writeln!(self.out, "{response}")?;
        }
        self.out.flush()?;
        Ok(())
    }
}
