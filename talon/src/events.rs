use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::meta::MetaSummary;
use crate::transport::Transport;

/// Persistent event stream endpoint; newline-delimited event envelopes.
pub const EVENT_ENDPOINT: &str = "/api/event/stream";

/// A single server-pushed event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub tag: String,

    #[serde(default)]
    pub data: Value,
}

/// Notifications from background workers to the operator-facing context.
///
/// Background tasks never touch UI-owned state directly; everything crosses
/// over through this channel.
#[derive(Debug)]
pub enum ClientEvent {
    ListenerAdded(Value),
    ListenerRemoved(String),
    AgentDiscovered(String),
    AgentConsole { uuid: String, entry: Value },
    AgentStatus { uuid: String, status: String },
    HeartbeatTick,
    BootstrapFinished(MetaSummary),
    /// Terminal: the event stream closed and the session is over.
    EventsClosed,
    /// User-visible failure with a short title and descriptive body.
    Notice { title: String, body: String },
}

type EventHandler = Box<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct Subscriber {
    /// Event tag this subscriber wants, `None` for every event
    tag: Option<String>,
    name: String,
    handler: EventHandler,
}

/// Demultiplexes parsed events to interested subscribers.
///
/// A failing subscriber is isolated: its error is logged as an extension
/// fault and delivery continues to the remaining subscribers.
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, tag: &str, name: &str, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Subscriber {
            tag: Some(tag.to_string()),
            name: name.to_string(),
            handler: Box::new(handler),
        });
    }

    /// Subscribe to every event regardless of tag.
    pub fn subscribe_all<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Subscriber {
            tag: None,
            name: name.to_string(),
            handler: Box::new(handler),
        });
    }

    pub fn dispatch(&self, event: &Event) {
        let subscribers = self.subscribers.lock().unwrap();

        for subscriber in subscribers.iter() {
            let interested = match &subscriber.tag {
                Some(tag) => *tag == event.tag,
                None => true,
            };

            if !interested {
                continue;
            }

            if let Err(e) = (subscriber.handler)(event) {
                log::warn!(
                    "subscriber '{}' failed on event '{}': {}",
                    subscriber.name,
                    event.tag,
                    e
                );
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived worker receiving server-pushed events for the whole session.
///
/// Runs on its own task after the bootstrap worker finished. Malformed
/// messages are dropped with a warning; connection closure is terminal and
/// surfaces as `ClientEvent::EventsClosed`. There is no reconnect, the
/// operator restarts and re-authenticates.
pub struct EventWorker {
    transport: Arc<Transport>,
    dispatcher: Arc<EventDispatcher>,
    notify: mpsc::UnboundedSender<ClientEvent>,
}

impl EventWorker {
    pub fn new(
        transport: Arc<Transport>,
        dispatcher: Arc<EventDispatcher>,
        notify: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        EventWorker {
            transport,
            dispatcher,
            notify,
        }
    }

    pub async fn run(self) {
        if let Err(e) = self.stream().await {
            log::error!("event stream failed: {}", e);
        }

        log::error!("event stream closed");
        let _ = self.notify.send(ClientEvent::EventsClosed);
    }

    async fn stream(&self) -> Result<()> {
        let mut stream = self.transport.open_stream(EVENT_ENDPOINT).await?;
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Transport(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                self.handle_message(&line[..line.len() - 1]);
            }
        }

        Ok(())
    }

    /// Parse one event envelope and dispatch it. Parse failures drop the
    /// message without closing the connection.
    fn handle_message(&self, message: &[u8]) {
        if message.is_empty() {
            return;
        }

        match serde_json::from_slice::<Event>(message) {
            Ok(event) => self.dispatcher.dispatch(&event),
            Err(e) => log::warn!("dropping unparsable event: {}", e),
        }
    }
}
