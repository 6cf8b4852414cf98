use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::agent::{Agent, AgentRegistry};
use crate::events::ClientEvent;
use crate::listener::ListenerRegistry;
use crate::registry::ExtensionRegistry;
use crate::transport::Transport;

/// Outcome of one bootstrap run.
#[derive(Debug, Clone, Default)]
pub struct MetaSummary {
    pub listeners: usize,
    pub agents: usize,
    pub console_entries: usize,
    pub failures: Vec<String>,
}

/// One-shot worker pulling baseline server state before live events run.
///
/// Linear sequence: listeners, then agents (with per-agent console history).
/// A failing phase is reported and skipped, it never aborts the other phase,
/// and the finished notification is delivered exactly once, unconditionally,
/// after both phases. The event stream must not start before it.
pub struct MetaWorker {
    transport: Arc<Transport>,
    agents: Arc<AgentRegistry>,
    listeners: Arc<ListenerRegistry>,
    registry: Arc<ExtensionRegistry>,
    notify: mpsc::UnboundedSender<ClientEvent>,
}

impl MetaWorker {
    pub fn new(
        transport: Arc<Transport>,
        agents: Arc<AgentRegistry>,
        listeners: Arc<ListenerRegistry>,
        registry: Arc<ExtensionRegistry>,
        notify: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        MetaWorker {
            transport,
            agents,
            listeners,
            registry,
            notify,
        }
    }

    pub async fn run(self) -> MetaSummary {
        let mut summary = MetaSummary::default();

        self.pull_listeners(&mut summary).await;
        self.pull_agents(&mut summary).await;

        log::info!(
            "bootstrap finished: {} listeners, {} agents, {} console entries",
            summary.listeners,
            summary.agents,
            summary.console_entries
        );

        let _ = self
            .notify
            .send(ClientEvent::BootstrapFinished(summary.clone()));

        summary
    }

    fn notice(&self, title: &str, body: String) {
        let _ = self.notify.send(ClientEvent::Notice {
            title: title.to_string(),
            body,
        });
    }

    /// Fetch a list endpoint, tolerating failure: a transport error or
    /// non-200 surfaces a notice and yields no items for this phase only.
    async fn pull_array(
        &self,
        endpoint: &str,
        body: Value,
        title: &str,
        summary: &mut MetaSummary,
    ) -> Vec<Value> {
        let (status, value) = match self.transport.send_json(endpoint, &body).await {
            Ok(result) => result,
            Err(e) => {
                summary.failures.push(format!("{}: {}", endpoint, e));
                self.notice(title, e.to_string());
                return Vec::new();
            }
        };

        if status != 200 {
            summary
                .failures
                .push(format!("{}: status code {}", endpoint, status));
            self.notice(title, format!("unexpected status code {}", status));
            return Vec::new();
        }

        match value {
            Value::Array(items) => items,
            other => {
                log::error!("{} response is not an array: {}", endpoint, other);
                summary.failures.push(format!("{}: not an array", endpoint));
                Vec::new()
            }
        }
    }

    async fn pull_listeners(&self, summary: &mut MetaSummary) {
        log::debug!("pulling active listeners");

        let items = self
            .pull_array(
                "/api/listener/list",
                json!({}),
                "listener processing failure",
                summary,
            )
            .await;

        for item in items {
            if !item.is_object() {
                log::warn!("listener entry is not an object, skipping");
                continue;
            }

            match self.listeners.add(item.clone()) {
                Ok(_) => {
                    summary.listeners += 1;
                    let _ = self.notify.send(ClientEvent::ListenerAdded(item));
                }
                Err(e) => log::warn!("skipping listener entry: {}", e),
            }
        }
    }

    async fn pull_agents(&self, summary: &mut MetaSummary) {
        log::debug!("pulling agent sessions");

        let items = self
            .pull_array(
                "/api/agent/list",
                json!({}),
                "agent processing failure",
                summary,
            )
            .await;

        for item in items {
            let agent = match Agent::from_value(&item) {
                Ok(agent) => agent,
                Err(e) => {
                    log::warn!("skipping agent entry: {}", e);
                    continue;
                }
            };

            let uuid = agent.uuid.clone();
            let kind = agent.kind.clone();

            if self.agents.discovered(agent) {
                summary.agents += 1;
                let _ = self.notify.send(ClientEvent::AgentDiscovered(uuid.clone()));
            }

            self.attach_interface(&kind, &uuid);
            self.pull_console(&uuid, summary).await;
        }
    }

    /// Hand the discovered agent to its registered agent-interface handler,
    /// isolating extension faults.
    fn attach_interface(&self, kind: &str, uuid: &str) {
        let Some(handler) = self.registry.agent_interface(kind) else {
            log::debug!("no agent interface registered for type '{}'", kind);
            return;
        };

        let Some(agent) = self.agents.get(uuid) else {
            return;
        };

        if let Err(e) = handler.attach(&agent) {
            log::warn!("agent interface '{}' failed to attach {}: {}", kind, uuid, e);
        }
    }

    async fn pull_console(&self, uuid: &str, summary: &mut MetaSummary) {
        let items = self
            .pull_array(
                "/api/agent/console",
                json!({ "uuid": uuid }),
                "agent console processing failure",
                summary,
            )
            .await;

        for entry in items {
            if !entry.is_object() {
                log::warn!("console entry is not an object, skipping");
                continue;
            }

            self.agents.append_console(uuid, entry.clone());
            summary.console_entries += 1;

            let _ = self.notify.send(ClientEvent::AgentConsole {
                uuid: uuid.to_string(),
                entry,
            });
        }
    }
}
