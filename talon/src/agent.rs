use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// A tracked agent session on a remote host.
///
/// Records are created when the bootstrap worker or the event stream reports
/// an unknown id and mutated on every event referencing that id. Hiding an
/// agent keeps the record (and its console history) around; only an explicit
/// remove discards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub uuid: String,

    /// Agent type tag, correlated to a registered agent-interface handler
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Parent agent for pivoted sessions
    #[serde(default)]
    pub parent: Option<String>,

    #[serde(default)]
    pub status: String,

    /// Last-contact timestamp as reported by the server (RFC 3339)
    #[serde(default)]
    pub last: String,

    /// Opaque metadata bag owned by the agent's handler
    #[serde(default)]
    pub meta: Value,

    #[serde(skip)]
    pub hidden: bool,

    /// Human-readable liveness text maintained by the heartbeat worker
    #[serde(skip)]
    pub last_text: String,

    #[serde(skip)]
    pub console: Vec<Value>,
}

impl Agent {
    /// Parse an agent object from a server response, requiring a valid uuid.
    pub fn from_value(value: &Value) -> Result<Agent> {
        if value.get("uuid").and_then(Value::as_str).is_none() {
            return Err(Error::Protocol(
                "agent object does not contain a valid uuid".to_string(),
            ));
        }

        serde_json::from_value(value.clone()).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// In-memory collection of agent records, shared between the bootstrap
/// worker, the event stream and the heartbeat worker. The sharded map
/// serializes concurrent mutation per entry.
pub struct AgentRegistry {
    agents: DashMap<String, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry {
            agents: DashMap::new(),
        }
    }

    /// Insert a newly discovered agent. Returns `true` when the id was not
    /// yet known; a re-discovery refreshes the record but keeps console
    /// history and the hidden flag.
    pub fn discovered(&self, agent: Agent) -> bool {
        match self.agents.get_mut(&agent.uuid) {
            Some(mut existing) => {
                existing.kind = agent.kind;
                existing.parent = agent.parent;
                existing.status = agent.status;
                existing.last = agent.last;
                existing.meta = agent.meta;
                false
            }
            None => {
                self.agents.insert(agent.uuid.clone(), agent);
                true
            }
        }
    }

    pub fn get(&self, uuid: &str) -> Option<Agent> {
        self.agents.get(uuid).map(|a| a.clone())
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.agents.contains_key(uuid)
    }

    pub fn uuids(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.uuid.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn set_status(&self, uuid: &str, status: &str) -> bool {
        match self.agents.get_mut(uuid) {
            Some(mut agent) => {
                agent.status = status.to_string();
                true
            }
            None => false,
        }
    }

    /// Update the last-contact timestamp from a heartbeat.
    pub fn touch(&self, uuid: &str, last: &str) -> bool {
        match self.agents.get_mut(uuid) {
            Some(mut agent) => {
                agent.last = last.to_string();
                true
            }
            None => false,
        }
    }

    /// Publish heartbeat display text computed from the last-contact time.
    pub fn set_last_text(&self, uuid: &str, text: &str) {
        if let Some(mut agent) = self.agents.get_mut(uuid) {
            agent.last_text = text.to_string();
        }
    }

    pub fn append_console(&self, uuid: &str, entry: Value) -> bool {
        match self.agents.get_mut(uuid) {
            Some(mut agent) => {
                agent.console.push(entry);
                true
            }
            None => false,
        }
    }

    pub fn console(&self, uuid: &str) -> Vec<Value> {
        self.agents
            .get(uuid)
            .map(|a| a.console.clone())
            .unwrap_or_default()
    }

    /// Hide an agent from operator views while preserving its record.
    pub fn hide(&self, uuid: &str) -> bool {
        match self.agents.get_mut(uuid) {
            Some(mut agent) => {
                agent.hidden = true;
                true
            }
            None => false,
        }
    }

    /// Explicit operator removal; the record and its history are discarded.
    pub fn remove(&self, uuid: &str) -> bool {
        self.agents.remove(uuid).is_some()
    }

    /// Snapshot of all non-hidden agents.
    pub fn visible(&self) -> Vec<Agent> {
        self.agents
            .iter()
            .filter(|a| !a.hidden)
            .map(|a| a.clone())
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Send a command to the server-side handler of an agent.
///
/// Keep-alive transport: with `wait` the server holds the connection open
/// until the command completed on the target, otherwise it acknowledges
/// queuing immediately. An empty 200 body is an empty result object.
pub async fn execute(
    transport: &Transport,
    uuid: &str,
    data: Value,
    wait: bool,
) -> Result<Value> {
    let request = serde_json::json!({
        "uuid": uuid,
        "wait": wait,
        "data": data,
    });

    let (status, bytes) = transport.send("/api/agent/execute", &request, true).await?;

    if status != 200 {
        log::debug!("failed to send request: status code {}", status);
        return Err(Error::from_error_body(&bytes, "failed to send request"));
    }

    if bytes.is_empty() {
        return Ok(Value::Object(Default::default()));
    }

    serde_json::from_slice(&bytes).map_err(|e| Error::Protocol(format!("execute response: {}", e)))
}
