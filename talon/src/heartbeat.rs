use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::agent::AgentRegistry;
use crate::events::ClientEvent;

/// How often the liveness text of every agent is recomputed.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);

/// Periodic worker recomputing the human-readable last-contact text of
/// every known agent. Pure per tick: reads last-contact, writes display
/// text, nothing else. Agents with unparseable timestamps report "unknown".
pub struct HeartbeatWorker {
    agents: Arc<AgentRegistry>,
    notify: mpsc::UnboundedSender<ClientEvent>,
    period: Duration,
}

impl HeartbeatWorker {
    pub fn new(agents: Arc<AgentRegistry>, notify: mpsc::UnboundedSender<ClientEvent>) -> Self {
        HeartbeatWorker {
            agents,
            notify,
            period: HEARTBEAT_PERIOD,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.period);

        loop {
            interval.tick().await;
            self.tick(Utc::now());
            let _ = self.notify.send(ClientEvent::HeartbeatTick);
        }
    }

    fn tick(&self, now: DateTime<Utc>) {
        for uuid in self.agents.uuids() {
            let Some(agent) = self.agents.get(&uuid) else {
                continue;
            };

            let text = match DateTime::parse_from_rfc3339(&agent.last) {
                Ok(last) => {
                    let elapsed = (now - last.with_timezone(&Utc)).num_seconds();
                    format_elapsed(elapsed)
                }
                Err(_) => "unknown".to_string(),
            };

            self.agents.set_last_text(&uuid, &text);
        }
    }
}

/// Format an elapsed duration as its two coarsest units.
pub fn format_elapsed(secs: i64) -> String {
    let secs = secs.max(0);

    let days = secs / (24 * 3600);
    let hours = (secs % (24 * 3600)) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if secs < 60 {
        format!("{}s", seconds)
    } else if secs < 60 * 60 {
        format!("{}m {}s", minutes, seconds)
    } else if secs < 24 * 60 * 60 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}d {}h", days, hours)
    }
}
