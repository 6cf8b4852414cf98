pub mod agent;
pub mod client;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod listener;
pub mod meta;
pub mod payload;
pub mod plugin;
pub mod profile;
pub mod registry;
pub mod session;
pub mod transport;

pub use agent::{Agent, AgentRegistry};
pub use client::Client;
pub use error::{Error, Result};
pub use events::{ClientEvent, Event, EventDispatcher};
pub use listener::ListenerRegistry;
pub use plugin::{CoreApi, InstallPrompt, Plugin, PluginInfo, ScriptHost};
pub use registry::{ActionScope, CapabilityKind, ExtensionRegistry, Handler, MenuAction};
pub use session::{ConnectInfo, FingerprintPrompt, Session};
pub use transport::Transport;
