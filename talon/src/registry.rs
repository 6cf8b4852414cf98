use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::agent::Agent;
use crate::error::{Error, Result};

/// Handler invoked when an agent of the registered type produces console
/// output or the operator types into its console. Implementations live in
/// extensions; the core only dispatches through this trait.
pub trait AgentInterface: Send + Sync {
    /// Called once when an agent of this type is discovered.
    fn attach(&self, agent: &Agent) -> Result<()> {
        let _ = agent;
        Ok(())
    }

    /// A console entry for an agent of this type arrived.
    fn console_output(&self, agent: &Agent, entry: &Value) -> Result<()>;

    /// Translate an operator console line into a command payload.
    fn console_input(&self, agent: &Agent, line: &str) -> Result<Value>;
}

/// Listener protocol capability contributed by an extension; validates the
/// configuration of listeners speaking its protocol.
pub trait ProtocolView: Send + Sync {
    fn validate(&self, config: &Value) -> Result<()>;
}

/// Payload builder capability registered by an extension.
pub trait PayloadBuilder: Send + Sync {
    /// Produce the build configuration sent to the server.
    fn generate(&self) -> Result<Value>;

    /// Load a stored profile into the builder.
    fn profile_load(&self, profile: &Value) -> Result<()>;

    /// Build log line pushed back from the server build.
    fn build_log(&self, line: &str) {
        let _ = line;
    }
}

/// Transient callback, registered by id for async request/response
/// correlation and removed after it fired.
pub type CallbackFn = dyn Fn(&Value) -> Result<()> + Send + Sync;

/// Opaque capability token stored in the registry. The core never inspects
/// the concrete extension type behind the `Arc`; all invocation goes through
/// the trait objects.
#[derive(Clone)]
pub enum Handler {
    AgentInterface(Arc<dyn AgentInterface>),
    Protocol(Arc<dyn ProtocolView>),
    Builder(Arc<dyn PayloadBuilder>),
    Callback(Arc<CallbackFn>),
}

impl Handler {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Handler::AgentInterface(_) => CapabilityKind::AgentInterface,
            Handler::Protocol(_) => CapabilityKind::Protocol,
            Handler::Builder(_) => CapabilityKind::Builder,
            Handler::Callback(_) => CapabilityKind::Callback,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    AgentInterface,
    Protocol,
    Builder,
    Callback,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::AgentInterface => "agent interface",
            CapabilityKind::Protocol => "protocol",
            CapabilityKind::Builder => "builder",
            CapabilityKind::Callback => "callback",
        }
    }
}

/// Where a registered menu action shows up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionScope {
    /// The application menu
    Global,
    /// The context menu of a single agent type
    AgentType(String),
    /// The context menu of every agent type
    AllAgents,
}

#[derive(Clone)]
pub struct MenuAction {
    pub name: String,
    pub icon: Option<String>,
    pub scope: ActionScope,
    pub callback: Arc<CallbackFn>,
}

/// Process-wide table of extension-provided capabilities.
///
/// Names are unique within a capability kind; the first registration wins
/// and a second `register` for the same `(kind, name)` is rejected. Only
/// callbacks may be unregistered (by id); every other kind is additive for
/// the lifetime of the session.
pub struct ExtensionRegistry {
    handlers: Mutex<HashMap<(CapabilityKind, String), Handler>>,
    actions: Mutex<Vec<MenuAction>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry {
            handlers: Mutex::new(HashMap::new()),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, name: &str, handler: Handler) -> Result<()> {
        let kind = handler.kind();
        let mut handlers = self.handlers.lock().unwrap();
        let key = (kind, name.to_string());

        if handlers.contains_key(&key) {
            return Err(Error::DuplicateRegistration {
                kind: kind.as_str(),
                name: name.to_string(),
            });
        }

        handlers.insert(key, handler);
        log::debug!("registered {} '{}'", kind.as_str(), name);

        Ok(())
    }

    pub fn lookup(&self, kind: CapabilityKind, name: &str) -> Option<Handler> {
        self.handlers
            .lock()
            .unwrap()
            .get(&(kind, name.to_string()))
            .cloned()
    }

    pub fn list(&self, kind: CapabilityKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();

        names.sort();
        names
    }

    pub fn agent_interface(&self, name: &str) -> Option<Arc<dyn AgentInterface>> {
        match self.lookup(CapabilityKind::AgentInterface, name) {
            Some(Handler::AgentInterface(handler)) => Some(handler),
            _ => None,
        }
    }

    pub fn protocol(&self, name: &str) -> Option<Arc<dyn ProtocolView>> {
        match self.lookup(CapabilityKind::Protocol, name) {
            Some(Handler::Protocol(handler)) => Some(handler),
            _ => None,
        }
    }

    pub fn builder(&self, name: &str) -> Option<Arc<dyn PayloadBuilder>> {
        match self.lookup(CapabilityKind::Builder, name) {
            Some(Handler::Builder(handler)) => Some(handler),
            _ => None,
        }
    }

    pub fn callback(&self, uuid: &str) -> Option<Arc<CallbackFn>> {
        match self.lookup(CapabilityKind::Callback, uuid) {
            Some(Handler::Callback(callback)) => Some(callback),
            _ => None,
        }
    }

    /// Register a transient callback under a fresh correlation id and
    /// return it. The id travels with the request; the matching response
    /// event fires the callback once and tears it down.
    pub fn register_callback(&self, callback: Arc<CallbackFn>) -> Result<String> {
        let uuid = uuid::Uuid::new_v4().to_string();
        self.register(&uuid, Handler::Callback(callback))?;
        Ok(uuid)
    }

    /// Tear down a transient callback registration.
    pub fn remove_callback(&self, uuid: &str) -> bool {
        self.handlers
            .lock()
            .unwrap()
            .remove(&(CapabilityKind::Callback, uuid.to_string()))
            .is_some()
    }

    /// Register a menu action; `(scope, name)` pairs must be unique.
    pub fn add_action(&self, action: MenuAction) -> Result<()> {
        let mut actions = self.actions.lock().unwrap();

        if actions
            .iter()
            .any(|a| a.scope == action.scope && a.name == action.name)
        {
            return Err(Error::DuplicateRegistration {
                kind: "action",
                name: action.name,
            });
        }

        actions.push(action);
        Ok(())
    }

    /// Actions for a scope, in registration order.
    pub fn actions_for(&self, scope: &ActionScope) -> Vec<MenuAction> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.scope == *scope)
            .cloned()
            .collect()
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
