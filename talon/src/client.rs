use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::agent::{self, Agent, AgentRegistry};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, EventDispatcher, EventWorker};
use crate::heartbeat::HeartbeatWorker;
use crate::listener::ListenerRegistry;
use crate::meta::MetaWorker;
use crate::payload::{self, BuiltPayload};
use crate::plugin::{CoreApi, InstallPrompt, Plugin, PluginManager, ScriptHost};
use crate::profile::{ProfileStore, SECTION_CONNECTION, SECTION_SCRIPT};
use crate::registry::{
    AgentInterface, CallbackFn, ExtensionRegistry, Handler, MenuAction, PayloadBuilder,
    ProtocolView,
};
use crate::session::{self, ConnectInfo, FingerprintPrompt, Session};
use crate::transport::Transport;

/// The operator client.
///
/// Owns the authenticated transport, the shared registries and the
/// background workers. Construction is the whole connection sequence: login
/// (with operator fingerprint confirmation on first contact), profile store
/// setup and built-in event subscriptions. Workers start separately so
/// extensions can register their handlers first.
pub struct Client {
    transport: Arc<Transport>,
    session: Session,
    registry: Arc<ExtensionRegistry>,
    agents: Arc<AgentRegistry>,
    listeners: Arc<ListenerRegistry>,
    dispatcher: Arc<EventDispatcher>,
    plugins: PluginManager,
    profiles: ProfileStore,
    notify: mpsc::UnboundedSender<ClientEvent>,
}

impl Client {
    /// Connect and log into a team server, using the default data directory
    /// (`~/.talon/client`).
    pub async fn connect(
        info: ConnectInfo,
        prompt: &dyn FingerprintPrompt,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let transport = Arc::new(Transport::new(&info.host, info.port)?);
        Self::connect_on(transport, info, default_data_dir()?, prompt).await
    }

    /// Connect over an explicit transport and data directory.
    pub async fn connect_on(
        transport: Arc<Transport>,
        info: ConnectInfo,
        data_dir: PathBuf,
        prompt: &dyn FingerprintPrompt,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        std::fs::create_dir_all(&data_dir)?;

        let profiles = ProfileStore::open(data_dir.join("client.toml"))?;
        let known = known_fingerprint(&profiles, &info.host, info.port);

        let session = session::login(&transport, &info, known.as_deref(), prompt).await?;

        remember_connection(&profiles, &session)?;

        let (notify, events) = mpsc::unbounded_channel();

        let client = Client {
            transport,
            session,
            registry: Arc::new(ExtensionRegistry::new()),
            agents: Arc::new(AgentRegistry::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            dispatcher: Arc::new(EventDispatcher::new()),
            plugins: PluginManager::new(data_dir.join("plugins")),
            profiles,
            notify,
        };

        client.install_subscribers();

        Ok((client, events))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    /// Load a natively-compiled extension; its `init` runs exactly once,
    /// synchronously, against the capability surface.
    pub fn load_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.plugins.load_native(plugin, self)
    }

    /// Load a script extension through the pluggable script host.
    pub async fn load_script(&self, path: &Path, host: &dyn ScriptHost) -> Result<()> {
        host.load(path, self).await.map_err(|e| Error::Extension {
            name: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Pull server-advertised plugins into the local cache, then autoload
    /// every script registered in the profile store. Failures are reported
    /// as notices and do not abort the remaining scripts.
    pub async fn pull_plugins(
        &self,
        confirm: &dyn InstallPrompt,
        host: &dyn ScriptHost,
    ) -> Result<usize> {
        let fetched = self.plugins.sync(&self.transport, confirm).await?;

        for entry in self.profiles.query(SECTION_SCRIPT) {
            let Some(path) = entry.get("path").and_then(|p| p.as_str()) else {
                log::warn!("script entry without path in profile store");
                continue;
            };

            if let Err(e) = self.load_script(Path::new(path), host).await {
                log::error!("failed to load script {}: {}", path, e);
                let _ = self.notify.send(ClientEvent::Notice {
                    title: "script loading failure".to_string(),
                    body: e.to_string(),
                });
            }
        }

        Ok(fetched)
    }

    /// Start the background workers. Heartbeat runs immediately; the event
    /// stream worker starts only after the bootstrap worker completed.
    pub fn start_workers(&self) {
        let heartbeat = HeartbeatWorker::new(self.agents.clone(), self.notify.clone());
        tokio::spawn(heartbeat.run());

        let meta = MetaWorker::new(
            self.transport.clone(),
            self.agents.clone(),
            self.listeners.clone(),
            self.registry.clone(),
            self.notify.clone(),
        );
        let events = EventWorker::new(
            self.transport.clone(),
            self.dispatcher.clone(),
            self.notify.clone(),
        );

        tokio::spawn(async move {
            meta.run().await;
            events.run().await;
        });
    }

    /// Send a command to an agent's server-side handler.
    pub async fn agent_execute(&self, uuid: &str, data: Value, wait: bool) -> Result<Value> {
        agent::execute(&self.transport, uuid, data, wait).await
    }

    /// Run an operator console line through the agent's registered
    /// interface and execute the resulting command payload.
    pub async fn console_input(&self, uuid: &str, line: &str) -> Result<Value> {
        let agent = self
            .agents
            .get(uuid)
            .ok_or_else(|| Error::Protocol(format!("unknown agent: {}", uuid)))?;

        let interface = self.registry.agent_interface(&agent.kind).ok_or_else(|| {
            Error::Extension {
                name: agent.kind.clone(),
                message: "no agent interface registered".to_string(),
            }
        })?;

        let payload = interface
            .console_input(&agent, line)
            .map_err(|e| Error::Extension {
                name: agent.kind.clone(),
                message: e.to_string(),
            })?;

        self.agent_execute(uuid, payload, true).await
    }

    /// Build a payload through the named registered builder.
    pub async fn build_payload(&self, name: &str) -> Result<BuiltPayload> {
        let builder = self.registry.builder(name).ok_or_else(|| Error::Extension {
            name: name.to_string(),
            message: "payload builder is not registered".to_string(),
        })?;

        let config = builder.generate().map_err(|e| Error::Extension {
            name: name.to_string(),
            message: e.to_string(),
        })?;

        let built = payload::build(&self.transport, name, &config).await?;

        builder.build_log(&format!(
            "built {} ({} bytes)",
            built.filename,
            built.payload.len()
        ));

        Ok(built)
    }

    /// Built-in event subscriptions wiring server events into the local
    /// registries and the operator notification channel.
    fn install_subscribers(&self) {
        let listeners = self.listeners.clone();
        let registry = self.registry.clone();
        let notify = self.notify.clone();
        self.dispatcher.subscribe("listener.add", "listeners", move |event| {
            listeners.add(event.data.clone())?;

            if let Some(protocol) = event.data.get("protocol").and_then(Value::as_str) {
                if let Some(view) = registry.protocol(protocol) {
                    if let Err(e) = view.validate(&event.data) {
                        log::warn!("listener failed '{}' protocol validation: {}", protocol, e);
                    }
                }
            }

            let _ = notify.send(ClientEvent::ListenerAdded(event.data.clone()));
            Ok(())
        });

        let listeners = self.listeners.clone();
        let notify = self.notify.clone();
        self.dispatcher.subscribe("listener.remove", "listeners", move |event| {
            let name = string_field(&event.data, "name")?;
            listeners.remove(&name);
            let _ = notify.send(ClientEvent::ListenerRemoved(name));
            Ok(())
        });

        let agents = self.agents.clone();
        let registry = self.registry.clone();
        let notify = self.notify.clone();
        self.dispatcher.subscribe("agent.new", "agents", move |event| {
            let agent = Agent::from_value(&event.data)?;
            let uuid = agent.uuid.clone();
            let kind = agent.kind.clone();

            if agents.discovered(agent) {
                let _ = notify.send(ClientEvent::AgentDiscovered(uuid.clone()));
            }

            if let Some(interface) = registry.agent_interface(&kind) {
                if let Some(agent) = agents.get(&uuid) {
                    interface.attach(&agent).map_err(|e| Error::Extension {
                        name: kind,
                        message: e.to_string(),
                    })?;
                }
            }

            Ok(())
        });

        let agents = self.agents.clone();
        let notify = self.notify.clone();
        self.dispatcher.subscribe("agent.status", "agents", move |event| {
            let uuid = string_field(&event.data, "uuid")?;
            let status = string_field(&event.data, "status")?;

            agents.set_status(&uuid, &status);
            let _ = notify.send(ClientEvent::AgentStatus { uuid, status });
            Ok(())
        });

        let agents = self.agents.clone();
        self.dispatcher.subscribe("agent.heartbeat", "agents", move |event| {
            let uuid = string_field(&event.data, "uuid")?;
            let last = string_field(&event.data, "last")?;

            agents.touch(&uuid, &last);
            Ok(())
        });

        let agents = self.agents.clone();
        let registry = self.registry.clone();
        let notify = self.notify.clone();
        self.dispatcher.subscribe("agent.console", "console", move |event| {
            let uuid = string_field(&event.data, "uuid")?;

            agents.append_console(&uuid, event.data.clone());

            if let Some(agent) = agents.get(&uuid) {
                if let Some(interface) = registry.agent_interface(&agent.kind) {
                    interface
                        .console_output(&agent, &event.data)
                        .map_err(|e| Error::Extension {
                            name: agent.kind.clone(),
                            message: e.to_string(),
                        })?;
                }
            }

            let _ = notify.send(ClientEvent::AgentConsole {
                uuid,
                entry: event.data.clone(),
            });
            Ok(())
        });

        let registry = self.registry.clone();
        self.dispatcher.subscribe("agent.callback", "callbacks", move |event| {
            let uuid = string_field(&event.data, "uuid")?;

            let Some(callback) = registry.callback(&uuid) else {
                log::debug!("no callback registered for '{}'", uuid);
                return Ok(());
            };

            let result = callback(event.data.get("data").unwrap_or(&Value::Null));
            registry.remove_callback(&uuid);
            result
        });
    }
}

#[async_trait]
impl CoreApi for Client {
    fn register_agent_interface(&self, name: &str, handler: Arc<dyn AgentInterface>) -> Result<()> {
        self.registry.register(name, Handler::AgentInterface(handler))
    }

    fn register_protocol(&self, name: &str, handler: Arc<dyn ProtocolView>) -> Result<()> {
        self.registry.register(name, Handler::Protocol(handler))
    }

    fn register_builder(&self, name: &str, handler: Arc<dyn PayloadBuilder>) -> Result<()> {
        self.registry.register(name, Handler::Builder(handler))
    }

    fn register_callback(&self, uuid: &str, callback: Arc<CallbackFn>) -> Result<()> {
        self.registry.register(uuid, Handler::Callback(callback))
    }

    fn unregister_callback(&self, uuid: &str) -> bool {
        self.registry.remove_callback(uuid)
    }

    fn register_action(&self, action: MenuAction) -> Result<()> {
        self.registry.add_action(action)
    }

    fn console_write(&self, uuid: &str, text: &str) {
        let entry = json!({ "uuid": uuid, "data": text });

        self.agents.append_console(uuid, entry.clone());
        let _ = self.notify.send(ClientEvent::AgentConsole {
            uuid: uuid.to_string(),
            entry,
        });
    }

    async fn server_send(&self, endpoint: &str, body: Value) -> Result<(u16, Vec<u8>)> {
        self.transport.send(endpoint, &body, false).await
    }

    async fn agent_execute(&self, uuid: &str, data: Value, wait: bool) -> Result<Value> {
        Client::agent_execute(self, uuid, data, wait).await
    }
}

fn string_field(data: &Value, field: &str) -> Result<String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Protocol(format!("event data has no '{}' field", field)))
}

fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "home directory not found")
    })?;

    Ok(home.join(".talon").join("client"))
}

fn known_fingerprint(profiles: &ProfileStore, host: &str, port: u16) -> Option<String> {
    profiles
        .query(SECTION_CONNECTION)
        .into_iter()
        .find(|entry| {
            entry.get("host").and_then(|v| v.as_str()) == Some(host)
                && entry.get("port").and_then(|v| v.as_integer()) == Some(port as i64)
        })
        .and_then(|entry| {
            entry
                .get("fingerprint")
                .and_then(|v| v.as_str())
                .map(String::from)
        })
}

/// Persist the connection (and its confirmed fingerprint) for the next
/// login against the same server.
fn remember_connection(profiles: &ProfileStore, session: &Session) -> Result<()> {
    let existing = profiles
        .query(SECTION_CONNECTION)
        .iter()
        .position(|entry| {
            entry.get("host").and_then(|v| v.as_str()) == Some(session.host.as_str())
                && entry.get("port").and_then(|v| v.as_integer()) == Some(session.port as i64)
        });

    if let Some(index) = existing {
        profiles.delete(SECTION_CONNECTION, index)?;
    }

    let mut entry = toml::value::Table::new();
    entry.insert("name".into(), toml::Value::String(session.name.clone()));
    entry.insert("host".into(), toml::Value::String(session.host.clone()));
    entry.insert("port".into(), toml::Value::Integer(session.port as i64));
    entry.insert(
        "username".into(),
        toml::Value::String(session.username.clone()),
    );
    if let Some(fp) = &session.fingerprint {
        entry.insert("fingerprint".into(), toml::Value::String(fp.clone()));
    }

    profiles.insert(SECTION_CONNECTION, entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use actix_web::{web, App, HttpResponse, HttpServer};
    use std::time::{Duration, Instant};

    fn info() -> ConnectInfo {
        ConnectInfo {
            name: "local".to_string(),
            host: "127.0.0.1".to_string(),
            port: 40056,
            username: "operator".to_string(),
            password: "hunter2".to_string(),
        }
    }

    async fn spawn_team_server() -> String {
        let server = HttpServer::new(|| {
            App::new()
                .route(
                    "/api/login",
                    web::post().to(|| async {
                        HttpResponse::Ok().json(json!({ "token": "tok-1234" }))
                    }),
                )
                .route(
                    "/api/agent/execute",
                    web::post().to(|body: web::Json<Value>| async move {
                        let body = body.into_inner();

                        if body["wait"] == json!(true) {
                            tokio::time::sleep(Duration::from_millis(1500)).await;
                            HttpResponse::Ok().json(json!({
                                "output": format!("ran {}", body["data"]["command"].as_str().unwrap_or("?")),
                            }))
                        } else {
                            HttpResponse::Ok().json(json!({ "queued": true }))
                        }
                    }),
                )
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());

        format!("http://{}", addr)
    }

    async fn connect(base: String) -> (Client, mpsc::UnboundedReceiver<ClientEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(Transport::with_base(base).unwrap());

        let (client, events) =
            Client::connect_on(transport, info(), dir.path().to_path_buf(), &|_: &str| true)
                .await
                .unwrap();

        (client, events, dir)
    }

    #[actix_web::test]
    async fn test_connect_persists_connection_profile() {
        let base = spawn_team_server().await;
        let (client, _events, _dir) = connect(base).await;

        assert_eq!(client.session().token, "tok-1234");

        let connections = client.profiles().query(SECTION_CONNECTION);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0]["host"].as_str(), Some("127.0.0.1"));
    }

    #[actix_web::test]
    async fn test_builtin_subscribers_mirror_events() {
        let base = spawn_team_server().await;
        let (client, mut events, _dir) = connect(base).await;

        client.dispatcher().dispatch(&Event {
            tag: "listener.add".to_string(),
            data: json!({ "name": "http-main", "protocol": "http" }),
        });
        client.dispatcher().dispatch(&Event {
            tag: "agent.new".to_string(),
            data: json!({ "uuid": "agent-1", "type": "raven", "last": "2026-08-05T10:00:00Z" }),
        });
        client.dispatcher().dispatch(&Event {
            tag: "agent.console".to_string(),
            data: json!({ "uuid": "agent-1", "data": "whoami" }),
        });

        assert_eq!(client.listeners().names(), vec!["http-main"]);
        assert!(client.agents().contains("agent-1"));
        assert_eq!(client.agents().console("agent-1").len(), 1);

        let mut discovered = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, ClientEvent::AgentDiscovered(uuid) if uuid == "agent-1") {
                discovered = true;
            }
        }
        assert!(discovered);
    }

    #[actix_web::test]
    async fn test_execute_wait_returns_eventual_result() {
        let base = spawn_team_server().await;
        let (client, _events, _dir) = connect(base).await;

        let started = Instant::now();
        let result = client
            .agent_execute("agent-1", json!({ "command": "whoami" }), true)
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(result["output"].as_str(), Some("ran whoami"));
    }

    #[actix_web::test]
    async fn test_execute_no_wait_acknowledges_immediately() {
        let base = spawn_team_server().await;
        let (client, _events, _dir) = connect(base).await;

        let started = Instant::now();
        let result = client
            .agent_execute("agent-1", json!({ "command": "whoami" }), false)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(result["queued"], json!(true));
    }

    struct DemoInterface;

    impl AgentInterface for DemoInterface {
        fn console_output(&self, _agent: &Agent, _entry: &Value) -> crate::Result<()> {
            Ok(())
        }

        fn console_input(&self, _agent: &Agent, line: &str) -> crate::Result<Value> {
            Ok(json!({ "command": line }))
        }
    }

    struct DemoPlugin;

    impl Plugin for DemoPlugin {
        fn name(&self) -> &str {
            "demo"
        }

        fn init(&self, api: &dyn CoreApi) -> crate::Result<()> {
            api.register_agent_interface("raven", Arc::new(DemoInterface))?;
            api.register_action(MenuAction {
                name: "screenshot".to_string(),
                icon: None,
                scope: crate::registry::ActionScope::AgentType("raven".to_string()),
                callback: Arc::new(|_data: &Value| Ok(())),
            })?;
            Ok(())
        }
    }

    #[actix_web::test]
    async fn test_native_plugin_registers_through_core_api() {
        let base = spawn_team_server().await;
        let (client, _events, _dir) = connect(base).await;

        client.load_plugin(Arc::new(DemoPlugin)).unwrap();

        assert_eq!(client.plugins().loaded(), vec!["demo"]);
        assert!(client.registry().agent_interface("raven").is_some());
        assert_eq!(
            client
                .registry()
                .actions_for(&crate::registry::ActionScope::AgentType("raven".to_string()))
                .len(),
            1
        );

        // the registered interface now drives console input for its type
        client.dispatcher().dispatch(&Event {
            tag: "agent.new".to_string(),
            data: json!({ "uuid": "agent-1", "type": "raven", "last": "2026-08-05T10:00:00Z" }),
        });

        let result = client.console_input("agent-1", "whoami").await;
        // server answers the executed payload
        assert_eq!(result.unwrap()["output"].as_str(), Some("ran whoami"));
    }

    #[actix_web::test]
    async fn test_callback_fires_once_and_unregisters() {
        let base = spawn_team_server().await;
        let (client, _events, _dir) = connect(base).await;

        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();

        client
            .register_callback(
                "cb-1",
                Arc::new(move |_data: &Value| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();

        let event = Event {
            tag: "agent.callback".to_string(),
            data: json!({ "uuid": "cb-1", "data": { "done": true } }),
        };

        client.dispatcher().dispatch(&event);
        client.dispatcher().dispatch(&event);

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(client.registry().callback("cb-1").is_none());
    }
}
