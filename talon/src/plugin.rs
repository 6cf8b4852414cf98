use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::registry::{AgentInterface, CallbackFn, MenuAction, PayloadBuilder, ProtocolView};
use crate::transport::Transport;

/// The capability surface handed to every extension.
///
/// Script-based and natively-compiled extensions both register through this
/// trait; after registration the core cannot tell them apart. Everything an
/// extension may do at runtime is either one of these calls or a handler
/// invocation mediated by the extension registry.
#[async_trait]
pub trait CoreApi: Send + Sync {
    fn register_agent_interface(&self, name: &str, handler: Arc<dyn AgentInterface>) -> Result<()>;

    fn register_protocol(&self, name: &str, handler: Arc<dyn ProtocolView>) -> Result<()>;

    fn register_builder(&self, name: &str, handler: Arc<dyn PayloadBuilder>) -> Result<()>;

    fn register_callback(&self, uuid: &str, callback: Arc<CallbackFn>) -> Result<()>;

    fn unregister_callback(&self, uuid: &str) -> bool;

    fn register_action(&self, action: MenuAction) -> Result<()>;

    /// Write a line into an agent's console.
    fn console_write(&self, uuid: &str, text: &str);

    /// Pass-through call to the team server.
    async fn server_send(&self, endpoint: &str, body: Value) -> Result<(u16, Vec<u8>)>;

    /// Send a command to an agent's server-side handler.
    async fn agent_execute(&self, uuid: &str, data: Value, wait: bool) -> Result<Value>;
}

/// A natively-compiled extension. Loaded once at startup; `init` is the
/// only call the host ever makes, all capabilities must be registered
/// synchronously during it.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self, api: &dyn CoreApi) -> Result<()>;
}

/// Pluggable script engine. The engine itself is an external collaborator;
/// the host only hands it a script path and the capability surface.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    async fn load(&self, path: &Path, api: &dyn CoreApi) -> Result<()>;
}

/// Operator confirmation before installing a plugin from the server.
pub trait InstallPrompt: Send + Sync {
    fn confirm_install(&self, plugin: &PluginInfo) -> bool;
}

impl<F> InstallPrompt for F
where
    F: Fn(&PluginInfo) -> bool + Send + Sync,
{
    fn confirm_install(&self, plugin: &PluginInfo) -> bool {
        self(plugin)
    }
}

/// A plugin advertised by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl PluginInfo {
    /// Cache directory name, `name@version`.
    pub fn cache_key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Loads native plugins and synchronizes server-advertised plugin resources
/// into the local cache directory.
pub struct PluginManager {
    cache_dir: PathBuf,
    loaded: Mutex<Vec<String>>,
}

impl PluginManager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        PluginManager {
            cache_dir: cache_dir.into(),
            loaded: Mutex::new(Vec::new()),
        }
    }

    pub fn cache_dir(&self) -> &PathBuf {
        &self.cache_dir
    }

    /// Names of natively loaded plugins, in load order.
    pub fn loaded(&self) -> Vec<String> {
        self.loaded.lock().unwrap().clone()
    }

    /// Initialize a native plugin exactly once. A raising plugin is an
    /// isolated extension fault, it never takes the host down.
    pub fn load_native(&self, plugin: Arc<dyn Plugin>, api: &dyn CoreApi) -> Result<()> {
        let name = plugin.name().to_string();

        plugin.init(api).map_err(|e| Error::Extension {
            name: name.clone(),
            message: e.to_string(),
        })?;

        log::debug!("loaded plugin '{}'", name);
        self.loaded.lock().unwrap().push(name);

        Ok(())
    }

    /// Pull the server plugin list and download resources for plugins not
    /// yet cached. Returns the number of plugins fetched.
    ///
    /// A plugin already present under `name@version` is skipped without
    /// asking; a declined confirmation skips the plugin entirely.
    pub async fn sync(&self, transport: &Transport, confirm: &dyn InstallPrompt) -> Result<usize> {
        let (status, value) = transport.send_json("/api/plugin/list", &json!({})).await?;

        if status != 200 {
            return Err(Error::UnexpectedStatus(status));
        }

        let Value::Array(items) = value else {
            return Err(Error::Protocol("plugin list is not an array".to_string()));
        };

        let mut fetched = 0;

        for item in items {
            let plugin: PluginInfo = match serde_json::from_value(item) {
                Ok(plugin) => plugin,
                Err(e) => {
                    log::warn!("skipping plugin entry: {}", e);
                    continue;
                }
            };

            let dir = self.cache_dir.join(plugin.cache_key());
            if dir.exists() {
                log::debug!("plugin {} already cached", plugin.cache_key());
                continue;
            }

            if !confirm.confirm_install(&plugin) {
                log::info!("plugin {} declined by operator", plugin.cache_key());
                continue;
            }

            log::info!("pulling plugin {} ({})", plugin.name, plugin.version);

            if self.pull_resources(transport, &plugin, &dir).await {
                fetched += 1;
            }
        }

        Ok(fetched)
    }

    async fn pull_resources(
        &self,
        transport: &Transport,
        plugin: &PluginInfo,
        dir: &Path,
    ) -> bool {
        for resource in &plugin.resources {
            let Some(relative) = sanitize_resource(resource) else {
                log::warn!(
                    "plugin {} resource '{}' escapes the plugin directory, skipping plugin",
                    plugin.name,
                    resource
                );
                return false;
            };

            if let Err(e) = self
                .pull_resource(transport, plugin, &dir.join(relative), resource)
                .await
            {
                log::debug!(
                    "failed to pull resource '{}' for plugin {}: {}",
                    resource,
                    plugin.name,
                    e
                );
                return false;
            }
        }

        true
    }

    async fn pull_resource(
        &self,
        transport: &Transport,
        plugin: &PluginInfo,
        target: &Path,
        resource: &str,
    ) -> Result<()> {
        if target.exists() {
            log::debug!("resource already exists: {}", target.display());
            return Ok(());
        }

        let (status, bytes) = transport
            .send(
                "/api/plugin/resource",
                &json!({ "name": plugin.name, "resource": resource }),
                false,
            )
            .await?;

        if status != 200 {
            return Err(Error::UnexpectedStatus(status));
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(target, bytes)?;
        Ok(())
    }
}

/// Constrain a server-supplied resource path to the plugin directory.
fn sanitize_resource(resource: &str) -> Option<PathBuf> {
    let path = Path::new(resource);

    if path.components().all(|c| matches!(c, Component::Normal(_))) && !resource.is_empty() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpResponse, HttpServer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sanitize_resource() {
        assert!(sanitize_resource("talon.py").is_some());
        assert!(sanitize_resource("scripts/agent/init.py").is_some());
        assert!(sanitize_resource("../escape.py").is_none());
        assert!(sanitize_resource("/etc/passwd").is_none());
        assert!(sanitize_resource("").is_none());
    }

    async fn spawn_plugin_server() -> String {
        let server = HttpServer::new(|| {
            App::new()
                .route(
                    "/api/plugin/list",
                    web::post().to(|| async {
                        HttpResponse::Ok().json(json!([
                            {
                                "name": "raven-kit",
                                "version": "1.2.0",
                                "resources": ["raven.py", "assets/icon.png"],
                            },
                            { "version": "no name" },
                        ]))
                    }),
                )
                .route(
                    "/api/plugin/resource",
                    web::post().to(|body: web::Json<Value>| async move {
                        let resource = body["resource"].as_str().unwrap_or_default().to_string();
                        HttpResponse::Ok().body(format!("content of {}", resource))
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

    #[actix_web::test]
    async fn test_sync_fetches_uncached_plugins() {
        let base = spawn_plugin_server().await;
        let transport = Transport::with_base(base).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = PluginManager::new(dir.path());

        let fetched = manager
            .sync(&transport, &|_: &PluginInfo| true)
            .await
            .unwrap();

        assert_eq!(fetched, 1);
        let resource = dir.path().join("raven-kit@1.2.0").join("raven.py");
        assert_eq!(
            std::fs::read_to_string(resource).unwrap(),
            "content of raven.py"
        );
        assert!(dir
            .path()
            .join("raven-kit@1.2.0")
            .join("assets/icon.png")
            .exists());
    }

    #[actix_web::test]
    async fn test_sync_skips_cached_and_declined() {
        let base = spawn_plugin_server().await;
        let transport = Transport::with_base(base).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let manager = PluginManager::new(dir.path());

        let prompts = Arc::new(AtomicUsize::new(0));

        // declined: nothing fetched
        let counter = prompts.clone();
        let fetched = manager
            .sync(&transport, &move |_: &PluginInfo| {
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
            .await
            .unwrap();
        assert_eq!(fetched, 0);
        assert_eq!(prompts.load(Ordering::SeqCst), 1);

        // cached: not even prompted
        std::fs::create_dir_all(dir.path().join("raven-kit@1.2.0")).unwrap();
        let counter = prompts.clone();
        let fetched = manager
            .sync(&transport, &move |_: &PluginInfo| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .await
            .unwrap();
        assert_eq!(fetched, 0);
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }
}
