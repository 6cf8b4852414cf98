use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Error, Result};

/// Local mirror of server-side listeners.
///
/// Listener objects are kept as the opaque JSON the server reported; the
/// `name` field is the unique key and uniqueness is enforced on every add.
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Value>>,
}

fn listener_name(listener: &Value) -> Option<&str> {
    listener.get("name").and_then(Value::as_str)
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Mirror a listener reported by the server. Returns its name.
    pub fn add(&self, listener: Value) -> Result<String> {
        let name = listener_name(&listener)
            .ok_or_else(|| Error::Protocol("listener object has no name".to_string()))?
            .to_string();

        let mut listeners = self.listeners.lock().unwrap();

        if listeners.iter().any(|l| listener_name(l) == Some(&name)) {
            return Err(Error::DuplicateRegistration {
                kind: "listener",
                name,
            });
        }

        listeners.push(listener);
        Ok(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();

        listeners.retain(|l| listener_name(l) != Some(name));
        listeners.len() < before
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .find(|l| listener_name(l) == Some(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| listener_name(l).map(String::from))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_remove_net_effect() {
        let registry = ListenerRegistry::new();

        registry.add(json!({ "name": "http-main", "protocol": "http" })).unwrap();
        registry.add(json!({ "name": "smb-pivot", "protocol": "smb" })).unwrap();
        assert_eq!(registry.names(), vec!["http-main", "smb-pivot"]);

        assert!(registry.remove("http-main"));
        assert_eq!(registry.names(), vec!["smb-pivot"]);

        registry.add(json!({ "name": "http-main", "protocol": "http" })).unwrap();
        assert_eq!(registry.len(), 2);

        assert!(!registry.remove("never-existed"));
    }

    #[test]
    fn test_names_stay_unique() {
        let registry = ListenerRegistry::new();

        registry.add(json!({ "name": "http-main" })).unwrap();
        let err = registry.add(json!({ "name": "http-main" })).unwrap_err();

        assert!(matches!(err, Error::DuplicateRegistration { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unnamed_listener_rejected() {
        let registry = ListenerRegistry::new();
        assert!(registry.add(json!({ "protocol": "http" })).is_err());
    }
}
