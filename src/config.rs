//! Named, typed, dynamically reloadable configuration registry.
//!
//! Every variable is registered once under a lowercase dotted name and can be
//! reassigned at runtime from a YAML document. Change listeners fire with
//! `(old, new)` under the variable's listener lock, so they must stay cheap.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error};

/// Marker for types a [`ConfigVar`] can carry. Blanket-implemented for
/// anything serde can move in and out of YAML.
pub trait ConfigValue:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ConfigValue for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A single named configuration variable.
pub struct ConfigVar<T: ConfigValue> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    next_listener_id: Mutex<u64>,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: String, default: T, description: String) -> Self {
        Self {
            name,
            description,
            value: RwLock::new(default),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Assigns a new value. Listeners observe `(old, new)` and only run when
    /// the value actually changed.
    pub fn set_value(&self, new: T) {
        let old = {
            let mut value = self.value.write();
            if *value == new {
                return;
            }
            std::mem::replace(&mut *value, new.clone())
        };

        let listeners = self.listeners.lock();
        for listener in listeners.values() {
            listener(&old, &new);
        }
    }

    /// Registers a change listener and returns its id for later removal.
    pub fn add_listener<F>(&self, f: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_listener_id.lock();
            *next += 1;
            *next
        };
        self.listeners.lock().insert(id, Arc::new(f));
        id
    }

    pub fn del_listener(&self, id: u64) {
        self.listeners.lock().remove(&id);
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.value()).context("serialize config value")
    }
}

/// Object-safe face of a [`ConfigVar`], what the registry stores.
trait ConfigVarBase: Send + Sync {
    fn name(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn assign_yaml(&self, node: &serde_yaml::Value) -> Result<()>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: ConfigValue> ConfigVarBase for ConfigVar<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn assign_yaml(&self, node: &serde_yaml::Value) -> Result<()> {
        let value: T = serde_yaml::from_value(node.clone())
            .with_context(|| format!("config {}: cannot parse as {}", self.name, self.type_name()))?;
        self.set_value(value);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<dyn ConfigVarBase>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// The process-wide configuration registry.
pub struct Config;

impl Config {
    /// Returns the variable registered under `name`, creating it with
    /// `default` on first lookup. Names are case-insensitive and restricted
    /// to `[a-z0-9._]`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered with a different value type, or
    /// if the name contains invalid characters.
    pub fn lookup<T: ConfigValue>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>> {
        let name = normalize_name(name);

        if let Some(var) = Self::lookup_existing::<T>(&name) {
            return var;
        }

        let mut registry = REGISTRY.write();
        // Raced with another lookup between the read and the write lock.
        if let Some(existing) = registry.get(&name) {
            return downcast::<T>(&name, existing.clone());
        }

        let var = Arc::new(ConfigVar::new(name.clone(), default, description.to_string()));
        registry.insert(name, var.clone() as Arc<dyn ConfigVarBase>);
        var
    }

    /// Returns the variable registered under `name`, or `None` if it was
    /// never looked up.
    pub fn lookup_existing<T: ConfigValue>(name: &str) -> Option<Arc<ConfigVar<T>>> {
        let name = normalize_name(name);
        let registry = REGISTRY.read();
        registry.get(&name).cloned().map(|var| downcast::<T>(&name, var))
    }

    /// Loads a YAML document, flattening nested mappings into dotted keys and
    /// assigning every key that matches a registered variable. Unknown keys
    /// are ignored; values that fail to parse are logged and skipped.
    pub fn load_yaml(src: &str) -> Result<()> {
        let root: serde_yaml::Value = serde_yaml::from_str(src).context("parse YAML config")?;
        visit("", &root);
        Ok(())
    }
}

fn normalize_name(name: &str) -> String {
    let name = name.to_ascii_lowercase();
    assert!(
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_'),
        "invalid config name: {name:?}"
    );
    name
}

fn downcast<T: ConfigValue>(name: &str, var: Arc<dyn ConfigVarBase>) -> Arc<ConfigVar<T>> {
    let type_name = var.type_name();
    match var.as_any().downcast::<ConfigVar<T>>() {
        Ok(var) => var,
        Err(_) => panic!(
            "config {name:?} already registered with type {type_name}, requested {}",
            std::any::type_name::<T>()
        ),
    }
}

fn visit(prefix: &str, node: &serde_yaml::Value) {
    if !prefix.is_empty() {
        let registry = REGISTRY.read();
        if let Some(var) = registry.get(prefix) {
            match var.assign_yaml(node) {
                Ok(()) => debug!(target: "system", key = prefix, "config assigned"),
                Err(e) => error!(target: "system", key = prefix, "config rejected: {e:#}"),
            }
        }
    }

    if let serde_yaml::Value::Mapping(map) = node {
        for (key, child) in map {
            if let serde_yaml::Value::String(key) = key {
                let child_prefix = if prefix.is_empty() {
                    key.to_ascii_lowercase()
                } else {
                    format!("{prefix}.{}", key.to_ascii_lowercase())
                };
                visit(&child_prefix, child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_lookup_returns_default_then_same_instance() {
        let a = Config::lookup::<u32>("test.lookup.port", 8080, "port");
        assert_eq!(a.value(), 8080);

        let b = Config::lookup::<u32>("Test.Lookup.Port", 1, "ignored");
        assert_eq!(b.value(), 8080, "second lookup must not reset the value");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_lookup_with_wrong_type_panics() {
        Config::lookup::<u32>("test.mismatch.key", 1, "");
        Config::lookup::<String>("test.mismatch.key", String::new(), "");
    }

    #[test]
    fn test_listeners_observe_old_and_new() {
        let var = Config::lookup::<u64>("test.listen.value", 10, "");
        let seen = Arc::new(AtomicU64::new(0));

        let seen2 = seen.clone();
        let id = var.add_listener(move |old, new| {
            assert_eq!(*old, 10);
            assert_eq!(*new, 42);
            seen2.fetch_add(1, Ordering::SeqCst);
        });

        var.set_value(42);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Unchanged assignment must not notify.
        var.set_value(42);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        var.del_listener(id);
        var.set_value(10);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_yaml_assigns_nested_keys() {
        let timeout = Config::lookup::<u64>("test.yaml.timeout", 5000, "");
        let name = Config::lookup::<String>("test.yaml.name", "default".into(), "");

        Config::load_yaml(
            r#"
test:
  yaml:
    timeout: 250
    name: reloaded
    unknown: ignored
"#,
        )
        .unwrap();

        assert_eq!(timeout.value(), 250);
        assert_eq!(name.value(), "reloaded");
    }

    #[test]
    fn test_load_yaml_skips_bad_values() {
        let port = Config::lookup::<u16>("test.yaml.badport", 80, "");
        Config::load_yaml("test:\n  yaml:\n    badport: not-a-number\n").unwrap();
        assert_eq!(port.value(), 80);
    }

    #[derive(Clone, PartialEq, Serialize, Deserialize)]
    struct Endpoint {
        host: String,
        port: u16,
    }

    #[test]
    fn test_structured_value_roundtrip() {
        let var = Config::lookup::<Endpoint>(
            "test.yaml.endpoint",
            Endpoint {
                host: "localhost".into(),
                port: 9000,
            },
            "",
        );

        Config::load_yaml("test:\n  yaml:\n    endpoint: { host: example.com, port: 443 }\n")
            .unwrap();

        let v = var.value();
        assert_eq!(v.host, "example.com");
        assert_eq!(v.port, 443);
        assert!(var.to_yaml().unwrap().contains("example.com"));
    }
}
