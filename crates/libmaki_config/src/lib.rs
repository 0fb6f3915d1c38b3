//! Persistent, grouped key/value configuration.
//!
//! Configuration is organised as `<group>.<key> -> scalar | list`. A server
//! config file has a `server` group for connection parameters; every other
//! group describes a channel (`autojoin`, `key`). The instance config uses
//! groups like `logging`, `reconnect`, `dcc` and `directories`.
//!
//! Every mutator persists to disk immediately, with the file mode restricted
//! to the owner. Mutators return `false` when persisting fails; no partial
//! state is kept in that case. A `Config` handle can be shared freely across
//! tasks; access is serialised by a mutex.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_yaml::Value as Yaml;

#[macro_use]
extern crate log;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A configuration scalar or list.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

type Groups = BTreeMap<String, BTreeMap<String, Value>>;

/// The file-backed store. Usually used through [`Config`].
#[derive(Debug)]
pub struct KeyFile {
    path: PathBuf,
    groups: Groups,
}

impl KeyFile {
    /// Load a key file. A missing file yields an empty store bound to the
    /// same path.
    pub fn load(path: PathBuf) -> Result<KeyFile, ConfigError> {
        let groups = match fs::read_to_string(&path) {
            Ok(contents) => parse_groups(&contents)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Groups::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(KeyFile { path, groups })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store back to its file, owner-readable only.
    pub fn persist(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, render_groups(&self.groups)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&Value> {
        self.groups.get(group)?.get(key)
    }

    pub fn set(&mut self, group: &str, key: &str, value: Value) {
        self.groups
            .entry(group.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    pub fn remove_key(&mut self, group: &str, key: &str) -> bool {
        match self.groups.get_mut(group) {
            Some(keys) => keys.remove(key).is_some(),
            None => false,
        }
    }

    pub fn remove_group(&mut self, group: &str) -> bool {
        self.groups.remove(group).is_some()
    }

    pub fn exists(&self, group: &str, key: &str) -> bool {
        self.get(group, key).is_some()
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn keys(&self, group: &str) -> Vec<String> {
        match self.groups.get(group) {
            Some(keys) => keys.keys().cloned().collect(),
            None => Vec::new(),
        }
    }
}

fn parse_groups(contents: &str) -> Result<Groups, ConfigError> {
    if contents.trim().is_empty() {
        return Ok(Groups::new());
    }
    let raw: BTreeMap<String, BTreeMap<String, Yaml>> = serde_yaml::from_str(contents)?;
    let mut groups = Groups::new();
    for (group, keys) in raw {
        let entry = groups.entry(group).or_default();
        for (key, yaml) in keys {
            if let Some(value) = yaml_to_value(yaml) {
                entry.insert(key, value);
            }
        }
    }
    Ok(groups)
}

fn render_groups(groups: &Groups) -> Result<String, ConfigError> {
    let mut raw: BTreeMap<&str, BTreeMap<&str, Yaml>> = BTreeMap::new();
    for (group, keys) in groups {
        let entry = raw.entry(group).or_default();
        for (key, value) in keys {
            entry.insert(key, value_to_yaml(value));
        }
    }
    Ok(serde_yaml::to_string(&raw)?)
}

fn yaml_to_value(yaml: Yaml) -> Option<Value> {
    match yaml {
        Yaml::Bool(b) => Some(Value::Bool(b)),
        Yaml::Number(n) => n.as_i64().map(Value::Int),
        Yaml::String(s) => Some(Value::Str(s)),
        Yaml::Sequence(seq) => Some(Value::List(
            seq.into_iter()
                .filter_map(|item| match item {
                    Yaml::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
        )),
        _ => None,
    }
}

fn value_to_yaml(value: &Value) -> Yaml {
    match value {
        Value::Bool(b) => Yaml::Bool(*b),
        Value::Int(i) => Yaml::Number((*i).into()),
        Value::Str(s) => Yaml::String(s.clone()),
        Value::List(list) => Yaml::Sequence(list.iter().cloned().map(Yaml::String).collect()),
    }
}

/// A shareable handle to a key file. Typed getters return defaults for
/// missing keys; mutators persist immediately and report success.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<Mutex<KeyFile>>,
}

impl Config {
    pub fn load(path: PathBuf) -> Result<Config, ConfigError> {
        Ok(Config {
            inner: Arc::new(Mutex::new(KeyFile::load(path)?)),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path().to_owned()
    }

    /// Move the backing file. Used when a server is renamed.
    pub fn move_to(&self, path: PathBuf) -> bool {
        let mut key_file = self.inner.lock().unwrap();
        let old_path = key_file.path().to_owned();
        key_file.path = path;
        match key_file.persist() {
            Ok(()) => {
                if old_path != *key_file.path() {
                    let _ = fs::remove_file(old_path);
                }
                true
            }
            Err(err) => {
                warn!("could not persist config to new path: {}", err);
                key_file.path = old_path;
                false
            }
        }
    }

    /// Delete the backing file. The in-memory state is untouched.
    pub fn delete_file(&self) -> bool {
        let key_file = self.inner.lock().unwrap();
        fs::remove_file(key_file.path()).is_ok()
    }

    pub fn get_bool(&self, group: &str, key: &str) -> bool {
        match self.inner.lock().unwrap().get(group, key) {
            Some(Value::Bool(b)) => *b,
            _ => false,
        }
    }

    pub fn get_int(&self, group: &str, key: &str) -> i64 {
        match self.inner.lock().unwrap().get(group, key) {
            Some(Value::Int(i)) => *i,
            _ => 0,
        }
    }

    pub fn get_str(&self, group: &str, key: &str) -> Option<String> {
        match self.inner.lock().unwrap().get(group, key) {
            Some(Value::Str(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    pub fn get_list(&self, group: &str, key: &str) -> Vec<String> {
        match self.inner.lock().unwrap().get(group, key) {
            Some(Value::List(list)) => list.clone(),
            _ => Vec::new(),
        }
    }

    pub fn set_bool(&self, group: &str, key: &str, value: bool) -> bool {
        self.set(group, key, Value::Bool(value))
    }

    pub fn set_int(&self, group: &str, key: &str, value: i64) -> bool {
        self.set(group, key, Value::Int(value))
    }

    pub fn set_str(&self, group: &str, key: &str, value: &str) -> bool {
        self.set(group, key, Value::Str(value.to_owned()))
    }

    pub fn set_list(&self, group: &str, key: &str, value: Vec<String>) -> bool {
        self.set(group, key, Value::List(value))
    }

    fn set(&self, group: &str, key: &str, value: Value) -> bool {
        let mut key_file = self.inner.lock().unwrap();
        let old = key_file.get(group, key).cloned();
        key_file.set(group, key, value);
        match key_file.persist() {
            Ok(()) => true,
            Err(err) => {
                warn!("could not persist {}.{}: {}", group, key, err);
                // Roll back so no unpersisted state is exposed
                match old {
                    Some(old) => key_file.set(group, key, old),
                    None => {
                        key_file.remove_key(group, key);
                    }
                }
                false
            }
        }
    }

    pub fn remove_key(&self, group: &str, key: &str) -> bool {
        let mut key_file = self.inner.lock().unwrap();
        let removed = key_file.remove_key(group, key);
        if removed {
            if let Err(err) = key_file.persist() {
                warn!("could not persist removal of {}.{}: {}", group, key, err);
            }
        }
        removed
    }

    pub fn remove_group(&self, group: &str) -> bool {
        let mut key_file = self.inner.lock().unwrap();
        let removed = key_file.remove_group(group);
        if removed {
            if let Err(err) = key_file.persist() {
                warn!("could not persist removal of group {}: {}", group, err);
            }
        }
        removed
    }

    pub fn exists(&self, group: &str, key: &str) -> bool {
        self.inner.lock().unwrap().exists(group, key)
    }

    pub fn groups(&self) -> Vec<String> {
        self.inner.lock().unwrap().groups()
    }

    pub fn keys(&self, group: &str) -> Vec<String> {
        self.inner.lock().unwrap().keys(group)
    }
}

/// The name the OS knows the current user by. Used for nick and user name
/// defaults.
pub fn os_user_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "maki".to_owned())
}

/// Fill in missing server config keys with defaults. Idempotent: existing
/// keys are never overwritten.
pub fn fill_server_defaults(config: &Config) {
    let user_name = os_user_name();
    let defaults: &[(&str, Value)] = &[
        ("autoconnect", Value::Bool(false)),
        ("port", Value::Int(6667)),
        ("ssl", Value::Bool(false)),
        ("nick", Value::Str(user_name.clone())),
        ("user", Value::Str(user_name.clone())),
        ("name", Value::Str(user_name)),
        ("nickserv", Value::Str(String::new())),
        ("nickserv_ghost", Value::Bool(false)),
    ];

    let mut key_file = config.inner.lock().unwrap();
    let mut dirty = false;
    for (key, value) in defaults {
        if !key_file.exists("server", key) {
            key_file.set("server", key, value.clone());
            dirty = true;
        }
    }
    if dirty {
        if let Err(err) = key_file.persist() {
            warn!("could not persist server config defaults: {}", err);
        }
    }
}

/// Fill in missing instance config keys with defaults. Idempotent.
pub fn fill_instance_defaults(config: &Config, logs_dir: &Path, downloads_dir: &Path) {
    let defaults: &[(&str, &str, Value)] = &[
        ("dcc", "accept_chat", Value::Bool(false)),
        ("dcc", "accept_resume", Value::Bool(false)),
        ("dcc", "accept_send", Value::Bool(false)),
        ("dcc", "port_first", Value::Int(1024)),
        ("dcc", "port_last", Value::Int(65535)),
        (
            "directories",
            "downloads",
            Value::Str(downloads_dir.to_string_lossy().into_owned()),
        ),
        (
            "directories",
            "logs",
            Value::Str(logs_dir.to_string_lossy().into_owned()),
        ),
        ("logging", "enabled", Value::Bool(true)),
        ("logging", "format", Value::Str("$n".to_owned())),
        ("reconnect", "retries", Value::Int(3)),
        ("reconnect", "timeout", Value::Int(10)),
    ];

    let mut key_file = config.inner.lock().unwrap();
    let mut dirty = false;
    for (group, key, value) in defaults {
        if !key_file.exists(group, key) {
            key_file.set(group, key, value.clone());
            dirty = true;
        }
    }
    if dirty {
        if let Err(err) = key_file.persist() {
            warn!("could not persist instance config defaults: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(name: &str) -> (PathBuf, Config) {
        let dir = std::env::temp_dir().join("maki_config_tests");
        let _ = fs::create_dir_all(&dir);
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        let config = Config::load(path.clone()).unwrap();
        (path, config)
    }

    #[test]
    fn set_get_roundtrip() {
        let (path, config) = temp_config("roundtrip");

        assert!(config.set_str("server", "address", "irc.example.net"));
        assert!(config.set_int("server", "port", 6697));
        assert!(config.set_bool("server", "ssl", true));
        assert!(config.set_list(
            "server",
            "commands",
            vec!["MODE maki +i".to_owned(), "OPER x y".to_owned()],
        ));

        // Reload from disk: every mutator persists immediately
        let reloaded = Config::load(path.clone()).unwrap();
        assert_eq!(
            reloaded.get_str("server", "address"),
            Some("irc.example.net".to_owned())
        );
        assert_eq!(reloaded.get_int("server", "port"), 6697);
        assert!(reloaded.get_bool("server", "ssl"));
        assert_eq!(reloaded.get_list("server", "commands").len(), 2);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_keys_yield_defaults() {
        let (path, config) = temp_config("missing");
        assert!(!config.get_bool("server", "ssl"));
        assert_eq!(config.get_int("server", "port"), 0);
        assert_eq!(config.get_str("server", "nickserv"), None);
        assert!(config.get_list("server", "ignores").is_empty());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn empty_string_reads_as_none() {
        let (path, config) = temp_config("empty_str");
        assert!(config.set_str("server", "nickserv", ""));
        assert_eq!(config.get_str("server", "nickserv"), None);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn server_defaults_are_idempotent() {
        let (path, config) = temp_config("defaults");
        fill_server_defaults(&config);
        assert_eq!(config.get_int("server", "port"), 6667);
        assert!(!config.get_bool("server", "ssl"));
        assert!(!config.get_bool("server", "nickserv_ghost"));

        // A second run must not clobber user settings
        assert!(config.set_int("server", "port", 7000));
        fill_server_defaults(&config);
        assert_eq!(config.get_int("server", "port"), 7000);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn channel_groups() {
        let (path, config) = temp_config("channels");
        assert!(config.set_bool("#maki", "autojoin", true));
        assert!(config.set_str("#maki", "key", "sekrit"));
        assert!(config.set_bool("#other", "autojoin", false));

        let mut groups = config.groups();
        groups.sort();
        assert_eq!(groups, vec!["#maki".to_owned(), "#other".to_owned()]);
        assert_eq!(config.keys("#maki").len(), 2);

        assert!(config.remove_group("#other"));
        assert!(!config.remove_group("#other"));
        let _ = fs::remove_file(path);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let (path, config) = temp_config("perms");
        assert!(config.set_bool("server", "ssl", false));
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = fs::remove_file(path);
    }
}
