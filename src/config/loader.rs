//! Named-server configuration loading from disk.
//!
//! File format:
//! ```json
//! { "mcpServers": { "fetch": { "command": "uvx", "args": ["mcp-server-fetch"] } } }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::config::schema::BackendSpec;

/// Key holding the named server table.
pub const SERVERS_KEY: &str = "mcpServers";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("invalid config format: {0}")]
    InvalidFormat(String),
}

/// Load named backends from a JSON file.
///
/// Every returned spec is enabled and carries `base_env` overlaid with the
/// entry's own `env`.
pub fn load_named_backends(
    path: &Path,
    base_env: &BTreeMap<String, String>,
) -> Result<Vec<BackendSpec>, ConfigError> {
    tracing::info!(path = %path.display(), "Loading named server configurations");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_named_backends(&content, base_env)
}

/// Parse a named-server document already in memory.
pub fn parse_named_backends(
    content: &str,
    base_env: &BTreeMap<String, String>,
) -> Result<Vec<BackendSpec>, ConfigError> {
    // Syntax and shape first, so a well-formed but wrong document is
    // reported as a format problem rather than a serde type error.
    let doc: Value = serde_json::from_str(content).map_err(ConfigError::Json)?;
    let Some(root) = doc.as_object() else {
        return Err(ConfigError::InvalidFormat("top level must be an object".into()));
    };
    match root.get(SERVERS_KEY) {
        Some(Value::Object(_)) => {}
        Some(_) => {
            return Err(ConfigError::InvalidFormat(format!("'{}' must be an object", SERVERS_KEY)))
        }
        None => {
            return Err(ConfigError::InvalidFormat(format!("missing '{}' key", SERVERS_KEY)))
        }
    }

    // Second pass keeps the entries in file order.
    let ordered: OrderedDocument = serde_json::from_str(content)
        .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;

    let mut specs: Vec<BackendSpec> = Vec::new();
    for (name, entry) in ordered.servers.0 {
        let Some(spec) = parse_entry(&name, &entry, base_env) else {
            continue;
        };
        if let Some(pos) = specs.iter().position(|s| s.name == spec.name) {
            tracing::warn!(server = %name, "Duplicate named server entry; the later one wins");
            specs.remove(pos);
        }
        tracing::info!(
            server = %name,
            command = %spec.command_line(),
            "Configured named server from config"
        );
        specs.push(spec);
    }
    Ok(specs)
}

fn parse_entry(
    name: &str,
    entry: &Value,
    base_env: &BTreeMap<String, String>,
) -> Option<BackendSpec> {
    let Some(obj) = entry.as_object() else {
        tracing::warn!(server = %name, "Skipping server entry that is not an object");
        return None;
    };

    if matches!(obj.get("enabled"), Some(Value::Bool(false))) {
        tracing::info!(server = %name, "Named server is not enabled. Skipping.");
        return None;
    }

    let command = match obj.get("command").and_then(Value::as_str) {
        Some(c) if !c.trim().is_empty() => c.to_string(),
        _ => {
            tracing::warn!(server = %name, "Named server is missing 'command'. Skipping.");
            return None;
        }
    };

    let args = match obj.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let strings: Option<Vec<String>> =
                items.iter().map(|v| v.as_str().map(str::to_string)).collect();
            match strings {
                Some(args) => args,
                None => {
                    tracing::warn!(server = %name, "Named server has non-string 'args'. Skipping.");
                    return None;
                }
            }
        }
        Some(_) => {
            tracing::warn!(server = %name, "Named server has invalid 'args' (must be a list). Skipping.");
            return None;
        }
    };

    let mut env = base_env.clone();
    match obj.get("env") {
        None | Some(Value::Null) => {}
        Some(Value::Object(vars)) => {
            for (key, value) in vars {
                let Some(value) = value.as_str() else {
                    tracing::warn!(server = %name, key = %key, "Named server has non-string env value. Skipping.");
                    return None;
                };
                env.insert(key.clone(), value.to_string());
            }
        }
        Some(_) => {
            tracing::warn!(server = %name, "Named server has invalid 'env' (must be an object). Skipping.");
            return None;
        }
    }

    let mut spec = BackendSpec::new(Some(name.to_string()), command);
    spec.args = args;
    spec.env = env;
    Some(spec)
}

#[derive(Deserialize)]
struct OrderedDocument {
    #[serde(rename = "mcpServers")]
    servers: OrderedEntries,
}

/// Map entries in document order.
struct OrderedEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for OrderedEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = OrderedEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of named server entries")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    entries.push((key, value));
                }
                Ok(OrderedEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn no_env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_single_enabled_entry() {
        let specs = parse_named_backends(
            r#"{"mcpServers":{"echo":{"command":"echo","args":["hi"]}}}"#,
            &no_env(),
        )
        .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name.as_deref(), Some("echo"));
        assert_eq!(specs[0].command, "echo");
        assert_eq!(specs[0].args, vec!["hi".to_string()]);
        assert!(specs[0].enabled);
        assert!(specs[0].cwd.is_none());
    }

    #[test]
    fn test_disabled_entry_is_dropped() {
        let specs = parse_named_backends(
            r#"{"mcpServers":{"off":{"command":"x","enabled":false},"on":{"command":"y"}}}"#,
            &no_env(),
        )
        .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name.as_deref(), Some("on"));
    }

    #[test]
    fn test_malformed_entries_are_skipped_individually() {
        let doc = r#"{"mcpServers":{
            "no_command": {"args": ["a"]},
            "empty_command": {"command": ""},
            "bad_args": {"command": "x", "args": "not-a-list"},
            "mixed_args": {"command": "x", "args": ["ok", 3]},
            "not_object": "nope",
            "bad_env": {"command": "x", "env": ["A"]},
            "good": {"command": "ok"}
        }}"#;
        let specs = parse_named_backends(doc, &no_env()).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.label().to_string()).collect();
        assert_eq!(names, vec!["good"]);
    }

    #[test]
    fn test_file_order_is_preserved() {
        let doc = r#"{"mcpServers":{"zeta":{"command":"z"},"alpha":{"command":"a"},"mid":{"command":"m"}}}"#;
        let specs = parse_named_backends(doc, &no_env()).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.label()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_env_layers_over_base_env() {
        let mut base = BTreeMap::new();
        base.insert("SHARED".to_string(), "base".to_string());
        base.insert("KEEP".to_string(), "1".to_string());
        let specs = parse_named_backends(
            r#"{"mcpServers":{"a":{"command":"x","env":{"SHARED":"entry","NEW":"2"}}}}"#,
            &base,
        )
        .unwrap();
        let env = &specs[0].env;
        assert_eq!(env["SHARED"], "entry");
        assert_eq!(env["KEEP"], "1");
        assert_eq!(env["NEW"], "2");
    }

    #[test]
    fn test_malformed_document_is_fatal() {
        assert!(matches!(
            parse_named_backends("{not json", &no_env()),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            parse_named_backends("[]", &no_env()),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_named_backends(r#"{"servers":{}}"#, &no_env()),
            Err(ConfigError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_named_backends(r#"{"mcpServers":[]}"#, &no_env()),
            Err(ConfigError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_empty_servers_table_is_not_an_error() {
        let specs = parse_named_backends(r#"{"mcpServers":{}}"#, &no_env()).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mcpServers":{{"fetch":{{"command":"uvx","args":["mcp-server-fetch"]}}}}}}"#).unwrap();
        let specs = load_named_backends(file.path(), &no_env()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].command_line(), "uvx mcp-server-fetch");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_named_backends(Path::new("/definitely/not/here.json"), &no_env()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.json"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
