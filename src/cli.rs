//! Command line for the gateway binary.
//!
//! Turns flags into `GatewaySettings` and the ordered backend list: the
//! default backend (positional command) first, then named backends from
//! either `--named-server-config` or repeated `--named-server` flags.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use thiserror::Error;

use crate::config::{load_named_backends, BackendSpec, ConfigError, GatewaySettings};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("'{0}' is a URL; connecting to remote servers is not supported, give a command to spawn")]
    RemoteUrl(String),

    #[error("no backends configured; provide a default command or use --named-server / --named-server-config")]
    NoBackends,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Expose stdio MCP servers over SSE and streamable HTTP.
#[derive(Debug, Parser)]
#[command(name = "mcp-gateway", version, about)]
pub struct Cli {
    /// Command for the default server, mounted at the root.
    pub command: Option<String>,

    /// Arguments for the default server command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Environment variable for the default server. Repeatable.
    #[arg(short = 'e', long = "env", num_args = 2, value_names = ["KEY", "VALUE"], action = ArgAction::Append)]
    pub env: Vec<String>,

    /// Working directory for the default server. Named servers use the gateway's.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Pass the gateway's whole environment to every server.
    #[arg(long, overrides_with = "no_pass_environment")]
    pub pass_environment: bool,

    #[arg(long, overrides_with = "pass_environment", hide = true)]
    pub no_pass_environment: bool,

    /// Named server: NAME and a single COMMAND_STRING, mounted at /servers/NAME/. Repeatable.
    #[arg(long = "named-server", num_args = 2, value_names = ["NAME", "COMMAND_STRING"], action = ArgAction::Append)]
    pub named_server: Vec<String>,

    /// JSON file of named servers. Takes precedence over --named-server.
    #[arg(long, value_name = "FILE_PATH")]
    pub named_server_config: Option<PathBuf>,

    /// Host to listen on.
    #[arg(long, alias = "sse-host", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on. 0 picks a free port.
    #[arg(long, alias = "sse-port", default_value_t = 0)]
    pub port: u16,

    /// Allowed CORS origins. Without this, no CORS headers are sent.
    #[arg(long = "allow-origin", num_args = 1.., action = ArgAction::Append)]
    pub allow_origin: Vec<String>,

    /// Verbose logging.
    #[arg(long)]
    pub debug: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics_address: Option<String>,

    /// Seconds a backend may take to answer initialize.
    #[arg(long, default_value_t = 30)]
    pub handshake_timeout_secs: u64,

    /// Seconds a backend gets to exit before it is killed at shutdown.
    #[arg(long, default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Seconds between SSE keep-alive comments. 0 disables them.
    #[arg(long, default_value_t = 15)]
    pub sse_keep_alive_secs: u64,

    /// Streamable HTTP without sessions: every request is its own conversation.
    #[arg(long)]
    pub stateless: bool,
}

impl Cli {
    pub fn pass_environment(&self) -> bool {
        self.pass_environment && !self.no_pass_environment
    }

    pub fn settings(&self) -> GatewaySettings {
        let mut settings = GatewaySettings::default();
        settings.listener.bind_host = self.host.clone();
        settings.listener.port = self.port;
        settings.cors.allow_origins = if self.allow_origin.is_empty() {
            None
        } else {
            Some(self.allow_origin.clone())
        };
        settings.backends.handshake_timeout_secs = self.handshake_timeout_secs;
        settings.backends.shutdown_grace_secs = self.shutdown_grace_secs;
        settings.transport.sse_keep_alive_secs = self.sse_keep_alive_secs;
        settings.transport.stateless = self.stateless;
        settings.observability.debug = self.debug;
        settings.observability.metrics_address = self.metrics_address.clone();
        settings
    }

    /// Environment every server starts from, before its own entries.
    pub fn base_environment(&self) -> BTreeMap<String, String> {
        if self.pass_environment() {
            std::env::vars().collect()
        } else {
            BTreeMap::new()
        }
    }

    /// Default backend first, then named backends in configured order.
    pub fn build_specs(&self) -> Result<Vec<BackendSpec>, CliError> {
        if let Some(command) = &self.command {
            if command.starts_with("http://") || command.starts_with("https://") {
                return Err(CliError::RemoteUrl(command.clone()));
            }
        }

        let base_env = self.base_environment();
        let mut specs = Vec::new();

        if let Some(command) = self.command.as_deref().filter(|c| !c.trim().is_empty()) {
            let mut spec = BackendSpec::new(None, command);
            spec.args = self.args.clone();
            spec.env = base_env.clone();
            spec.env.extend(pairs(&self.env));
            spec.cwd = self.cwd.clone();
            tracing::info!(command = %spec.command_line(), cwd = ?spec.cwd, "Configured default server");
            specs.push(spec);
        }

        match &self.named_server_config {
            Some(path) => {
                if !self.named_server.is_empty() {
                    tracing::warn!("--named-server arguments are ignored when --named-server-config is provided");
                }
                specs.extend(load_named_backends(path, &base_env)?);
            }
            None => specs.extend(named_from_flags(&self.named_server, &base_env)),
        }

        if specs.is_empty() {
            return Err(CliError::NoBackends);
        }
        Ok(specs)
    }
}

fn pairs(flat: &[String]) -> BTreeMap<String, String> {
    flat.chunks_exact(2)
        .map(|kv| (kv[0].clone(), kv[1].clone()))
        .collect()
}

fn named_from_flags(flat: &[String], base_env: &BTreeMap<String, String>) -> Vec<BackendSpec> {
    let mut specs: Vec<BackendSpec> = Vec::new();
    for def in flat.chunks_exact(2) {
        let (name, command_string) = (&def[0], &def[1]);
        let parts = match shlex::split(command_string) {
            Some(parts) if !parts.is_empty() => parts,
            _ => {
                tracing::error!(
                    server = %name,
                    command = %command_string,
                    "Invalid COMMAND_STRING for named server; skipping"
                );
                continue;
            }
        };
        let mut parts = parts.into_iter();
        let Some(command) = parts.next() else {
            continue;
        };
        let mut spec = BackendSpec::new(Some(name.clone()), command);
        spec.args = parts.collect();
        spec.env = base_env.clone();
        tracing::info!(server = %name, command = %spec.command_line(), "Configured named server");

        if let Some(pos) = specs.iter().position(|s| s.name == spec.name) {
            tracing::warn!(server = %name, "Named server given more than once; the later one wins");
            specs.remove(pos);
        }
        specs.push(spec);
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mcp-gateway").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_server_with_trailing_args() {
        let cli = parse(&["--port", "8080", "-e", "A", "1", "uvx", "mcp-server-fetch", "--timeout", "10"]);
        let specs = cli.build_specs().unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].is_default());
        assert_eq!(specs[0].command_line(), "uvx mcp-server-fetch --timeout 10");
        assert_eq!(specs[0].env["A"], "1");
        assert_eq!(cli.settings().listener.port, 8080);
    }

    #[test]
    fn test_named_servers_from_flags() {
        let cli = parse(&[
            "--named-server", "fetch", "uvx mcp-server-fetch --timeout 10",
            "--named-server", "git", "'my tool' --repo .",
            "--named-server", "empty", "",
        ]);
        let specs = cli.build_specs().unwrap();
        let labels: Vec<_> = specs.iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["fetch", "git"]);
        assert_eq!(specs[1].command, "my tool");
        assert_eq!(specs[1].args, vec!["--repo", "."]);
    }

    #[test]
    fn test_default_env_does_not_leak_to_named() {
        let cli = parse(&["-e", "ONLY_DEFAULT", "x", "--named-server", "n", "cmd", "main-cmd"]);
        let specs = cli.build_specs().unwrap();
        assert_eq!(specs[0].env.get("ONLY_DEFAULT").map(String::as_str), Some("x"));
        assert!(!specs[1].env.contains_key("ONLY_DEFAULT"));
        assert!(specs[1].cwd.is_none());
    }

    #[test]
    fn test_config_file_wins_over_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mcpServers":{{"echo":{{"command":"echo","args":["hi"]}},"off":{{"command":"x","enabled":false}}}}}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = parse(&["--named-server", "ignored", "cmd", "--named-server-config", &path]);
        let specs = cli.build_specs().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].label(), "echo");
    }

    #[test]
    fn test_url_is_rejected() {
        let cli = parse(&["https://example.com/sse"]);
        assert!(matches!(cli.build_specs(), Err(CliError::RemoteUrl(_))));
    }

    #[test]
    fn test_nothing_configured() {
        let cli = parse(&[]);
        assert!(matches!(cli.build_specs(), Err(CliError::NoBackends)));
    }

    #[test]
    fn test_settings_mapping() {
        let cli = parse(&[
            "--sse-host", "0.0.0.0",
            "--allow-origin", "http://a", "http://b",
            "--debug",
            "--pass-environment", "--no-pass-environment",
            "cmd",
        ]);
        let settings = cli.settings();
        assert_eq!(settings.listener.bind_host, "0.0.0.0");
        assert_eq!(
            settings.cors.allow_origins,
            Some(vec!["http://a".to_string(), "http://b".to_string()])
        );
        assert!(settings.observability.debug);
        assert!(!settings.transport.stateless);
        assert!(!cli.pass_environment());
        assert!(parse(&["--stateless", "cmd"]).settings().transport.stateless);
        assert!(parse(&["cmd"]).settings().cors.allow_origins.is_none());
    }
}
