//! Configuration management
//!
//! Handles CLI argument parsing, config file loading, and defaults for both
//! the storage node and the interactive client.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::client::SessionSettings;
use crate::protocol::{FrameLimits, DEFAULT_MAX_FIELD_LEN, DEFAULT_MAX_PAYLOAD_LEN};
use crate::registry::{NodeEndpoint, NodeRegistry, RegistryError};
use crate::store::StoreBackend;

const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid node registry: {0}")]
    Registry(#[from] RegistryError),
}

#[derive(Parser, Debug)]
#[command(name = "dfs")]
#[command(about = "Four-node replicated file store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one storage node
    Node(NodeCommand),
    /// Log in and issue list/get/put commands against the cluster
    Client(ClientCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct NodeCommand {
    /// TOML file with node settings, used instead of the flags below
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root directory of this node's fragment store
    #[arg(long, default_value = "./DFS1")]
    pub root: PathBuf,

    /// Address to accept client connections on
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_address: String,

    /// TCP port to accept client connections on
    #[arg(long, default_value_t = 10001)]
    pub listen_port: u16,

    /// Storage backend for fragments
    #[arg(long, value_enum, default_value_t = StoreBackend::Fs)]
    pub backend: StoreBackend,

    /// Largest text field (filename, username) accepted on the wire
    #[arg(long, default_value_t = DEFAULT_MAX_FIELD_LEN)]
    pub max_field_bytes: usize,

    /// Largest single fragment accepted on the wire
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_LEN)]
    pub max_payload_bytes: u64,

    /// Milliseconds a connection may stay silent while the node waits for a frame
    #[arg(long, default_value_t = DEFAULT_READ_TIMEOUT_MS)]
    pub read_timeout_ms: u64,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct ClientCommand {
    /// TOML file with client settings; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Storage node as ID=HOST:PORT, given four times in placement order
    #[arg(long = "node")]
    pub nodes: Vec<NodeEndpoint>,

    /// File of `username password` lines
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Directory that `get` writes reconstructed files into
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Milliseconds to wait for a node to accept a connection
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Milliseconds to wait for a node to finish one command
    #[arg(long)]
    pub io_timeout_ms: Option<u64>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub root: PathBuf,
    pub listen_address: String,
    pub listen_port: u16,
    pub backend: StoreBackend,
    pub log_level: String,
    pub read_timeout_ms: u64,
    pub limits: FrameLimits,
}

impl NodeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.limits.validate().map_err(ConfigError::Invalid)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            root: PathBuf::from("./DFS1"),
            listen_address: "127.0.0.1".to_string(),
            listen_port: 10001,
            backend: StoreBackend::Fs,
            log_level: "info".to_string(),
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            limits: FrameLimits::default(),
        }
    }
}

impl From<NodeCommand> for NodeConfig {
    fn from(cmd: NodeCommand) -> Self {
        NodeConfig {
            root: cmd.root,
            listen_address: cmd.listen_address,
            listen_port: cmd.listen_port,
            backend: cmd.backend,
            log_level: cmd.log_level,
            read_timeout_ms: cmd.read_timeout_ms,
            limits: FrameLimits {
                max_field_len: cmd.max_field_bytes,
                max_payload_len: cmd.max_payload_bytes,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub nodes: Vec<NodeEndpoint>,
    pub credentials_file: PathBuf,
    pub download_dir: PathBuf,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub log_level: String,
    pub limits: FrameLimits,
}

impl ClientConfig {
    /// Load config from a TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Layer explicit CLI flags over a base config
    pub fn apply(mut self, cmd: ClientCommand) -> Self {
        if !cmd.nodes.is_empty() {
            self.nodes = cmd.nodes;
        }
        if let Some(path) = cmd.credentials {
            self.credentials_file = path;
        }
        if let Some(dir) = cmd.download_dir {
            self.download_dir = dir;
        }
        if let Some(ms) = cmd.connect_timeout_ms {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = cmd.io_timeout_ms {
            self.io_timeout_ms = ms;
        }
        if let Some(level) = cmd.log_level {
            self.log_level = level;
        }
        self
    }

    pub fn registry(&self) -> Result<NodeRegistry, ConfigError> {
        Ok(NodeRegistry::new(self.nodes.clone())?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry()?;
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        self.limits.validate().map_err(ConfigError::Invalid)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            limits: self.limits,
            download_dir: self.download_dir.clone(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            nodes: NodeRegistry::local_default().nodes().to_vec(),
            credentials_file: PathBuf::from("dfc_passwords.conf"),
            download_dir: PathBuf::from("."),
            connect_timeout_ms: 2_000,
            io_timeout_ms: 30_000,
            log_level: "warn".to_string(),
            limits: FrameLimits::default(),
        }
    }
}

/// What the process was asked to do
#[derive(Debug, Clone)]
pub enum Invocation {
    Node(NodeConfig),
    Client(ClientConfig),
}

impl Invocation {
    /// Build the invocation from process arguments
    pub fn from_cli() -> Result<Self, ConfigError> {
        Self::from_cli_parts(Cli::parse())
    }

    /// Same as [`Invocation::from_cli`] over an explicit argument list
    pub fn try_parse_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_cli_parts(cli)
    }

    fn from_cli_parts(cli: Cli) -> Result<Self, ConfigError> {
        match cli.command {
            Commands::Node(cmd) => {
                let config = match &cmd.config {
                    Some(path) => NodeConfig::load_from_file(path)?,
                    None => cmd.into(),
                };
                config.validate()?;
                Ok(Invocation::Node(config))
            }
            Commands::Client(cmd) => {
                let base = match &cmd.config {
                    Some(path) => ClientConfig::load_from_file(path)?,
                    None => ClientConfig::default(),
                };
                let config = base.apply(cmd);
                config.validate()?;
                Ok(Invocation::Client(config))
            }
        }
    }

    pub fn log_level(&self) -> &str {
        match self {
            Invocation::Node(config) => &config.log_level,
            Invocation::Client(config) => &config.log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_node_config() {
        let config = NodeConfig::default();
        assert_eq!(config.root, PathBuf::from("./DFS1"));
        assert_eq!(config.listen_port, 10001);
        assert_eq!(config.backend, StoreBackend::Fs);
        assert_eq!(config.limits.max_field_len, 1024);
    }

    #[test]
    fn test_node_config_from_cli() {
        let invocation = Invocation::try_parse_from([
            "dfs",
            "node",
            "--root",
            "./DFS3",
            "--listen-port",
            "10003",
            "--backend",
            "rocksdb",
            "--max-payload-bytes",
            "4096",
            "--log-level",
            "debug",
        ])
        .unwrap();

        let Invocation::Node(config) = invocation else {
            panic!("expected node invocation");
        };
        assert_eq!(config.root, PathBuf::from("./DFS3"));
        assert_eq!(config.listen_port, 10003);
        assert_eq!(config.backend, StoreBackend::Rocksdb);
        assert_eq!(config.limits.max_payload_len, 4096);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.credentials_file, PathBuf::from("dfc_passwords.conf"));
        assert_eq!(config.registry().unwrap(), NodeRegistry::local_default());
        assert_eq!(config.log_level, "warn");
        assert!(config.validate().is_ok());

        let settings = config.session_settings();
        assert_eq!(settings.connect_timeout, Duration::from_millis(2_000));
        assert_eq!(settings.io_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn test_client_flags_override_defaults() {
        let invocation = Invocation::try_parse_from([
            "dfs",
            "client",
            "--node",
            "A=10.0.0.1:1",
            "--node",
            "B=10.0.0.2:2",
            "--node",
            "C=10.0.0.3:3",
            "--node",
            "D=10.0.0.4:4",
            "--io-timeout-ms",
            "500",
        ])
        .unwrap();

        let Invocation::Client(config) = invocation else {
            panic!("expected client invocation");
        };
        assert_eq!(config.nodes[2], NodeEndpoint::new("C", "10.0.0.3", 3));
        assert_eq!(config.io_timeout_ms, 500);
        assert_eq!(config.connect_timeout_ms, 2_000);
    }

    #[test]
    fn test_client_rejects_partial_registry() {
        let result = Invocation::try_parse_from(["dfs", "client", "--node", "A=h:1"]);
        assert!(matches!(
            result,
            Err(ConfigError::Registry(RegistryError::WrongNodeCount { .. }))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ClientConfig {
            io_timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_payload_limit_beyond_length_field_rejected() {
        let result = Invocation::try_parse_from([
            "dfs",
            "node",
            "--max-payload-bytes",
            "8589934592",
        ]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let config = ClientConfig {
            limits: FrameLimits {
                max_field_len: DEFAULT_MAX_FIELD_LEN,
                max_payload_len: u64::MAX,
            },
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_node_read_timeout() {
        let invocation =
            Invocation::try_parse_from(["dfs", "node", "--read-timeout-ms", "250"]).unwrap();
        let Invocation::Node(config) = invocation else {
            panic!("expected node invocation");
        };
        assert_eq!(config.read_timeout(), Duration::from_millis(250));
        assert_eq!(NodeConfig::default().read_timeout_ms, 30_000);

        let zero = NodeConfig {
            read_timeout_ms: 0,
            ..NodeConfig::default()
        };
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_client_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            r#"
credentials_file = "users.conf"
io_timeout_ms = 1500

[[nodes]]
id = "N1"
address = "192.168.1.10"
port = 7001

[[nodes]]
id = "N2"
address = "192.168.1.11"
port = 7002

[[nodes]]
id = "N3"
address = "192.168.1.12"
port = 7003

[[nodes]]
id = "N4"
address = "192.168.1.13"
port = 7004
"#,
        )
        .unwrap();

        let config = ClientConfig::load_from_file(&path).unwrap();
        assert_eq!(config.credentials_file, PathBuf::from("users.conf"));
        assert_eq!(config.io_timeout_ms, 1500);
        assert_eq!(config.connect_timeout_ms, 2_000);
        assert_eq!(config.registry().unwrap().nodes()[3].port, 7004);

        // CLI flags win over the file
        let overridden = config.apply(ClientCommand {
            credentials: Some(PathBuf::from("other.conf")),
            ..ClientCommand::default()
        });
        assert_eq!(overridden.credentials_file, PathBuf::from("other.conf"));
        assert_eq!(overridden.io_timeout_ms, 1500);
    }

    #[test]
    fn test_node_config_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            "root = \"/srv/DFS2\"\nlisten_port = 10002\n[limits]\nmax_field_len = 256\nmax_payload_len = 1048576\n",
        )
        .unwrap();

        let config = NodeConfig::load_from_file(&path).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/DFS2"));
        assert_eq!(config.listen_address, "127.0.0.1");
        assert_eq!(config.limits.max_field_len, 256);
    }

    #[test]
    fn test_missing_config_file() {
        let result = ClientConfig::load_from_file(Path::new("/no/such/client.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
