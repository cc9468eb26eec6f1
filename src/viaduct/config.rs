use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::viaduct::net::{Destination, Network};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps VIADUCT_CONFIG into the flag value when unset, but keep the precedence
    // clear by treating it as "env" when present.
    if let Some(p) = std::env::var_os("VIADUCT_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("viaduct.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["viaduct.toml", "viaduct.yaml", "viaduct.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no viaduct.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj =
        ProjectDirs::from("io", "viaduct", "viaduct").context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("viaduct.toml"))
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!("config: {} exists but is not a regular file", path.display());
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listeners: Vec<ForwardListenerConfig>,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub servers: Vec<ServerConfig>,
    pub transport: TransportConfig,
    pub policies: Vec<PolicyLevelConfig>,
}

#[derive(Debug, Clone)]
pub struct ForwardListenerConfig {
    pub listen_addr: String,
    pub target: Destination,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    pub level: u32,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub dial_timeout: Duration,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub alpn: Vec<String>,
    pub ca_file: String,
}

#[derive(Debug, Clone)]
pub struct PolicyLevelConfig {
    pub level: u32,
    pub idle_timeout: Duration,
    pub downlink_only_timeout: Duration,
    pub uplink_only_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    listeners: Vec<FileListener>,

    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    #[serde(default)]
    servers: Vec<FileServer>,

    transport: Option<FileTransport>,

    #[serde(default)]
    policies: Vec<FilePolicy>,
}

#[derive(Debug, Deserialize)]
struct FileListener {
    listen_addr: String,
    target: String,
    /// Target network, `tcp` (default) or `udp`. The HTTP CONNECT outbound
    /// only carries TCP; udp targets are rejected per session.
    network: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    address: String,
    port: u16,
    #[serde(default)]
    users: Vec<FileUser>,
}

#[derive(Debug, Deserialize)]
struct FileUser {
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    level: u32,
}

#[derive(Debug, Deserialize)]
struct FileTransport {
    dial_timeout_ms: Option<i64>,
    tls: Option<FileTls>,
}

#[derive(Debug, Deserialize)]
struct FileTls {
    #[serde(default)]
    enabled: bool,
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    alpn: Option<Vec<String>>,
    ca_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilePolicy {
    #[serde(default)]
    level: u32,
    idle_timeout_ms: Option<i64>,
    downlink_only_timeout_ms: Option<i64>,
    uplink_only_timeout_ms: Option<i64>,
}

fn ms(v: Option<i64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.map(|n| n.max(0) as u64).unwrap_or(default_ms))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = fc
            .logging
            .map(|l| LoggingConfig {
                level: l.level.unwrap_or_else(|| "info".into()),
                format: l.format.unwrap_or_else(|| "text".into()),
                output: l.output.unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            })
            .unwrap_or_else(|| LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            });

        let mut listeners = Vec::with_capacity(fc.listeners.len());
        for (i, l) in fc.listeners.iter().enumerate() {
            let listen_addr = l.listen_addr.trim().to_string();
            if listen_addr.is_empty() {
                anyhow::bail!("config: listeners[{i}] missing listen_addr");
            }
            let mut target = Destination::parse_host_port(&l.target)
                .with_context(|| format!("config: listeners[{i}] target"))?;
            target.network = match l.network.as_deref().map(str::trim).unwrap_or("tcp") {
                "" | "tcp" => Network::Tcp,
                "udp" => Network::Udp,
                other => anyhow::bail!("config: listeners[{i}] unknown network {other:?}"),
            };
            listeners.push(ForwardListenerConfig {
                listen_addr,
                target,
            });
        }

        let mut servers = Vec::with_capacity(fc.servers.len());
        for (i, s) in fc.servers.iter().enumerate() {
            let address = s.address.trim().to_string();
            if address.is_empty() {
                anyhow::bail!("config: servers[{i}] missing address");
            }
            if s.port == 0 {
                anyhow::bail!("config: servers[{i}] missing port");
            }
            let users = s
                .users
                .iter()
                .filter(|u| !u.username.trim().is_empty())
                .map(|u| UserConfig {
                    username: u.username.trim().to_string(),
                    password: u.password.clone(),
                    level: u.level,
                })
                .collect();
            servers.push(ServerConfig {
                address,
                port: s.port,
                users,
            });
        }

        if !listeners.is_empty() && servers.is_empty() {
            anyhow::bail!("config: listeners configured but no upstream servers");
        }

        let transport = {
            let t = fc.transport;
            let dial_timeout = ms(t.as_ref().and_then(|t| t.dial_timeout_ms), 5000);
            let tls = t.and_then(|t| t.tls).and_then(|tls| {
                if !tls.enabled {
                    return None;
                }
                let alpn = tls
                    .alpn
                    .unwrap_or_else(|| vec!["h2".into(), "http/1.1".into()]);
                Some(TlsConfig {
                    server_name: tls.server_name.unwrap_or_default().trim().to_string(),
                    insecure_skip_verify: tls.insecure_skip_verify,
                    alpn,
                    ca_file: tls.ca_file.unwrap_or_default().trim().to_string(),
                })
            });
            TransportConfig { dial_timeout, tls }
        };

        let mut policies = Vec::with_capacity(fc.policies.len());
        for p in &fc.policies {
            policies.push(PolicyLevelConfig {
                level: p.level,
                idle_timeout: ms(p.idle_timeout_ms, 300_000),
                downlink_only_timeout: ms(p.downlink_only_timeout_ms, 5_000),
                uplink_only_timeout: ms(p.uplink_only_timeout_ms, 2_000),
            });
        }

        Ok(Config {
            listeners,
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            servers,
            transport,
            policies,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Viaduct configuration.
#
# Each listener accepts local TCP connections and tunnels them to `target`
# through the upstream HTTP proxy pool below, using CONNECT over HTTP/1.1 or
# HTTP/2 (picked by TLS ALPN).

# admin_addr = ":9090"

[logging]
level = "info"    # debug | info | warn | error
format = "text"   # text | json
output = "stderr" # stderr | stdout | discard | <file path>

# [[listeners]]
# listen_addr = "127.0.0.1:18080"
# target = "example.com:443"

# [[servers]]
# address = "proxy.example.com"
# port = 3128
#
# [[servers.users]]
# username = "user"
# password = "pass"
# level = 0

[transport]
dial_timeout_ms = 5000

# [transport.tls]
# enabled = true
# server_name = ""
# insecure_skip_verify = false
# alpn = ["h2", "http/1.1"]
# ca_file = ""

# [[policies]]
# level = 0
# idle_timeout_ms = 300000
# downlink_only_timeout_ms = 5000
# uplink_only_timeout_ms = 2000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Viaduct configuration.
#
# Each listener accepts local TCP connections and tunnels them to `target`
# through the upstream HTTP proxy pool below, using CONNECT over HTTP/1.1 or
# HTTP/2 (picked by TLS ALPN).

# admin_addr: ":9090"

logging:
  level: info    # debug | info | warn | error
  format: text   # text | json
  output: stderr # stderr | stdout | discard | <file path>

# listeners:
#   - listen_addr: "127.0.0.1:18080"
#     target: "example.com:443"

# servers:
#   - address: proxy.example.com
#     port: 3128
#     users:
#       - username: user
#         password: pass
#         level: 0

transport:
  dial_timeout_ms: 5000
  # tls:
  #   enabled: true
  #   server_name: ""
  #   insecure_skip_verify: false
  #   alpn: ["h2", "http/1.1"]
  #   ca_file: ""

# policies:
#   - level: 0
#     idle_timeout_ms: 300000
#     downlink_only_timeout_ms: 5000
#     uplink_only_timeout_ms: 2000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(s: &str) -> anyhow::Result<Config> {
        let fc: FileConfig = toml::from_str(s)?;
        Config::from_file_config(fc)
    }

    #[test]
    fn parse_full_config() {
        let cfg = parse_toml(
            r#"
admin_addr = ":9090"

[logging]
level = "debug"
format = "json"
output = "stdout"

[[listeners]]
listen_addr = "127.0.0.1:18080"
target = "example.com:443"

[[servers]]
address = "proxy.example.com"
port = 3128

[[servers.users]]
username = "u1"
password = "p1"
level = 1

[transport]
dial_timeout_ms = 2500

[transport.tls]
enabled = true
insecure_skip_verify = true

[[policies]]
level = 1
idle_timeout_ms = 120000
"#,
        )
        .unwrap();

        assert_eq!(cfg.admin_addr, ":9090");
        assert_eq!(cfg.listeners.len(), 1);
        assert_eq!(cfg.listeners[0].target.authority(), "example.com:443");
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].users[0].level, 1);
        assert_eq!(cfg.transport.dial_timeout, Duration::from_millis(2500));
        let tls = cfg.transport.tls.as_ref().unwrap();
        assert!(tls.insecure_skip_verify);
        assert_eq!(tls.alpn, vec!["h2".to_string(), "http/1.1".to_string()]);
        assert_eq!(cfg.policies[0].idle_timeout, Duration::from_secs(120));
        assert_eq!(
            cfg.policies[0].downlink_only_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn listener_network_parsing() {
        let cfg = parse_toml(
            r#"
[[listeners]]
listen_addr = "127.0.0.1:1053"
target = "1.1.1.1:53"
network = "udp"

[[servers]]
address = "proxy.example.com"
port = 3128
"#,
        )
        .unwrap();
        assert_eq!(cfg.listeners[0].target.network, Network::Udp);

        let err = parse_toml(
            r#"
[[listeners]]
listen_addr = "127.0.0.1:1053"
target = "1.1.1.1:53"
network = "sctp"

[[servers]]
address = "p"
port = 1
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown network"));
    }

    #[test]
    fn listeners_require_servers() {
        let err = parse_toml(
            r#"
[[listeners]]
listen_addr = "127.0.0.1:18080"
target = "example.com:443"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no upstream servers"));
    }

    #[test]
    fn disabled_tls_is_none() {
        let cfg = parse_toml(
            r#"
[transport.tls]
enabled = false
"#,
        )
        .unwrap();
        assert!(cfg.transport.tls.is_none());
        assert_eq!(cfg.transport.dial_timeout, Duration::from_secs(5));
    }

    #[test]
    fn template_parses() {
        let fc: FileConfig = toml::from_str(DEFAULT_CONFIG_TEMPLATE_TOML).unwrap();
        let cfg = Config::from_file_config(fc).unwrap();
        assert!(cfg.listeners.is_empty());
        let fc: FileConfig = serde_yaml::from_str(DEFAULT_CONFIG_TEMPLATE_YAML).unwrap();
        Config::from_file_config(fc).unwrap();
    }
}
