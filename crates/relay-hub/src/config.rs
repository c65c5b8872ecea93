use anyhow::{bail, Context, Result};
use clap::Parser;
use relay_core::DEFAULT_MAX_FRAME_BYTES;
use std::{path::PathBuf, time::Duration};

const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4150;
const DEFAULT_SERVER_ID: &str = "relay";

#[derive(Parser, Debug)]
#[command(name = "relay-hub", about = "Relay event broker")]
pub struct Args {
    #[arg(long, default_value = "")]
    bind: String,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value_t = 1000)]
    accept_timeout_ms: u64,
    #[arg(long, default_value_t = 1000)]
    wait_timeout_ms: u64,
    #[arg(long, default_value_t = 100)]
    idle_ms: u64,
    #[arg(long, default_value_t = 5000)]
    handshake_timeout_ms: u64,
    #[arg(long, default_value_t = 2000)]
    write_timeout_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value = "")]
    server_id: String,
    /// JSON user table: {"users": {"name": "secret" | "sha256:<hex>"}}
    #[arg(long, default_value = "")]
    users: String,
    /// Accept every login. Development only.
    #[arg(long, default_value_t = false)]
    open: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthSource {
    Users(PathBuf),
    Open,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub server_id: String,
    pub accept_timeout: Duration,
    pub wait_timeout: Duration,
    pub idle_interval: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            server_id: DEFAULT_SERVER_ID.to_string(),
            accept_timeout: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(1),
            idle_interval: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HubSettings {
    pub relay: RelayConfig,
    pub auth: AuthSource,
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
}

pub fn load_settings() -> Result<HubSettings> {
    settings_from_args(Args::parse())
}

fn settings_from_args(args: Args) -> Result<HubSettings> {
    let port = match args.port {
        Some(port) => port,
        None => match env_value("RELAY_PORT") {
            Some(value) => value
                .parse()
                .with_context(|| format!("RELAY_PORT is not a port number: {value}"))?,
            None => DEFAULT_PORT,
        },
    };
    if args.max_frame_bytes == 0 {
        bail!("--max-frame-bytes must be greater than zero");
    }

    let relay = RelayConfig {
        bind: resolve(&args.bind, "RELAY_BIND", DEFAULT_BIND),
        port,
        server_id: resolve(&args.server_id, "RELAY_SERVER_ID", DEFAULT_SERVER_ID),
        accept_timeout: Duration::from_millis(args.accept_timeout_ms),
        wait_timeout: Duration::from_millis(args.wait_timeout_ms),
        idle_interval: Duration::from_millis(args.idle_ms),
        handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
        write_timeout: Duration::from_millis(args.write_timeout_ms),
        max_frame_bytes: args.max_frame_bytes,
    };
    if relay.server_id.contains(&['\n', '\r'][..]) {
        bail!("server id must not contain line breaks: {:?}", relay.server_id);
    }

    let users = resolve(&args.users, "RELAY_USERS", "");
    let auth = if !users.is_empty() {
        AuthSource::Users(PathBuf::from(users))
    } else if args.open {
        AuthSource::Open
    } else {
        bail!("no user table configured: pass --users <file> or --open");
    };

    let log_dir = resolve(&args.log_dir, "RELAY_LOG_DIR", "");
    Ok(HubSettings {
        relay,
        auth,
        debug: args.debug || env_true("RELAY_DEBUG"),
        log_dir: (!log_dir.is_empty()).then(|| PathBuf::from(log_dir)),
    })
}

fn resolve(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_value(env_key).unwrap_or_else(|| default.to_string())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "relay-hub",
            "--bind",
            "0.0.0.0",
            "--port",
            "5000",
            "--idle-ms",
            "10",
            "--server-id",
            "relay-a",
            "--users",
            "/etc/relay/users.json",
        ]);
        let settings = settings_from_args(args).expect("settings");
        assert_eq!(settings.relay.addr(), "0.0.0.0:5000");
        assert_eq!(settings.relay.server_id, "relay-a");
        assert_eq!(settings.relay.idle_interval, Duration::from_millis(10));
        assert_eq!(settings.relay.wait_timeout, Duration::from_secs(1));
        assert_eq!(
            settings.auth,
            AuthSource::Users(PathBuf::from("/etc/relay/users.json"))
        );
    }

    #[test]
    fn open_mode_is_explicit() {
        let args = Args::parse_from(["relay-hub", "--port", "5001", "--open"]);
        let settings = settings_from_args(args).expect("settings");
        assert_eq!(settings.auth, AuthSource::Open);
    }

    #[test]
    fn server_id_with_line_break_is_rejected() {
        let args = Args::parse_from(["relay-hub", "--open", "--server-id", "relay\nShutdown"]);
        let err = settings_from_args(args).expect_err("line break");
        assert!(err.to_string().contains("line breaks"));

        let args = Args::parse_from(["relay-hub", "--open", "--server-id", "relay\r"]);
        assert!(settings_from_args(args).is_err());
    }
}
