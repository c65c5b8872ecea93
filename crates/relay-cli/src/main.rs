use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_core::{ControlEvent, Event, RelayClient};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "Relay command line client", long_about = None)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    server: String,
    #[arg(long, default_value_t = 4150)]
    port: u16,
    #[arg(long)]
    user: String,
    /// Falls back to RELAY_CREDENTIAL.
    #[arg(long, env = "RELAY_CREDENTIAL", default_value = "")]
    credential: String,
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print events until the relay shuts down
    Listen {
        #[arg(required = true)]
        events: Vec<String>,
    },
    /// Publish one application event
    Emit { name: String, payload: Option<String> },
    /// Publish and wait for a single reply
    Request { name: String, payload: Option<String> },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let timeout = Duration::from_millis(cli.timeout_ms);
    let mut client = RelayClient::connect(&cli.server, cli.port, &cli.user, &cli.credential, timeout)
        .await
        .with_context(|| format!("failed to log in to {}:{}", cli.server, cli.port))?;
    debug!(event = "cli_connected", ticket = %client.ticket());

    match cli.command {
        Commands::Listen { events } => {
            for name in &events {
                client.add_event_listener(name, timeout).await?;
            }
            while let Some(event) = client.next_event().await? {
                println!("{}", render(&event)?);
                if event.control() == ControlEvent::Shutdown {
                    return Ok(());
                }
            }
        }
        Commands::Emit { name, payload } => {
            let payload = parse_payload(payload.as_deref());
            client.publish(&name, payload, timeout).await?;
            client.disconnect(timeout).await?;
        }
        Commands::Request { name, payload } => {
            let event = Event::new(name, client.ticket(), parse_payload(payload.as_deref()));
            let Some(reply) = client.dispatch(&event, timeout).await? else {
                bail!("no reply within {timeout:?}");
            };
            println!("{}", render(&reply)?);
            client.disconnect(timeout).await?;
        }
    }
    Ok(())
}

/// Arguments that are not valid JSON are sent as a JSON string.
fn parse_payload(raw: Option<&str>) -> Value {
    match raw {
        None => Value::Null,
        Some(text) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
    }
}

/// One JSON line: `{"name", "sender", "payload"}`.
fn render(event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_prefers_json_and_falls_back_to_text() {
        assert_eq!(parse_payload(None), Value::Null);
        assert_eq!(parse_payload(Some(r#"{"id":42}"#)), json!({"id": 42}));
        assert_eq!(parse_payload(Some("7")), json!(7));
        assert_eq!(parse_payload(Some("hello world")), json!("hello world"));
    }

    #[test]
    fn listen_requires_an_event() {
        assert!(Cli::try_parse_from(["relay-cli", "--user", "alice", "listen"]).is_err());
        let cli = Cli::try_parse_from(["relay-cli", "--user", "alice", "listen", "A", "B.C"])
            .expect("parse");
        assert!(matches!(cli.command, Commands::Listen { events } if events == ["A", "B.C"]));
    }

    #[test]
    fn render_prints_one_line_in_field_order() {
        let event = Event::new("Doc.Changed", "t-1", json!({"id": 1, "text": "a\nb"}));
        let line = render(&event).expect("render");
        assert_eq!(
            line,
            r#"{"name":"Doc.Changed","sender":"t-1","payload":{"id":1,"text":"a\nb"}}"#
        );
        assert!(!line.contains('\n'));
    }
}
