//! relay-console: run the relay against stdin/stdout.
//!
//! Usage:
//!   relay-console [--config <path>] [--echo]
//!
//! Each stdin line `sender: text` is submitted as one fragment. Lines starting
//! with `/` are operator commands (see `/help`). Replies are printed to
//! stdout; logs go to stderr.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chat_relay::client::{ModelParams, Provider};
use chat_relay::plugins::{BuiltinPlugin, HookEngine, Statistics};
use chat_relay::relay::ChatTransport;
use chat_relay::{Message, MessageRole, RelayBuilder, RelayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

struct StdoutTransport;

#[async_trait]
impl ChatTransport for StdoutTransport {
    async fn send_text(&self, sender_id: &str, text: &str) -> chat_relay::Result<()> {
        println!("[{}] {}", sender_id, text);
        Ok(())
    }
}

/// Replies with the last user message, for running without a provider key.
struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(
        &self,
        messages: &[Message],
        _params: &ModelParams,
        _timeout: Duration,
    ) -> chat_relay::Result<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(format!("echo: {}", last))
    }
}

struct Args {
    config: Option<PathBuf>,
    echo: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        echo: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let path = it.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--echo" => args.echo = true,
            "help" | "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn print_usage() {
    println!(
        r#"relay-console: run the chat relay on stdin/stdout

USAGE:
    relay-console [--config <path>] [--echo]

OPTIONS:
    --config <path>     YAML config file (RELAY_* env vars override it)
    --echo              Use a local echo provider instead of the HTTP provider

INPUT:
    <sender>: <text>    Submit a fragment for <sender>
    /stats              Print relay stats as JSON
    /cache-clear        Empty the response cache
    /enable <plugin>    Enable a plugin
    /disable <plugin>   Disable a plugin
    /plugins            List plugins
    /flush <sender>     Flush a sender's buffer now
    /quit               Exit

ENVIRONMENT:
    RUST_LOG            Log filter (default chat_relay=info)
    OPENROUTER_API_KEY  Provider key when not stored in the OS keyring"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    }
    .apply_env()?;

    let hooks = Arc::new(HookEngine::new());
    let stats = Arc::new(Statistics::default());
    hooks.register_plugin(Arc::new(BuiltinPlugin::fast_auto_reply()))?;
    hooks.register_plugin(Arc::new(BuiltinPlugin::sentiment()))?;
    hooks.register_plugin(Arc::new(BuiltinPlugin::command_detector()))?;
    hooks.register_plugin(Arc::new(BuiltinPlugin::statistics(stats.clone())))?;

    let mut builder = RelayBuilder::new()
        .with_config(config)
        .with_hooks(hooks.clone())
        .with_transport(Arc::new(StdoutTransport));
    if args.echo {
        builder = builder.with_provider(Arc::new(EchoProvider));
    }
    let (mut relay, mut failures) = builder.build()?;

    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            eprintln!(
                "! gave up on message from {} after {} attempts: {}",
                failure.unit.sender_id, failure.unit.retry_count, failure.error
            );
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.splitn(2, ' ');
            let name = parts.next().unwrap_or_default();
            let arg = parts.next().map(str::trim).unwrap_or_default();
            match name {
                "quit" | "exit" => break,
                "stats" => {
                    let mut snapshot = serde_json::to_value(relay.stats())?;
                    snapshot["processed"] = serde_json::json!(stats.processed());
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                }
                "cache-clear" => println!("removed {} entries", relay.cache().clear()),
                "enable" | "disable" => match hooks.set_enabled(arg, name == "enable") {
                    Ok(()) => println!("{} {}d", arg, name),
                    Err(err) => eprintln!("! {}", err),
                },
                "plugins" => {
                    for p in hooks.list_plugins() {
                        let state = if p.enabled { "on" } else { "off" };
                        println!("{:<20} {:<8} {:<4} {}", p.name, p.version, state, p.description);
                    }
                }
                "flush" => {
                    if !relay.flush_now(arg) {
                        eprintln!("! nothing buffered for {}", arg);
                    }
                }
                "help" => print_usage(),
                other => eprintln!("! unknown command /{}", other),
            }
            continue;
        }

        match line.split_once(':') {
            Some((sender, text)) if !sender.trim().is_empty() && !text.trim().is_empty() => {
                if let Err(err) = relay.submit(sender.trim(), text.trim()) {
                    eprintln!("! {}", err);
                }
            }
            _ => eprintln!("! expected `sender: text`"),
        }
    }

    relay.shutdown();
    Ok(())
}
