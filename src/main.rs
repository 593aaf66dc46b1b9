use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::BufRead;
use std::sync::Arc;

use socket_dispatch::infrastructure::adapters::local::{LocalConnection, Outgoing};
use socket_dispatch::infrastructure::config::Config;
use socket_dispatch::{AckCallback, Context, ConnectionError, Payload, Registrations, Socket, SocketError};

#[derive(Parser)]
#[command(name = "socket-dispatch")]
#[command(about = "Per-connection event dispatch with middleware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch events typed on stdin through a local connection
    Run,
    /// Show version
    Version,
    /// Generate default config
    InitConfig,
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            run_console(cli.config);
        }
        Commands::Version => {
            println!("socket-dispatch v{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::InitConfig => {
            init_config();
        }
    }
}

fn load_config(path: &str) -> Config {
    if std::path::Path::new(path).exists() {
        Config::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            Config::load_env()
        })
    } else {
        Config::load_env()
    }
}

fn run_console(config_path: String) {
    let config = load_config(&config_path);
    tracing::info!("Starting {}", config.name);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            return;
        }
    };

    rt.block_on(run_console_loop(config_path, config));
}

fn upgrade(ctx: &Context) -> Result<Socket, SocketError> {
    ctx.socket
        .upgrade()
        .ok_or(SocketError::Connection(ConnectionError::Closed))
}

fn room_name(data: &Payload) -> Result<String, SocketError> {
    data.as_str()
        .map(str::to_string)
        .ok_or_else(|| SocketError::Handler("room name must be a string".to_string()))
}

/// Handlers available in console mode
fn console_handlers() -> Registrations {
    Registrations::new()
        .on_fn("echo", |ctx, data| async move {
            ctx.ack(data.clone());
            ctx.socket.emit("echo", data, None)?;
            Ok(())
        })
        .on_fn("join", |ctx, data| async move {
            let room = room_name(&data)?;
            let socket = upgrade(&ctx)?;
            socket.join(&room)?;
            socket.emit("joined", json!(room), None)?;
            Ok(())
        })
        .on_fn("leave", |ctx, data| async move {
            let room = room_name(&data)?;
            let socket = upgrade(&ctx)?;
            socket.leave(&room)?;
            socket.emit("left", json!(room), None)?;
            Ok(())
        })
        .on_fn("rooms", |ctx, _data| async move {
            let socket = upgrade(&ctx)?;
            socket.emit("rooms", json!(socket.rooms()), None)?;
            Ok(())
        })
        .on_fn("shout", |ctx, data| async move {
            upgrade(&ctx)?.broadcast().emit("shout", data, None)?;
            Ok(())
        })
        .on_fn("stamp", |ctx, _data| async move {
            let ts = ctx.get("ts").cloned().unwrap_or(Payload::Null);
            ctx.socket.emit("stamp", ts, None)?;
            Ok(())
        })
}

fn print_outgoing(out: &Outgoing) {
    let mut flags = Vec::new();
    if out.delivery.broadcast {
        flags.push("broadcast");
    }
    if out.delivery.volatile {
        flags.push("volatile");
    }
    if out.delivery.compress {
        flags.push("compress");
    }
    if flags.is_empty() {
        println!("[out] {} {}", out.event, out.payload);
    } else {
        println!("[out:{}] {} {}", flags.join(","), out.event, out.payload);
    }
}

async fn run_console_loop(config_path: String, config: Config) {
    let connection = LocalConnection::new();
    let registrations = console_handlers();
    let socket = Socket::new(connection.clone(), &registrations, config.middleware());

    println!("Connected as {}", socket.id());
    println!("Type `<event> [json]`, `:reload` or `:quit`");

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            ":quit" => break,
            ":reload" => {
                let config = load_config(&config_path);
                socket.update(&registrations, config.middleware());
                println!("Reloaded (v{})", socket.version());
                continue;
            }
            _ => {}
        }

        let (event, raw) = input.split_once(' ').unwrap_or((input, ""));
        let raw = raw.trim();
        let data = if raw.is_empty() {
            Payload::Null
        } else {
            // Bare words are sent as strings
            serde_json::from_str(raw).unwrap_or_else(|_| json!(raw))
        };

        if connection.listener_count_for(event) == 0 {
            println!("[warn] no handler for '{}'", event);
            continue;
        }

        let ack: AckCallback = Arc::new(|reply: Payload| println!("[ack] {}", reply));
        for result in connection.deliver(event, data, Some(ack)).await {
            if let Err(e) = result {
                println!("[error] {}", e);
            }
        }

        for out in connection.take_outbox() {
            print_outgoing(&out);
        }
    }

    if let Err(e) = socket.disconnect() {
        tracing::warn!("Disconnect failed: {}", e);
    }
}

fn init_config() {
    match Config::default().to_yaml() {
        Ok(yaml) => {
            println!("{}", yaml);
            println!("\nSave this to config.yaml and adjust as needed.");
        }
        Err(e) => tracing::error!("{}", e),
    }
}
