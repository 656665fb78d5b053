//! zwire CLI - listen to a session's realtime events, or exercise the
//! request-signing primitives from the shell.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use zwire::params::{sign_key, ParamsEncryptor};
use zwire::{Config, Listener, ListenerEvents};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "zwire")]
#[command(version)]
#[command(about = "Realtime socket client for a private IM wire protocol")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print decoded events until Ctrl-C
    Listen {
        /// Config file (defaults to <config dir>/zwire/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Also print events sent from this account
        #[arg(long)]
        self_listen: bool,
        /// Stop after the first disconnect instead of retrying
        #[arg(long)]
        no_retry: bool,
    },
    /// Print the signkey for a parameter set
    Sign {
        /// Call type prefix (e.g. "getlastmsgs")
        #[arg(long = "type")]
        call_type: String,
        /// Parameters as key=value
        params: Vec<String>,
    },
    /// Print a device identifier token and a freshly derived request key
    Zcid {
        /// Device IMEI
        #[arg(long)]
        imei: String,
        /// API type
        #[arg(long, default_value_t = 30)]
        api_type: u32,
        /// First launch time in milliseconds (defaults to now)
        #[arg(long)]
        launch_time: Option<i64>,
    },
}

fn parse_pair(pair: &str) -> Result<(String, String)> {
    let (key, value) = pair
        .split_once('=')
        .with_context(|| format!("expected key=value, got '{pair}'"))?;
    Ok((key.to_string(), value.to_string()))
}

async fn print_events(events: &ListenerEvents) {
    loop {
        tokio::select! {
            Some(connected) = events.connected.recv() => {
                println!("connected: {}", connected.endpoint);
            }
            Some(info) = events.disconnected.recv() => {
                println!("disconnected: {info}");
            }
            Some(message) = events.message.recv() => {
                println!(
                    "[{:?} {}] {}: {}",
                    message.thread_type, message.thread_id, message.data.d_name, message.data.content
                );
            }
            Some(undo) = events.undo.recv() => {
                println!("[{:?} {}] recalled {}", undo.thread_type, undo.thread_id, undo.undo.global_msg_id);
            }
            Some(old) = events.old_messages.recv() => {
                println!("{} old {:?} messages", old.messages.len(), old.thread_type);
            }
            Some(_key) = events.cipher_key.recv() => {
                println!("cipher key received");
            }
            Some(err) = events.error.recv() => {
                eprintln!("error: {err}");
            }
            Some(info) = events.closed.recv() => {
                println!("closed: {info}");
                return;
            }
            else => return,
        }
    }
}

async fn listen(config: Option<PathBuf>, self_listen: bool, no_retry: bool) -> Result<()> {
    let mut config = Config::load(config.as_deref())?;
    config.self_listen |= self_listen;
    let session = config.into_session()?;

    let listener = Listener::new(session);
    let token = CancellationToken::new();
    listener
        .start(token.clone(), !no_retry)
        .await
        .context("Failed to start listener")?;

    tokio::select! {
        () = print_events(listener.events()) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            log::info!("Ctrl-C received, stopping");
        }
    }
    listener.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen {
            config,
            self_listen,
            no_retry,
        } => listen(config, self_listen, no_retry).await?,
        Commands::Sign { call_type, params } => {
            let pairs = params
                .iter()
                .map(String::as_str)
                .map(parse_pair)
                .collect::<Result<Vec<_>>>()?;
            println!("{}", sign_key(&call_type, pairs));
        }
        Commands::Zcid {
            imei,
            api_type,
            launch_time,
        } => {
            let launch_time =
                launch_time.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
            let encryptor = ParamsEncryptor::new(api_type, &imei, launch_time)?;
            println!("zcid:     {}", encryptor.zcid());
            println!("zcid_ext: {}", encryptor.zcid_ext());
            println!("key:      {}", encryptor.encrypt_key());
        }
    }

    Ok(())
}
