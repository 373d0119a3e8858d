use std::path::PathBuf;

use anyhow::{Context, bail};
use backwards_invoke::config::{InstallMethod, RuntimeConfig};
use backwards_invoke::session::InboundReceiver;
use backwards_invoke::{BackwardsInvocation, HttpInvoker, Session, StorageInvocation, logging, transport};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "plugin_runtime",
    about = "Plugin-side runtime for backwards invocation",
    version
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// `.env` file to seed the environment from
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Log filter override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Write daily rolling logs here instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the daemon and serve until the session closes
    Run,

    /// One storage call against the daemon (remote or serverless installs)
    Storage(StorageArgs),
}

#[derive(Args, Debug)]
struct StorageArgs {
    /// Plugin session id to act for
    #[arg(long)]
    session_id: Option<String>,

    #[command(subcommand)]
    op: StorageOp,
}

#[derive(Subcommand, Debug)]
enum StorageOp {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    Exists { key: String },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.common)?;
    logging::init(&config.log);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Storage(args) => storage(config, args).await,
    }
}

fn load_config(args: &CommonArgs) -> anyhow::Result<RuntimeConfig> {
    let mut config = RuntimeConfig::load(args.env_file.as_deref()).context("invalid configuration")?;
    if let Some(level) = &args.log_level {
        config.log.level = level.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.log.dir = Some(dir.clone());
    }
    Ok(config)
}

async fn connect(config: &RuntimeConfig) -> anyhow::Result<(Session, InboundReceiver)> {
    let transport = transport::open(config)
        .await
        .context("could not open transport to plugin daemon")?;
    info!(peer = transport.peer(), method = %config.install_method, "transport open");
    let (reader, writer) = transport.into_split();
    Ok(Session::start(reader, writer, config.session_config()))
}

async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    let (session, mut inbound) = connect(&config).await?;
    info!(max_worker = config.max_worker, "plugin runtime started");

    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    info!(session_id = ?frame.session_id, "daemon request received");
                }
                None => break,
            },
            reason = session.closed() => {
                info!(%reason, "session closed, exiting");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, closing session");
                session.close();
                break;
            }
        }
    }
    Ok(())
}

async fn storage(config: RuntimeConfig, args: StorageArgs) -> anyhow::Result<()> {
    let (store, session) = match config.install_method {
        // stdout is the protocol channel for local installs
        InstallMethod::Local => bail!("the storage command needs INSTALL_METHOD=remote or serverless"),
        InstallMethod::Remote => {
            let (session, inbound) = connect(&config).await?;
            // nothing serves daemon requests during a one-shot call
            drop(inbound);
            let store = StorageInvocation::new(session.clone(), args.session_id);
            (store, Some(session))
        }
        InstallMethod::Serverless => {
            let invoker = HttpInvoker::from_config(&config).context("invalid plugin daemon url")?;
            info!(url = %invoker.endpoint(), "using serverless backwards invocation");
            let store = StorageInvocation::with_invocation(BackwardsInvocation::serverless(invoker, args.session_id));
            (store, None)
        }
    };

    let outcome = match args.op {
        StorageOp::Get { key } => store
            .get(&key)
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        StorageOp::Set { key, value } => store.set(&key, value.as_bytes()).await.map(|()| "ok".to_owned()),
        StorageOp::Delete { key } => store.delete(&key).await.map(|()| "ok".to_owned()),
        StorageOp::Exists { key } => store.exists(&key).await.map(|found| found.to_string()),
    };
    if let Some(session) = session {
        session.close();
    }

    match outcome {
        Ok(text) => {
            println!("{text}");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "storage call failed");
            Err(e.into())
        }
    }
}
