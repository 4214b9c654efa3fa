//! shellmux - many remote shells, one client
//!
//! **`shellmux connect <target>`**: opens an interactive session in the local
//! terminal. `Ctrl-]` leaves it.
//!
//! **`shellmux run`**: sends a script or command to several targets at once
//! and prints what each one answered.

use clap::{Args, Parser as ClapParser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shellmux::{
    config::{default_config_path, ClientConfig, ConfigError},
    controller::{ConnectOutcome, ControllerError},
    fanout::{Dispatch, FanoutJob, FanoutTarget},
    manager::{ManagerError, SessionManager},
    pty::PtyTransport,
    session::{SessionEvent, SessionId, SessionState},
    surface::{BufferSurfaces, TerminalSurface},
    target::{AuthKind, ConnectionTarget, Credentials, TargetBook, TargetError, TargetId, TargetStore},
    terminal::{self, RawModeGuard, StdoutSurface},
    transport::DeliveryMode,
};

/// shellmux - many remote shells, one client
#[derive(ClapParser, Debug)]
#[command(name = "shellmux", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to $XDG_CONFIG_HOME/shellmux/config.toml)
    #[arg(long, global = true, env = "SHELLMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Read output by polling instead of streaming
    #[arg(long, global = true)]
    poll: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured targets
    Targets,

    /// List available scripts
    Scripts,

    /// Open an interactive session
    Connect {
        /// Target id
        target: String,

        /// Save credentials entered at the prompt to the config file
        #[arg(long)]
        remember: bool,
    },

    /// Run a script or command on several targets
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Name of a built-in or configured script
    #[arg(long, conflicts_with = "command", required_unless_present = "command")]
    script: Option<String>,

    /// Command line to run
    #[arg(long)]
    command: Option<String>,

    /// Target id (repeatable)
    #[arg(long = "target", short = 't')]
    targets: Vec<String>,

    /// Run on every configured target
    #[arg(long, conflicts_with = "targets")]
    all: bool,

    /// Output is considered complete after this much silence
    #[arg(long, default_value_t = 1500)]
    quiet_ms: u64,

    /// Give up on a target after this long
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Error, Debug)]
pub enum ShellmuxError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("no config path; pass --config")]
    NoConfigPath,

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("unknown script: {0}")]
    UnknownScript(String),

    #[error("no targets given; use --target or --all")]
    NoTargets,
}

#[tokio::main]
async fn main() -> Result<(), ShellmuxError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().or_else(default_config_path);
    let mut config = match &config_path {
        Some(path) => ClientConfig::load(path)?.unwrap_or_default(),
        None => ClientConfig::default(),
    };
    if cli.poll {
        config.transport.delivery = DeliveryMode::Poll;
    }

    match cli.command {
        Commands::Targets => {
            print_targets(&config);
            Ok(())
        }
        Commands::Scripts => {
            for script in config.scripts().iter() {
                println!("{:<16} {}", script.name, script.description);
            }
            Ok(())
        }
        Commands::Connect { target, remember } => {
            run_connect(config, config_path.as_deref(), TargetId::new(target), remember).await
        }
        Commands::Run(args) => run_fanout(config, args).await,
    }
}

/// Tracing goes to stderr so it never mixes with session output.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shellmux=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_targets(config: &ClientConfig) {
    for target in &config.targets {
        let endpoint = match &target.command {
            Some(argv) => argv.join(" "),
            None => target.label(),
        };
        let auth = match target.auth {
            AuthKind::Password => "password",
            AuthKind::Key => "key",
            AuthKind::None => "none",
        };
        println!(
            "{:<16} {:<20} {:<9} {}",
            target.id.as_str(),
            target.display_name(),
            auth,
            endpoint
        );
    }
}

// ── Interactive session ────────────────────────────────────────────

async fn run_connect(
    config: ClientConfig,
    config_path: Option<&Path>,
    target_id: TargetId,
    remember: bool,
) -> Result<(), ShellmuxError> {
    let book = TargetBook::from_targets(config.targets.clone())?;
    let target = book
        .get(&target_id)
        .ok_or_else(|| TargetError::NotFound(target_id.clone()))?;

    let transport = Arc::new(PtyTransport::new(config.transport.clone()));
    let surface = StdoutSurface::new();
    let view = surface.clone();
    let manager = SessionManager::new(
        transport,
        Arc::new(book.clone()),
        Arc::new(move |_: SessionId, _: &ConnectionTarget| {
            view.clone() as Arc<dyn TerminalSurface>
        }),
        config.engine,
    );

    let mut events = manager.registry().subscribe_events();
    let id = manager.open(&target_id, None)?;

    if manager.on_session_created(id) == ConnectOutcome::AwaitingCredentials {
        let prompt = match target.auth {
            AuthKind::Key => format!("Key file for {}: ", target.label()),
            _ => format!("Password for {}: ", target.label()),
        };
        match terminal::prompt_secret(&prompt)? {
            Some(secret) => {
                let credentials = match target.auth {
                    AuthKind::Key => Credentials::key(secret),
                    _ => Credentials::password(secret),
                };
                manager.supply_credentials(id, credentials, remember)?;
                if remember {
                    save_targets(config, config_path, &book)?;
                }
            }
            None => {
                manager.cancel_credentials(id);
                manager.shutdown().await;
                return Ok(());
            }
        }
    }

    let raw = RawModeGuard::new()?;
    surface.start_input();

    loop {
        tokio::select! {
            _ = surface.detached() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { id: changed, to: SessionState::Disconnected, .. })
                    if changed == id => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.shutdown().await;
    drop(raw);
    eprintln!();
    Ok(())
}

fn save_targets(mut config: ClientConfig, path: Option<&Path>, book: &TargetBook) -> Result<(), ShellmuxError> {
    let path = path.ok_or(ShellmuxError::NoConfigPath)?;
    config.targets = book.list();
    config.save(path)?;
    tracing::info!(path = %path.display(), "credentials saved");
    Ok(())
}

// ── Fan-out ────────────────────────────────────────────────────────

async fn run_fanout(config: ClientConfig, args: RunArgs) -> Result<(), ShellmuxError> {
    let payload = match (&args.script, &args.command) {
        (Some(name), _) => config
            .scripts()
            .get(name)
            .map(|s| s.content.clone())
            .ok_or_else(|| ShellmuxError::UnknownScript(name.clone()))?,
        (None, Some(command)) => command.clone(),
        (None, None) => return Err(ShellmuxError::UnknownScript(String::new())),
    };

    let book = TargetBook::from_targets(config.targets.clone())?;
    let targets: Vec<TargetId> = if args.all {
        book.list().into_iter().map(|t| t.id).collect()
    } else {
        args.targets.iter().map(TargetId::new).collect()
    };
    if targets.is_empty() {
        return Err(ShellmuxError::NoTargets);
    }

    let transport = Arc::new(PtyTransport::new(config.transport.clone()));
    let surfaces = BufferSurfaces::new();
    let manager = SessionManager::new(
        transport,
        Arc::new(book),
        Arc::new(surfaces.clone()),
        config.engine,
    );

    let job = FanoutJob::new(payload).targets(targets.into_iter().map(FanoutTarget::Target));
    let dispatches = manager.run_script(job).await;

    let quiet = Duration::from_millis(args.quiet_ms);
    let timeout = Duration::from_secs(args.timeout_secs);
    let waits = dispatches.iter().filter_map(Dispatch::session).map(|id| {
        let manager = manager.clone();
        async move {
            let Some(session) = manager.registry().get(id) else {
                return;
            };
            if session.state() == SessionState::AwaitingCredentials {
                manager.cancel_credentials(id);
                return;
            }
            let _ = tokio::time::timeout(timeout, session.activity.wait_for_quiet(quiet)).await;
        }
    });
    futures::future::join_all(waits).await;

    for dispatch in &dispatches {
        match dispatch {
            Dispatch::Failed { target, reason } => eprintln!("==> {target:?}: {reason}"),
            Dispatch::Injected { session, .. } | Dispatch::Opened { session, .. } => {
                let Some(record) = manager.registry().get(*session) else {
                    continue;
                };
                println!("==> {} ({}) [{}] <==", record.title, record.target_id, record.state());
                if let Some(buffer) = surfaces.get(*session) {
                    println!("{}", buffer.contents());
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
