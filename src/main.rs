use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};
use upctl::config::{Config, CONFIG_ENV};
use upctl::worker::from_config;
use upctl::{ConnectionState, OperationalState, StatusUpdate, UploadController};

#[derive(Parser, Debug)]
#[command(name = "upctl")]
#[command(about = "Control and monitor a background upload worker", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/upctl/config.toml)
    #[arg(long, env = CONFIG_ENV, global = true)]
    config: Option<PathBuf>,

    /// Upload endpoint, host[:port]. Overrides the config file.
    #[arg(long, env = "UPCTL_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Worker executable to spawn. Overrides the config file.
    #[arg(long, global = true, conflicts_with = "worker_address")]
    worker: Option<PathBuf>,

    /// Address of an already running worker. Overrides the config file.
    #[arg(long, global = true)]
    worker_address: Option<String>,

    /// Verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show live status until interrupted
    Watch {
        /// Print one JSON object per update instead of progress bars
        #[arg(long)]
        json: bool,
    },
    /// Pause uploading
    Pause,
    /// Resume uploading
    Resume,
    /// Pause when working, resume when paused
    Toggle,
    /// Stop everything the worker is doing
    Stop,
    /// Enqueue all eligible local content
    UploadAll,
    /// Hand files to the worker for upload
    Share {
        #[arg(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "upctl=info",
        1 => "upctl=debug",
        _ => "upctl=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 0)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_default().context("Failed to load config")?,
    };

    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = Some(endpoint.clone());
    }
    if let Some(address) = &cli.worker_address {
        config.worker.address = Some(address.clone());
        config.worker.program = None;
    }
    if let Some(program) = &cli.worker {
        config.worker.program = Some(program.clone());
        config.worker.address = None;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let transport = from_config(&config.worker).context("No worker to talk to")?;
    tracing::debug!("Using {}", transport.describe());

    let controller = UploadController::new(&config, transport);

    let result = match &cli.command {
        Commands::Watch { json } => watch(&controller, *json).await,
        command => one_shot(&controller, &config, command).await,
    };

    controller.shutdown().await;
    result
}

/// Connect, issue one call, disconnect.
async fn one_shot(
    controller: &UploadController,
    config: &Config,
    command: &Commands,
) -> Result<()> {
    if !config.is_configured() {
        bail!("No valid upload endpoint configured (set `endpoint` or pass --endpoint)");
    }

    let mut updates = controller.watch();
    controller.start().await;
    let wait = config.bind_timeout() + config.call_timeout();
    let connected = tokio::time::timeout(wait, async {
        loop {
            if updates.changed().await.is_err() {
                return false;
            }
            let connection = updates.borrow().connection;
            match connection {
                ConnectionState::Connected => return true,
                ConnectionState::Disconnected => return false,
                ConnectionState::Connecting => {}
            }
        }
    })
    .await;
    if !matches!(connected, Ok(true)) {
        bail!("Could not connect to the upload worker");
    }

    match command {
        Commands::Pause => controller.pause(),
        Commands::Resume => controller.resume(),
        Commands::Toggle => {
            // The worker pushes its uploading flag right after registration.
            let known = tokio::time::timeout(config.call_timeout(), async {
                updates.wait_for(|update| update.status_known).await.is_ok()
            })
            .await;
            if !matches!(known, Ok(true)) {
                bail!("Worker has not reported its status yet");
            }
            controller.toggle();
        }
        Commands::Stop => controller.stop_everything(),
        Commands::UploadAll => controller.trigger_upload_all(),
        Commands::Share { paths } => {
            let paths = paths
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p)
                        .with_context(|| format!("Cannot share {}", p.display()))
                })
                .collect::<Result<Vec<_>>>()?;
            controller.share(paths);
        }
        Commands::Watch { .. } => unreachable!("handled by watch()"),
    }

    if let Some(update) = controller.settled().await {
        println!("{}", render_state(&update));
    }
    controller.stop().await;
    Ok(())
}

async fn watch(controller: &UploadController, json: bool) -> Result<()> {
    let mut updates = controller.watch();
    controller.start().await;

    let display = if json { None } else { Some(StatusDisplay::new()) };

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let update = updates.borrow_and_update().clone();
                match &display {
                    Some(display) => display.render(&update),
                    None => println!("{}", serde_json::to_string(&update)?),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    if let Some(display) = display {
        display.finish();
    }
    controller.stop().await;
    Ok(())
}

struct StatusDisplay {
    _multi: MultiProgress,
    state: ProgressBar,
    files: ProgressBar,
    bytes: ProgressBar,
}

impl StatusDisplay {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let state = multi.add(ProgressBar::new_spinner());
        state.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        let bar_style = ProgressStyle::default_bar()
            .template("{prefix:>6} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");

        let files = multi.add(ProgressBar::new(0));
        files.set_style(bar_style.clone());
        files.set_prefix("files");

        let bytes = multi.add(ProgressBar::new(0));
        bytes.set_style(bar_style);
        bytes.set_prefix("KiB");

        Self {
            _multi: multi,
            state,
            files,
            bytes,
        }
    }

    fn render(&self, update: &StatusUpdate) {
        self.state.set_message(render_state(update));
        if update.state.is_working() {
            self.state.enable_steady_tick(Duration::from_millis(120));
        } else {
            self.state.disable_steady_tick();
        }

        let files = update.progress.files;
        self.files.set_length(u64::from(files.total));
        self.files.set_position(u64::from(files.done));
        self.files.set_message(update.progress.remaining_text());

        let scaled = update.progress.bytes.scaled();
        self.bytes.set_length(scaled.max.max(0) as u64);
        self.bytes.set_position(scaled.progress.max(0) as u64);
        self.bytes.set_message(format!(
            "(+{} KiB in flight)",
            scaled.secondary - scaled.progress
        ));
    }

    fn finish(&self) {
        self.state.finish();
        self.files.abandon();
        self.bytes.abandon();
    }
}

fn render_state(update: &StatusUpdate) -> String {
    if !update.configured {
        return format!("{}", "Not configured.".yellow());
    }

    let label = match update.state {
        OperationalState::Idle => update.state.label().normal(),
        OperationalState::Digesting => update.state.label().cyan(),
        OperationalState::Uploading => update.state.label().green(),
        OperationalState::Paused => update.state.label().yellow(),
        OperationalState::Finished => update.state.label().bold(),
    };
    let connection = match update.connection {
        ConnectionState::Connected => "connected".green(),
        ConnectionState::Connecting => "connecting".yellow(),
        ConnectionState::Disconnected => "disconnected".red(),
    };

    let mut line = format!("{} [{}]", label, connection);
    if !update.status_text.is_empty() {
        line.push_str(&format!(" {}", update.status_text));
    }
    if !update.stats_text.is_empty() {
        line.push_str(&format!(" {}", update.stats_text.dimmed()));
    }
    line
}
