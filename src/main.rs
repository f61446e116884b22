use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use murmur_gateway::daemon::DATABASE_FILE;
use murmur_gateway::db::{self, SessionRepo};
use murmur_gateway::{Config, Daemon};

/// Murmur - real-time voice session gateway
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "MURMUR_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Data directory holding the session database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Print a persisted session as JSON
    Session {
        /// Session ID
        id: String,
    },
    /// Delete persisted sessions idle longer than the threshold
    PurgeExpired {
        /// Idle seconds before a session is purged (defaults to the session timeout)
        #[arg(long)]
        older_than: Option<u64>,
        /// List what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,murmur_gateway=info",
        1 => "info,murmur_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.data_dir {
        std::fs::create_dir_all(&dir)?;
        config.data_dir = dir;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(
                port = config.server.port,
                data_dir = %config.data_dir.display(),
                "starting murmur gateway"
            );
            Daemon::new(config)?.run().await?;
            Ok(())
        }
        Command::Session { id } => show_session(&config, &id),
        Command::PurgeExpired {
            older_than,
            dry_run,
        } => {
            let idle = older_than.map_or(config.session.timeout, Duration::from_secs);
            purge_expired(&config, idle, dry_run)
        }
        Command::Config => {
            print_config(&config);
            Ok(())
        }
    }
}

fn open_repo(config: &Config) -> anyhow::Result<SessionRepo> {
    let pool = db::init(config.data_dir.join(DATABASE_FILE))?;
    Ok(SessionRepo::new(pool))
}

fn show_session(config: &Config, id: &str) -> anyhow::Result<()> {
    let repo = open_repo(config)?;
    let session = repo
        .load(id)?
        .ok_or_else(|| anyhow::anyhow!("session {id} not found"))?;

    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

fn purge_expired(config: &Config, idle: Duration, dry_run: bool) -> anyhow::Result<()> {
    let repo = open_repo(config)?;
    let cutoff = chrono::Utc::now() - chrono::Duration::from_std(idle)?;
    let ids = repo.list_idle_since(cutoff)?;

    if dry_run {
        for id in &ids {
            println!("{id}");
        }
        println!("{} session(s) idle since {cutoff}", ids.len());
        return Ok(());
    }

    let mut removed = 0;
    for id in &ids {
        if repo.delete(id)? {
            removed += 1;
        }
    }

    tracing::info!(removed, cutoff = %cutoff, "purged idle sessions");
    println!("Purged {removed} session(s) idle since {cutoff}");
    Ok(())
}

fn print_config(config: &Config) {
    let key_state = |set: bool| if set { "set" } else { "not set" };

    println!("Data dir:        {}", config.data_dir.display());
    println!("Port:            {}", config.server.port);
    println!("API key:         {}", key_state(config.server.api_key.is_some()));
    println!("Rate limit:      {}/min", config.server.rate_limit_per_minute);
    println!(
        "Session:         timeout {}s, reap every {}s, {} turns, {} context chars",
        config.session.timeout.as_secs(),
        config.session.reap_interval.as_secs(),
        config.session.max_history,
        config.session.context_max_chars
    );
    println!(
        "VAD:             {} Hz, {} ms frames, trigger {} frames, {} ms silence, {} ms max",
        config.vad.sample_rate,
        config.vad.frame_ms,
        config.vad.trigger_voiced_frames,
        config.vad.end_silence_ms,
        config.vad.max_utterance_ms
    );
    println!(
        "STT:             {} at {} (key {})",
        config.stt.model,
        config.stt.base_url,
        key_state(config.stt.api_key.is_some())
    );
    println!(
        "LLM:             {} at {} (key {})",
        config.llm.model,
        config.llm.base_url,
        key_state(config.llm.api_key.is_some())
    );
    println!(
        "TTS:             {} voice {} at {} (key {})",
        config.tts.model,
        config.tts.voice,
        config.tts.base_url,
        key_state(config.tts.api_key.is_some())
    );
}
