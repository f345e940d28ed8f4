use blockpad_common::telemetry::{self, TelemetryConfig};
use blockpad_common::{Config, FileStore};
use blockpad_sync::{
    AutosaveOptions, AutosaveSession, BlockId, BlockService, DocumentBuffer, DocumentId,
    HttpBlockClient, MeetingId, SaveStatus,
};
use miette::{IntoDiagnostic, Result, WrapErr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "blockpad - autosave local text into a block API", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to config file (.toml or .json)
    #[arg(long, global = true, env = "BLOCKPAD_CONFIG")]
    config: Option<PathBuf>,

    /// Print prometheus metrics before exiting
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Autosave a file as it changes
    Watch {
        /// File to watch
        file: PathBuf,

        #[command(flatten)]
        target: Target,

        /// How often to check the file for changes
        #[arg(long, default_value_t = 200)]
        poll_ms: u64,
    },
    /// Save a file once
    Push {
        /// File to save
        file: PathBuf,

        #[command(flatten)]
        target: Target,
    },
    /// Print a block's version and text
    Show {
        /// Block id, bare or as `block:<id>`
        id: String,
    },
    /// Print the effective configuration
    Config {
        /// Write a default config file instead
        #[arg(long)]
        init: bool,
    },
}

#[derive(Args)]
struct Target {
    /// Document id. `block:<id>` edits an existing block; anything else is a
    /// draft created on first save (default: derived from the file name)
    #[arg(long)]
    document: Option<String>,

    /// Meeting new blocks are created in (overrides config)
    #[arg(long)]
    meeting: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_miette();
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    telemetry::init(TelemetryConfig {
        metrics: cli.metrics,
        ..TelemetryConfig::from_env("blockpad")
    });

    let store = FileStore::new(cli.config.unwrap_or_else(default_config_path));

    match cli.command {
        Commands::Config { init } => config_command(&store, init).await?,
        Commands::Show { id } => {
            let config = load_config(&store).await?;
            show(&config, id).await?;
        }
        Commands::Push { file, target } => {
            let config = load_config(&store).await?;
            push(&config, file, target).await?;
        }
        Commands::Watch {
            file,
            target,
            poll_ms,
        } => {
            let config = load_config(&store).await?;
            watch(&config, file, target, Duration::from_millis(poll_ms.max(1))).await?;
        }
    }

    if cli.metrics {
        print!("{}", telemetry::render());
    }

    Ok(())
}

/// Config file if present, defaults otherwise, then environment overrides.
async fn load_config(store: &FileStore) -> Result<Config> {
    let config = if store.exists() {
        Config::load(store).await?
    } else {
        tracing::debug!(path = %store.path().display(), "no config file, using defaults");
        Config::default()
    };
    Ok(config.from_env_overlay()?)
}

async fn config_command(store: &FileStore, init: bool) -> Result<()> {
    if init {
        if store.exists() {
            return Err(miette::miette!(
                "Config file already exists: {}",
                store.path().display()
            ));
        }
        Config::default().save(store).await?;
        println!("✓ Wrote default config to {}", store.path().display());
        return Ok(());
    }

    let config = load_config(store).await?;
    let source = if store.exists() {
        store.path().display().to_string()
    } else {
        "defaults".to_owned()
    };
    println!("# {source}");
    println!("endpoint = {}", config.endpoint_url()?);
    match config.meeting {
        Some(meeting) => println!("meeting = {meeting}"),
        None => println!("meeting = (unset, drafts cannot be created)"),
    }
    println!("debounce_ms = {}", config.debounce_ms);
    println!("preview_throttle_ms = {}", config.preview_throttle_ms);
    match config.request_timeout_ms {
        Some(timeout) => println!("request_timeout_ms = {timeout}"),
        None => println!("request_timeout_ms = (transport default)"),
    }
    Ok(())
}

async fn show(config: &Config, id: String) -> Result<()> {
    let client = HttpBlockClient::from_config(config)?;
    let id = DocumentId::new(id.as_str())
        .existing_block()
        .unwrap_or_else(|| BlockId::new(id));

    let stored = client.get(&id).await?;
    println!("block {id} at version {}", stored.version);
    println!();
    println!("{}", stored.text);
    Ok(())
}

async fn push(config: &Config, file: PathBuf, target: Target) -> Result<()> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to read {}", file.display()))?;
    let session = open_session(config, &file, target)?;
    let draft = session.document().existing_block().is_none();

    println!("→ Saving {} ({} bytes)...", file.display(), text.len());
    session.content_changed(text);
    session.flush().await;

    let status = session.current_status();
    session.shutdown().await;
    if let SaveStatus::Saved(_) = status {
        print_status(&status);
    }
    match status {
        SaveStatus::Saved(block) => {
            if draft {
                println!("  Keep editing it with --document block:{}", block.id);
            }
            Ok(())
        }
        SaveStatus::Skipped(reason) => Err(miette::miette!(
            help = "pass --meeting or set BLOCKPAD_MEETING",
            "Nothing saved: {reason}"
        )),
        SaveStatus::Failed { message, .. } => Err(miette::miette!("Save failed: {message}")),
        SaveStatus::Idle | SaveStatus::Saving { .. } => {
            Err(miette::miette!("Save did not complete"))
        }
    }
}

async fn watch(config: &Config, file: PathBuf, target: Target, poll: Duration) -> Result<()> {
    let session = open_session(config, &file, target)?;
    let mut status = session.status();
    let mut buffer = DocumentBuffer::open(session).await?;

    // The file is the source of truth once it exists.
    match tokio::fs::read_to_string(&file).await {
        Ok(text) => {
            if text != buffer.content() {
                buffer.replace(text);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::write(&file, buffer.content())
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to create {}", file.display()))?;
            println!("✓ Created {} from the server copy", file.display());
        }
        Err(e) => {
            return Err(e)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to read {}", file.display()));
        }
    }

    println!("→ Watching {} (Ctrl-C to stop)", file.display());
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.into_diagnostic()?;
                break;
            }
            _ = ticker.tick() => match tokio::fs::read_to_string(&file).await {
                Ok(text) => {
                    if text != buffer.content() {
                        tracing::debug!(bytes = text.len(), "file changed");
                        buffer.replace(text);
                    }
                }
                Err(e) => tracing::warn!(file = %file.display(), error = %e, "failed to read file"),
            },
            Ok(()) = status.changed() => {
                let current = status.borrow_and_update().clone();
                print_status(&current);
            }
        }
    }

    println!("→ Flushing...");
    let content = buffer.close().await;
    let last = status.borrow().clone();
    print_status(&last);
    tracing::debug!(bytes = content.len(), "watch stopped");
    Ok(())
}

fn open_session(
    config: &Config,
    file: &Path,
    target: Target,
) -> Result<AutosaveSession<HttpBlockClient>> {
    let client = Arc::new(HttpBlockClient::from_config(config)?);
    let document = target
        .document
        .map(DocumentId::new)
        .unwrap_or_else(|| draft_for(file));
    let meeting = match target.meeting.or(config.meeting) {
        Some(raw) => Some(
            MeetingId::new(raw)
                .ok_or_else(|| miette::miette!("Meeting id must be positive, got {raw}"))?,
        ),
        None => None,
    };
    tracing::debug!(%document, meeting = ?meeting.map(MeetingId::get), "opening session");
    Ok(AutosaveSession::new(
        client,
        document,
        meeting,
        AutosaveOptions::from(config),
    ))
}

fn draft_for(file: &Path) -> DocumentId {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "untitled".to_owned());
    DocumentId::draft(&stem)
}

fn print_status(status: &SaveStatus) {
    match status {
        SaveStatus::Idle => {}
        SaveStatus::Saving { generation } => tracing::debug!(generation, "saving"),
        SaveStatus::Saved(block) => {
            let estimated = if block.estimated { " (estimated)" } else { "" };
            let retried = if block.retried { " after conflict" } else { "" };
            println!(
                "✓ Saved block {} at version {}{estimated}{retried}",
                block.id, block.version
            );
        }
        SaveStatus::Skipped(reason) => println!("⚠ Not saved: {reason}"),
        SaveStatus::Failed { message, .. } => {
            println!("✗ Save failed: {message} (will retry on next change)")
        }
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("blockpad").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("blockpad.toml"))
}

fn init_miette() {
    let hook = miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }));
    if let Err(e) = hook {
        eprintln!("couldn't set the miette hook: {e}");
    }
    miette::set_panic_hook();
}
