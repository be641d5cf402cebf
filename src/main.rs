//! # Shelfwise CLI (`shelf`)
//!
//! ## Usage
//!
//! ```bash
//! shelf --config ./config/shelf.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelf ask "<message>"` | Answer one message (`--trace` prints the dispatch trace) |
//! | `shelf chat` | Interactive conversation on stdin |
//! | `shelf serve` | Start the HTTP server |
//! | `shelf handlers` | List registered handlers |
//! | `shelf mirror sync` | Rebuild the mirror from its dump |
//! | `shelf mirror status` | Show mirror metadata |
//! | `shelf view refresh` | Recreate `app_inventory` on the active store |
//! | `shelf primary load <dump>` | Sanitise a dump and replay it into the primary |
//! | `shelf embed pending` | Embed products that have no vector yet |
//! | `shelf embed rebuild` | Re-embed every product |
//! | `shelf sanitize <in> [-o out]` | Sanitise a dump file (plain or gzip) |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shelfwise::app::AppContext;
use shelfwise::config::{load_config, Config};
use shelfwise::dump::{sanitize_stream, DumpReader};
use shelfwise::embed_cmd::{count_pending, format_report, index_products, IndexScope};
use shelfwise::server::run_server;
use shelfwise_core::models::{Request, Turn};
use shelfwise_core::sanitize::DumpSanitizer;
use shelfwise_core::store::refresh_inventory_view;

const DEFAULT_CONFIG: &str = "./config/shelf.toml";

/// Shelfwise: routing and primary/mirror data access for an inventory assistant.
#[derive(Parser)]
#[command(name = "shelf", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// When omitted, `./config/shelf.toml` is used if it exists, otherwise
    /// built-in defaults apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single message.
    Ask {
        message: String,

        /// Print the dispatch trace as JSON after the reply.
        #[arg(long)]
        trace: bool,
    },

    /// Interactive conversation; an empty line or EOF ends it.
    Chat,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// List registered handlers in tie-break order.
    Handlers,

    /// Mirror maintenance.
    Mirror {
        #[command(subcommand)]
        action: MirrorAction,
    },

    /// Derived view maintenance.
    View {
        #[command(subcommand)]
        action: ViewAction,
    },

    /// Primary maintenance.
    Primary {
        #[command(subcommand)]
        action: PrimaryAction,
    },

    /// Product embedding maintenance on the primary.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Strip environment and permission statements from a dump.
    Sanitize {
        input: PathBuf,

        /// Output file; stdout when omitted.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MirrorAction {
    /// Rebuild the mirror now.
    Sync {
        /// Rebuild even when the dump is unchanged.
        #[arg(long)]
        force: bool,

        /// Dump to use instead of `[mirror].dump_path`.
        #[arg(long)]
        dump: Option<PathBuf>,
    },
    /// Print mirror metadata as JSON.
    Status,
}

#[derive(Subcommand)]
enum ViewAction {
    /// Recreate `app_inventory` against the current columns.
    Refresh,
}

#[derive(Subcommand)]
enum PrimaryAction {
    /// Sanitise `dump` and replay it into the primary.
    Load { dump: PathBuf },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed products whose embedding is NULL.
    Pending {
        /// Embed at most this many products.
        #[arg(long)]
        limit: Option<usize>,

        /// Override `[embedding].batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only count the products that would be embedded.
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-embed every product.
    Rebuild {
        /// Override `[embedding].batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Sanitize { input, output } => {
            let sanitizer = DumpSanitizer::new(config.mirror.role_markers.clone());
            let read_err = || format!("Failed to sanitise dump: {}", input.display());
            match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    let report = sanitize_stream(&input, sanitizer, &mut file)
                        .await
                        .with_context(read_err)?;
                    eprintln!(
                        "{} lines read, {} dropped, {} role markers removed",
                        report.lines_read, report.lines_dropped, report.markers_removed
                    );
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    sanitize_stream(&input, sanitizer, &mut stdout)
                        .await
                        .with_context(read_err)?;
                }
            }
        }
        Commands::Ask { message, trace } => {
            let app = AppContext::build(config)?;
            let (result, dispatch_trace) = app.ask_with_trace(&Request::new(message)).await;
            let outcome = result.map(|reply| {
                println!("{}", reply.text);
                if reply.degraded {
                    eprintln!("(best effort from {}, quality {:.2})", reply.handler, reply.quality);
                }
            });
            if trace {
                println!("{}", serde_json::to_string_pretty(&dispatch_trace)?);
            }
            outcome?;
        }
        Commands::Chat => {
            let app = AppContext::build(config)?;
            run_chat(&app).await?;
        }
        Commands::Serve => {
            let app = Arc::new(AppContext::build(config)?);
            let shutdown = CancellationToken::new();
            let background = app.start_background(shutdown.clone()).await;

            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                    signal.cancel();
                }
            });

            run_server(Arc::clone(&app), shutdown.clone()).await?;
            shutdown.cancel();
            if let Some(handle) = background {
                if let Err(e) = handle.await {
                    warn!(error = %e, "auto-sync task failed");
                }
            }
        }
        Commands::Handlers => {
            let app = AppContext::build(config)?;
            for (i, handler) in app.dispatcher.registry().handlers().iter().enumerate() {
                println!("{}. {:<18} {}", i + 1, handler.name(), handler.description());
            }
        }
        Commands::Mirror { action } => {
            let app = AppContext::build(config)?;
            let Some(mirror) = app.mirror.as_ref() else {
                bail!("mirror is not enabled; set [mirror].enabled = true");
            };
            match action {
                MirrorAction::Sync { force, dump } => {
                    let synced = match dump {
                        Some(path) => mirror.sync_from(&path, force).await?,
                        None => mirror.sync(force).await?,
                    };
                    if !synced {
                        bail!("no dump available to build the mirror from");
                    }
                    println!("{}", serde_json::to_string_pretty(&mirror.state())?);
                }
                MirrorAction::Status => {
                    mirror.open().await;
                    println!("{}", serde_json::to_string_pretty(&mirror.state())?);
                }
            }
        }
        Commands::View {
            action: ViewAction::Refresh,
        } => {
            let app = AppContext::build(config)?;
            let source = app.refresh_view().await?;
            println!("app_inventory refreshed (store column from {:?})", source);
        }
        Commands::Primary {
            action: PrimaryAction::Load { dump },
        } => {
            let app = AppContext::build(config)?;
            let Some(primary) = app.primary.as_ref() else {
                bail!("no primary configured; set [primary].url or DATABASE_URL");
            };
            let sanitizer = DumpSanitizer::new(app.config.mirror.role_markers.clone());
            let mut reader = DumpReader::open(&dump, sanitizer)
                .await
                .with_context(|| format!("Failed to read dump: {}", dump.display()))?;
            let report = primary.load_dump(&mut reader).await?;
            let source = refresh_inventory_view(primary.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            println!("app_inventory refreshed (store column from {:?})", source);
        }
        Commands::Embed { action } => {
            let app = AppContext::build(config)?;
            let Some(primary) = app.primary.as_ref() else {
                bail!("no primary configured; set [primary].url or DATABASE_URL");
            };
            let default_batch = app.config.embedding.batch_size;
            match action {
                EmbedAction::Pending {
                    limit,
                    batch_size,
                    dry_run,
                } => {
                    if dry_run {
                        let pending = count_pending(primary.as_ref(), limit).await?;
                        println!("embed pending (dry-run)\n  products needing embeddings: {}", pending);
                    } else {
                        let report = index_products(
                            primary.as_ref(),
                            app.embedder.as_ref(),
                            batch_size.unwrap_or(default_batch),
                            IndexScope::Pending,
                            limit,
                        )
                        .await?;
                        println!("{}", format_report("embed pending", &report));
                    }
                }
                EmbedAction::Rebuild { batch_size } => {
                    let report = index_products(
                        primary.as_ref(),
                        app.embedder.as_ref(),
                        batch_size.unwrap_or(default_batch),
                        IndexScope::All,
                        None,
                    )
                    .await?;
                    println!("{}", format_report("embed rebuild", &report));
                }
            }
        }
    }

    Ok(())
}

async fn run_chat(app: &AppContext) -> Result<()> {
    let stdin = std::io::stdin();
    let mut history: Vec<Turn> = Vec::new();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            break;
        }

        let request = Request::with_history(text, history.clone());
        match app.ask(&request).await {
            Ok(reply) => {
                println!("{}\n", reply.text);
                history.push(Turn::user(text));
                history.push(Turn::assistant(reply.text));
            }
            Err(e) => eprintln!("error: {}\n", e),
        }
    }

    Ok(())
}
