use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use config::Config;
use registry::StatsRegistry;
use store::{LoadMode, UpdateOutcome};

mod aggregate;
mod config;
mod conversation;
mod entity;
mod extract;
mod logging;
mod registry;
mod report;
mod source;
mod store;
mod transcript;
mod types;
mod watcher;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "chatstats")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    opts: GlobalOpts,
}

#[derive(Args)]
struct GlobalOpts {
    /// User whose chats to read (defaults to storage.default_user)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Use comma-separated number formatting
    #[arg(long, global = true)]
    number_comma: bool,

    /// Use human-readable number formatting (k, m, b, t)
    #[arg(short = 'H', long, global = true)]
    number_human: bool,

    /// Locale for number formatting (en, de, fr, es, it, ja, ko, zh)
    #[arg(long, global = true)]
    locale: Option<String>,

    /// Number of decimal places for human-readable formatting
    #[arg(long, global = true)]
    decimal_places: Option<usize>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show stats for everything, one character, or one chat
    Stats(StatsArgs),
    /// Re-read one chat and fold it into the stats
    Update {
        /// Character (entity) key
        entity: String,
        /// Chat name, without the .jsonl extension
        chat: String,
    },
    /// Recompute stats from the transcripts
    Rebuild {
        /// Only rebuild this character
        #[arg(long)]
        entity: Option<String>,
    },
    /// Follow chat changes and keep the stats current
    Watch,
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct StatsArgs {
    /// Character (entity) key
    #[arg(long)]
    entity: Option<String>,

    /// Chat name within --entity
    #[arg(long, requires = "entity")]
    chat: Option<String>,

    /// Output JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Pretty-print JSON instead of a single line
    #[arg(long, default_value_t = false)]
    pretty: bool,

    /// Include retained samples and per-message data in the JSON output
    #[arg(long, default_value_t = false)]
    include_messages: bool,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key (data-root, default-user, flush-debounce, clamp-negative-response-time, number-comma, number-human, locale, decimal-places)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.opts.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// What every stats command needs: configuration, formatting and the
/// registry of the selected user.
struct Session {
    config: Config,
    format_options: report::NumberFormatOptions,
    user: String,
    registry: StatsRegistry,
}

impl Session {
    fn open(opts: GlobalOpts) -> Result<Self> {
        let config = Config::load_or_default()?;

        // CLI flags override the configured formatting
        let mut format_options = report::NumberFormatOptions::from(&config.formatting);
        format_options.use_comma |= opts.number_comma;
        format_options.use_human |= opts.number_human;
        if let Some(locale) = opts.locale {
            format_options.locale = locale;
        }
        if let Some(places) = opts.decimal_places {
            format_options.decimal_places = places;
        }
        let user = opts
            .user
            .unwrap_or_else(|| config.storage.default_user.clone());
        let registry = StatsRegistry::new(&config.storage.data_root, config.aggregator());

        Ok(Self {
            config,
            format_options,
            user,
            registry,
        })
    }
}

async fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Commands::Config(config_args) => return handle_config_subcommand(config_args),
        command => command,
    };
    let session = Session::open(cli.opts)?;
    let (registry, user) = (&session.registry, session.user.as_str());

    match command {
        Commands::Stats(args) => run_stats(registry, user, args, &session.format_options).await?,
        Commands::Update { entity, chat } => {
            let stats = registry.user(user).await?;
            let outcome = stats.update(&entity, &chat).await?;
            let message = match outcome {
                UpdateOutcome::Updated => "updated",
                UpdateOutcome::Unchanged => "unchanged",
                UpdateOutcome::Retracted => "removed (transcript missing or empty)",
                UpdateOutcome::Untracked => "no transcript found",
            };
            println!("{entity}/{chat}: {message}");
        }
        Commands::Rebuild { entity } => run_rebuild(registry, user, entity).await?,
        Commands::Watch => {
            println!(
                "Watching {} (Ctrl+C to stop)",
                registry.chats_root(user).display()
            );
            watcher::run(registry, user, session.config.flush_interval(), async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Commands::Config(config_args) => return handle_config_subcommand(config_args),
    }

    registry.flush_all().await;
    Ok(())
}

async fn run_stats(
    registry: &StatsRegistry,
    user: &str,
    args: StatsArgs,
    format_options: &report::NumberFormatOptions,
) -> Result<()> {
    let stats = registry.user(user).await?;
    let view = stats
        .get(args.entity.as_deref(), args.chat.as_deref())
        .with_context(|| match (&args.entity, &args.chat) {
            (Some(entity), Some(chat)) => format!("No chat {chat:?} for {entity:?}"),
            (Some(entity), None) => format!("No stats for {entity:?}"),
            _ => "No stats".to_string(),
        })?;

    if args.json || args.pretty {
        let view = if args.include_messages {
            view
        } else {
            report::without_detail(&view)
        };
        println!("{}", report::to_json(&view, args.pretty)?);
    } else {
        print!("{}", report::render_view(&view, format_options));
    }

    Ok(())
}

async fn run_rebuild(registry: &StatsRegistry, user: &str, entity: Option<String>) -> Result<()> {
    let stats = registry.user_with(user, LoadMode::Deferred).await?;

    // Stats that could not be loaded need every entity, not just one
    let entity = match entity {
        Some(_) if stats.is_stale().await => None,
        entity => entity,
    };

    let report = match entity {
        Some(entity) => stats.rebuild_entity(&entity).await?,
        None => {
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&cancel);
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    flag.store(true, Ordering::Relaxed);
                }
            });
            let report = stats.rebuild_all(&cancel).await;
            ctrl_c.abort();
            report?
        }
    };

    println!(
        "Rebuilt {} characters, {} chats",
        report.entities, report.conversations
    );
    for (entity, chat) in &report.failed {
        println!("  failed to read {entity}/{chat}");
    }
    for entity in &report.failed_entities {
        println!("  failed to list chats of {entity}");
    }
    if report.cancelled {
        println!("Cancelled before all characters were rebuilt");
    }
    Ok(())
}

fn handle_config_subcommand(config_args: ConfigArgs) -> Result<()> {
    match config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            config::create_default_config(overwrite).context("Error creating config")
        }
        ConfigSubcommands::Show => config::show_config().context("Error showing config"),
        ConfigSubcommands::Set { key, value } => {
            config::set_config_value(&key, &value).context("Error setting config")
        }
    }
}
