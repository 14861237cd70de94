mod commands;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use miette::Result;
use roster_auth::RosterConfig;
use tracing::info;

use commands::AccountSelector;

#[derive(Parser)]
#[command(name = "roster")]
#[command(about = "Roster credential store and token lifecycle")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the legacy migration if needed and report the outcome
    ///
    /// Exits non-zero if the migration failed.
    Migrate,
    /// Show the migration ledger
    Ledger,
    /// Account management
    Accounts {
        #[command(subcommand)]
        cmd: AccountCommands,
    },
    /// Access token commands
    Token {
        #[command(subcommand)]
        cmd: TokenCommands,
    },
    /// Legacy registry commands
    Legacy {
        #[command(subcommand)]
        cmd: LegacyCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// List active accounts
    List,
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Show whether an account has a valid token
    Status {
        #[command(flatten)]
        account: AccountSelector,
    },
    /// Refresh an account's token now
    Refresh {
        #[command(flatten)]
        account: AccountSelector,
    },
}

#[derive(Subcommand)]
enum LegacyCommands {
    /// Check the legacy registry's indexes for consistency
    Verify,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .rgb_colors(miette::RgbColors::Preferred)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))?;
    miette::set_panic_hook();
    let cli = Cli::parse();

    use tracing_appender::rolling;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roster")
        .join("logs");
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = rolling::daily(&log_dir, "roster.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = if cli.debug {
        EnvFilter::new("roster_auth=debug,roster=debug,sqlx=warn,info")
    } else {
        EnvFilter::new("roster_auth=info,roster=info,sqlx=warn,warn")
    };

    let terminal_layer = if cli.debug {
        fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .pretty()
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .compact()
            .boxed()
    };

    // Secrets never reach the logs, so the file can stay at debug.
    let file_env_filter = EnvFilter::new("roster_auth=debug,roster=debug,sqlx=warn,info");
    let file_layer = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(terminal_layer.with_filter(env_filter))
        .with(file_layer.with_filter(file_env_filter))
        .init();

    info!(
        "Logging initialized. Logs are being written to: {:?}",
        log_dir.join("roster.log")
    );

    let mut config = if let Some(config_path) = &cli.config {
        info!("Loading config from: {:?}", config_path);
        RosterConfig::load(config_path).await?
    } else {
        info!("Loading config from standard locations");
        RosterConfig::load_from_standard_locations().await?
    };
    config.apply_env();
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    let ctx = roster_auth::initialize(config).await?;

    let ok = match &cli.command {
        Commands::Migrate => commands::migrate::report(&ctx),
        Commands::Ledger => {
            commands::migrate::ledger(&ctx).await?;
            true
        }
        Commands::Accounts { cmd } => match cmd {
            AccountCommands::List => {
                commands::accounts::list(&ctx).await?;
                true
            }
        },
        Commands::Token { cmd } => match cmd {
            TokenCommands::Status { account } => commands::token::status(&ctx, account).await?,
            TokenCommands::Refresh { account } => commands::token::refresh(&ctx, account).await?,
        },
        Commands::Legacy { cmd } => match cmd {
            LegacyCommands::Verify => commands::legacy::verify(&ctx),
        },
    };

    ctx.close().await;

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
