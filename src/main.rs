//! ergbook
//!
//! Command-line entry point: runs the PM5 bridge and the database
//! maintenance commands around it.

use clap::{Parser, Subcommand};
use ergbook::{
    config::{generate_default_config, Config},
    logbook::{Alerter, LogbookApi},
    types::mask,
    watchdog::{EXIT_CANNOT_STORE, EXIT_USAGE},
    BtleplugTransport, Central, ErgbookError, LogbookClient, Migrator, OperatorContext, Store,
    Syncer, UserCredential, WebhookAlerter,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ergbook")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Upload Concept2 PM5 workouts to the Concept2 Logbook")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: /etc/ergbook/config.toml, then ./ergbook.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge the rower to the Logbook until the session ends (default)
    Run,

    /// Upgrade stored records to the current shape
    Migrate {
        /// Run one sync pass afterwards
        #[arg(long)]
        resubmit: bool,
    },

    /// Print users and workouts
    Dump,

    /// Register or update a Logbook user
    AddUser {
        /// User identifier
        #[arg(long)]
        uuid: String,
        /// OAuth access token
        #[arg(long)]
        access: String,
        /// OAuth refresh token
        #[arg(long)]
        refresh: String,
    },

    /// Exchange a user's refresh token now
    Refresh {
        /// User identifier
        #[arg(long)]
        uuid: String,
    },

    /// Print the Logbook authorization URL
    AuthUrl,

    /// Create the database file and its directories
    Init,

    /// Print a default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Failure carrying the process exit code
struct Exit {
    code: u8,
    error: ErgbookError,
}

impl Exit {
    fn new(code: i32, error: ErgbookError) -> Self {
        Self {
            code: u8::try_from(code).unwrap_or(1),
            error,
        }
    }
}

impl From<ErgbookError> for Exit {
    fn from(error: ErgbookError) -> Self {
        let code = match &error {
            ErgbookError::LivenessTimeout(condition) => condition.exit_code(),
            _ => 1,
        };
        Self::new(code, error)
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ergbook={}", config.logging.level)));
    let json = config.logging.format.eq_ignore_ascii_case("json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, Exit> {
    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path).map_err(|e| Exit::new(EXIT_USAGE, e))?,
        None => Config::load_default(),
    };
    if let Some(db) = &cli.db {
        config.store.path.clone_from(db);
    }
    Ok(config)
}

fn open_store(config: &Config) -> Result<Store, Exit> {
    Store::open(&config.store.path).map_err(|e| Exit::new(EXIT_CANNOT_STORE, e))
}

fn logbook_client(config: &Config) -> Result<Arc<LogbookClient>, Exit> {
    Ok(Arc::new(LogbookClient::new(config.logbook.settings())?))
}

fn syncer(config: &Config, store: Store) -> Result<Syncer, Exit> {
    let api: Arc<dyn LogbookApi> = logbook_client(config)?;
    let alerter = config
        .logbook
        .alert_webhook_url
        .as_ref()
        .map(|url| Arc::new(WebhookAlerter::new(url.as_str())) as Arc<dyn Alerter>);
    Ok(Syncer::new(store, api, alerter, config.logbook.sync_settings()))
}

async fn run(config: &Config) -> Result<(), Exit> {
    tracing::info!("ergbook v{}", env!("CARGO_PKG_VERSION"));

    let store = open_store(config)?;
    let operator = OperatorContext::new(config.operator.default_uuid.as_str());
    if let Some(uuid) = &config.operator.current_uuid {
        if let Err(e) = operator.select(&store, uuid).await {
            tracing::warn!(uuid = %uuid, error = %e, "cannot select configured operator");
        }
    }

    let sync = Arc::new(syncer(config, store.clone())?).start();

    let transport = Arc::new(BtleplugTransport::new().await?);
    let central = Central::new(
        transport,
        store,
        operator,
        config.device.matcher(),
        config.watchdog.to_watchdog_config(),
    )?;

    let result = tokio::select! {
        result = central.run() => result.map(|outcome| {
            tracing::info!(
                address = %outcome.address,
                messages = outcome.messages,
                "session finished"
            );
        }),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    if let Ok(stats) = central.stats().await {
        if let Ok(json) = serde_json::to_string(&stats) {
            tracing::info!(stats = %json, "final stats");
        }
    }

    // a fatal condition must reach the exit code without waiting on the network
    if result.is_ok() {
        sync.shutdown().await;
    } else {
        sync.abort().await;
    }
    result.map_err(Exit::from)
}

async fn migrate(config: &Config, resubmit: bool) -> Result<(), Exit> {
    let store = open_store(config)?;
    let report = Migrator::new(store.clone(), &config.operator.default_uuid).migrate()?;
    println!(
        "examined {}, updated {}, skipped {}",
        report.examined, report.updated, report.skipped
    );

    if resubmit {
        let report = syncer(config, store)?.sync_once().await?;
        let json = serde_json::to_string_pretty(&report).map_err(ErgbookError::from)?;
        println!("{json}");
    }
    Ok(())
}

fn dump(config: &Config) -> Result<(), Exit> {
    let store = open_store(config)?;

    println!("Users:");
    for user in store.get_all_users()? {
        println!(
            "  {} access={} refresh={}",
            user.uuid,
            mask(&user.access_token),
            mask(&user.refresh_token)
        );
    }

    println!("\nWorkouts:");
    for record in store.get_all_workouts()? {
        let sent = record
            .sent_at
            .map_or_else(|| "pending".to_string(), |at| format!("sent {at}"));
        let payload = match record.decode() {
            Ok(workout) => {
                serde_json::to_string(&workout.to_payload()).map_err(ErgbookError::from)?
            }
            Err(e) => format!("undecodable: {e}"),
        };
        println!("  #{} user={} {sent} {payload}", record.id, record.user_uuid);
    }

    let stats = store.stats()?;
    println!(
        "\n{} workouts, {} pending, {} users",
        stats.workouts, stats.pending, stats.users
    );
    Ok(())
}

fn add_user(config: &Config, uuid: String, access: String, refresh: String) -> Result<(), Exit> {
    let user = UserCredential::new(uuid, access, refresh);
    user.validate().map_err(|e| Exit::new(EXIT_USAGE, e))?;

    let store = open_store(config)?;
    store
        .upsert_user(&user)
        .map_err(|e| Exit::new(EXIT_CANNOT_STORE, e))?;
    println!("stored user {}", user.uuid);
    Ok(())
}

async fn refresh(config: &Config, uuid: &str) -> Result<(), Exit> {
    let store = open_store(config)?;
    let mut user = store.get_user(uuid)?;

    let tokens = logbook_client(config)?.refresh_token(&user).await?;
    user.access_token = tokens.access_token;
    user.refresh_token = tokens.refresh_token;
    store
        .upsert_user(&user)
        .map_err(|e| Exit::new(EXIT_CANNOT_STORE, e))?;
    println!("refreshed {user:?}");
    Ok(())
}

fn write_default_config(output: Option<PathBuf>) -> Result<(), Exit> {
    let content = generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(&path, content).map_err(ErgbookError::from)?;
            println!("wrote {}", path.display());
        }
        None => print!("{content}"),
    }
    Ok(())
}

async fn execute(cli: Cli) -> Result<(), Exit> {
    let config = load_config(&cli)?;
    let command = cli.command.unwrap_or(Commands::Run);

    // the config command must not log around the file it prints
    if let Commands::Config { output } = command {
        return write_default_config(output);
    }
    init_logging(&config);

    match command {
        Commands::Run => run(&config).await,
        Commands::Migrate { resubmit } => migrate(&config, resubmit).await,
        Commands::Dump => dump(&config),
        Commands::AddUser {
            uuid,
            access,
            refresh: refresh_token,
        } => add_user(&config, uuid, access, refresh_token),
        Commands::Refresh { uuid } => refresh(&config, &uuid).await,
        Commands::AuthUrl => {
            println!("{}", logbook_client(&config)?.auth_url()?);
            Ok(())
        }
        Commands::Init => {
            open_store(&config)?;
            println!("initialized {}", config.store.path.display());
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(u8::try_from(EXIT_USAGE).unwrap_or(2))
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(exit) => {
            tracing::error!(error = %exit.error, code = exit.code, "exiting");
            eprintln!("error: {}", exit.error);
            ExitCode::from(exit.code)
        }
    }
}
