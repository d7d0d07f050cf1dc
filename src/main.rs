use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use git_version::git_version;
use slog::*;
use sqlx::migrate::Migrate;
use structopt::StructOpt;

mod catalog;
mod compiler;
mod core;
mod devices;
mod feedback;
mod observe;
mod parser;
mod shaper;
mod store;

#[derive(Debug, StructOpt)]
#[structopt(name = "drover", about = "A small-scale intent-based network controller.")]
struct Opt {
    /// The path of the configuration file.
    #[structopt(short = "c", long = "config", default_value = "/etc/drover/config.yml")]
    config: std::path::PathBuf,

    /// Run pending schema migrations against the local database
    #[structopt(long = "db-upgrade")]
    migrate: bool,

    /// The path of the directory containing database migration files.
    #[structopt(
        long = "db-migration-directory",
        default_value = "/usr/share/drover/migrations"
    )]
    migration_directory: std::path::PathBuf,

    /// Validate and record enforcement commands without executing them.
    #[structopt(long = "dry-run")]
    dry_run: bool,

    /// Show debug log information
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

mod config {
    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Version {
        pub version: Option<i16>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1 {
        pub interface: String,
        #[serde(default = "default_interface_rate")]
        pub interface_rate_bps: u64,
        pub db_path: String,
        pub device_registry: std::path::PathBuf,
        pub grammar: std::path::PathBuf,
        pub policy_templates: std::path::PathBuf,
        pub mqtt: V1Mqtt,
        #[serde(with = "humantime_serde", default = "default_feedback_interval")]
        pub feedback_interval: std::time::Duration,
        #[serde(default = "default_tolerance")]
        pub tolerance_pct: f64,
        #[serde(with = "humantime_serde", default = "default_retention")]
        pub metric_retention: std::time::Duration,
        #[serde(with = "humantime_serde", default = "default_ack_window")]
        pub ack_window: std::time::Duration,
        #[serde(default = "default_observe_listen")]
        pub observe_listen: String,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1Mqtt {
        pub broker: String,
        #[serde(default = "default_mqtt_port")]
        pub port: u16,
        #[serde(default = "default_client_id")]
        pub client_id: String,
        #[serde(default = "default_status_topic")]
        pub status_topic: String,
    }

    fn default_interface_rate() -> u64 {
        100_000_000
    }
    fn default_feedback_interval() -> std::time::Duration {
        std::time::Duration::from_secs(15)
    }
    fn default_tolerance() -> f64 {
        10.0
    }
    fn default_retention() -> std::time::Duration {
        std::time::Duration::from_secs(24 * 60 * 60)
    }
    fn default_ack_window() -> std::time::Duration {
        std::time::Duration::from_secs(5)
    }
    fn default_observe_listen() -> String {
        "127.0.0.1:9343".to_owned()
    }
    fn default_mqtt_port() -> u16 {
        1883
    }
    fn default_client_id() -> String {
        "drover".to_owned()
    }
    fn default_status_topic() -> String {
        "drover/status/#".to_owned()
    }

    // An internal configuration structure used by the rest of the program
    // that can be updated without breaking compatibility with existing
    // configuration files.
    #[derive(Debug)]
    pub struct Internal {
        pub interface: String,
        pub interface_rate_bps: u64,
        pub db_path: String,
        pub catalog_paths: crate::catalog::CatalogPaths,
        pub mqtt_broker: String,
        pub mqtt_port: u16,
        pub mqtt_client_id: String,
        pub status_topic: String,
        pub feedback_interval: std::time::Duration,
        pub tolerance: f64,
        pub metric_retention: std::time::Duration,
        pub ack_window: std::time::Duration,
        pub observe_listen: std::net::SocketAddr,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Find and store build version information
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    // Parse input arguments
    let opt = Opt::from_args();

    // Setup slog terminal logging
    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();

    let mut log_level = Level::Info;
    if opt.verbose {
        log_level = Level::Debug;
    }

    let drain = slog::LevelFilter::new(drain, log_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let root_log = slog::Logger::root(
        drain.fuse(),
        slog::o!("build" => GIT_VERSION,
        "pkg-version" => env!("CARGO_PKG_VERSION"),
        ),
    );

    slog::info!(root_log, "Arguments {:?}", opt);

    // Read the configuration file
    let config_string = std::fs::read_to_string(&opt.config)
        .with_context(|| format!("Failed to read config file {}", opt.config.display()))?;
    let parsed_config_version: config::Version =
        serde_yaml::from_str(&config_string).context("Failed to extract version from config file")?;
    slog::debug!(
        root_log,
        "Parsed the config version {:?}",
        parsed_config_version
    );
    let config_version = parsed_config_version.version.unwrap_or(1);

    let config = match config_version {
        1 => {
            let parsed_config: config::V1 =
                serde_yaml::from_str(&config_string).context("Failed to parse config")?;
            slog::debug!(root_log, "Parsed config {:?}", parsed_config);
            config::Internal {
                interface: parsed_config.interface,
                interface_rate_bps: parsed_config.interface_rate_bps,
                db_path: parsed_config.db_path,
                catalog_paths: catalog::CatalogPaths {
                    devices: parsed_config.device_registry,
                    grammar: parsed_config.grammar,
                    templates: parsed_config.policy_templates,
                },
                mqtt_broker: parsed_config.mqtt.broker,
                mqtt_port: parsed_config.mqtt.port,
                mqtt_client_id: parsed_config.mqtt.client_id,
                status_topic: parsed_config.mqtt.status_topic,
                feedback_interval: parsed_config.feedback_interval,
                tolerance: parsed_config.tolerance_pct / 100.0,
                metric_retention: parsed_config.metric_retention,
                ack_window: parsed_config.ack_window,
                observe_listen: std::net::SocketAddr::from_str(&parsed_config.observe_listen)
                    .context("Failed to parse observeListen address")?,
            }
        }
        _ => {
            slog::error!(
                root_log,
                "Unsupported configuration version '{}' specified",
                config_version
            );
            anyhow::bail!("Unsupported configuration version specified");
        }
    };

    // Open backing storage
    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let db_pool = sqlx::sqlite::SqlitePoolOptions::new().connect_with(connect_options);
    let db_pool = tokio::time::timeout(std::time::Duration::from_secs(5), db_pool)
        .await
        .context("DB connection timed out")?
        .context("Failed to open the state database")?;
    slog::info!(root_log, "Opened state database"; "path" => &config.db_path);

    let mut migrator = sqlx::migrate::Migrator::new(opt.migration_directory)
        .await
        .context("Unable to read available database schema migrations")?;

    // If requested, run any necessary database migrations
    if opt.migrate {
        slog::warn!(
            root_log,
            "Running database migrations, this process can not be easily undone!"
        );
        migrator.set_ignore_missing(true);
        migrator
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;
        slog::info!(root_log, "Migrations complete, exiting drover.");

        return Ok(());
    }

    // Refuse to serve unless the schema is exactly what this build expects.
    let available_migrations: HashSet<_> = migrator.iter().map(|x| x.version).collect();
    let applied_migrations: HashSet<_> = db_pool
        .acquire()
        .await
        .context("Unable to acquire DB connection")?
        .list_applied_migrations()
        .await
        .context("Unable to query the applied DB schema migrations")?
        .iter()
        .map(|x| x.version)
        .collect();

    if available_migrations != applied_migrations {
        slog::error!(
            root_log,
            "There is a difference between the expected set of DB schema migrations for this version of drover \
            and the migrations applied to the configured database."
        );
        let unapplied_migrations: HashSet<_> = available_migrations
            .difference(&applied_migrations)
            .collect();
        let extra_migrations: HashSet<_> = applied_migrations
            .difference(&available_migrations)
            .collect();

        if !unapplied_migrations.is_empty() {
            slog::error!(
                root_log,
                "The following migrations are expected by this version of drover, but not applied to the local database";
                "unapplied_migrations" => format!("{:?}", unapplied_migrations)
            );
            if extra_migrations.is_empty() {
                slog::error!(
                    root_log,
                    "You can upgrade your database schema to be compatible with this version of drover by manually running `drover --db-upgrade`"
                );
                slog::error!(
                    root_log,
                    "***BE SURE TO BACK UP YOUR DATABASE BEFORE UPGRADING*** The upgrade operation cannot be easily undone."
                );
            }
        }

        if !extra_migrations.is_empty() {
            slog::error!(
                root_log,
                "The following migrations are present in your database but unknown to this version of drover!\n\
                This cannot be fixed automatically, and you may need to re-create your database from scratch :/";
                "extra_migrations" => format!("{:?}", extra_migrations)
            );
        }
        anyhow::bail!("Cannot proceed without correcting the database schema.");
    }

    let store = Arc::new(store::Store::new(
        db_pool,
        root_log.new(o!("subsystem" => "store")),
    ));

    let catalog = Arc::new(
        catalog::Catalog::load(
            config.catalog_paths,
            root_log.new(o!("subsystem" => "catalog")),
        )
        .context("Failed to load the catalog")?,
    );

    // Reload the catalog on SIGHUP without restarting enforcement.
    {
        let catalog = Arc::clone(&catalog);
        let log = root_log.new(o!("subsystem" => "catalog"));
        tokio::task::spawn(async move {
            let mut hups =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(hups) => hups,
                    Err(e) => {
                        slog::error!(log, "unable to install SIGHUP handler"; "error" => e.to_string());
                        return;
                    }
                };
            while hups.recv().await.is_some() {
                match catalog.reload() {
                    Ok(()) => slog::info!(log, "catalog reloaded on SIGHUP"),
                    Err(e) => {
                        slog::error!(log, "catalog reload failed, keeping previous snapshot";
                            "error" => e.to_string())
                    }
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let observe = observe::Observe::new();

    // Connect the control bus and lower its callbacks onto bounded queues.
    let mut mqtt_options = rumqttc::MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_broker.clone(),
        config.mqtt_port,
    );
    mqtt_options.set_keep_alive(std::time::Duration::from_secs(30));
    let (mqtt_client, event_loop) = rumqttc::AsyncClient::new(mqtt_options, 64);

    let transport = Arc::new(devices::MqttTransport::new(mqtt_client.clone()));
    let transport_connected = Arc::new(AtomicBool::new(false));
    let (telemetry_tx, _) = tokio::sync::broadcast::channel(256);
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(256);

    devices::spawn_event_pump(
        mqtt_client,
        event_loop,
        Arc::clone(&catalog),
        config.status_topic.clone(),
        inbound_tx,
        Arc::clone(&transport_connected),
        shutdown_rx.clone(),
        root_log.new(o!("subsystem" => "transport")),
    );

    let core_config = core::CoreConfig {
        interface: config.interface.clone(),
        interface_rate_bps: config.interface_rate_bps,
        shaper_mode: if opt.dry_run {
            shaper::ShaperMode::Dry
        } else {
            shaper::ShaperMode::Tc
        },
        device: devices::DeviceEnforcerConfig {
            ack_window: config.ack_window,
            ..devices::DeviceEnforcerConfig::default()
        },
        feedback: feedback::FeedbackConfig {
            interval: config.feedback_interval,
            tolerance: config.tolerance,
            metric_retention: config.metric_retention,
            ..feedback::FeedbackConfig::default()
        },
        ..core::CoreConfig::default()
    };

    let core = core::Core::start(
        Arc::clone(&store),
        Arc::clone(&catalog),
        transport,
        telemetry_tx.clone(),
        transport_connected,
        core_config,
        Arc::clone(&observe),
        shutdown_rx.clone(),
        root_log.new(o!("subsystem" => "core")),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to start controller core: {}", e))?;

    devices::spawn_inbound_router(
        inbound_rx,
        Arc::clone(&store),
        telemetry_tx,
        core.devices.input_channel(),
        shutdown_rx.clone(),
        root_log.new(o!("subsystem" => "ingest")),
    );

    observe::spawn_exposition(
        config.observe_listen,
        Arc::clone(&observe),
        core.health_state(),
        shutdown_rx,
        root_log.new(o!("subsystem" => "observe")),
    );

    // The submission interface (the external HTTP surface) is handed the
    // core's request channel; nothing else in this process accepts intents.
    let _submission_handle = core.request_channel();

    slog::info!(root_log, "drover is serving";
        "interface" => &config.interface, "broker" => &config.mqtt_broker);

    // Graceful shutdown: stop intake, let workers drain, then exit. Applied
    // policies stay in place and the next start reconciles against them.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Unable to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            slog::info!(root_log, "received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            slog::info!(root_log, "received SIGTERM, shutting down");
        }
    }

    shutdown_tx.send(true).ok();
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    slog::info!(root_log, "drain deadline reached, exiting");
    Ok(())
}
