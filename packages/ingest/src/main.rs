#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the water-main sync tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use watermain_database::db;
use watermain_database::memory::MemoryStore;
use watermain_database::postgis::PostgisStore;
use watermain_database::schema::{DEFAULT_SRID, DEFAULT_TABLE, TableSchema, ensure_table};
use watermain_database::store::FeatureStore;
use watermain_ingest::{SyncSettings, load_config, refresh_config, run_cycle};
use watermain_source::arcgis::{DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE, FetchSettings};
use watermain_source::client::HttpPageClient;
use watermain_source::config::{DatasetConfig, load_columns};
use watermain_source::normalize::NormalizeOptions;
use watermain_source_models::{
    ConflictScope, DEFAULT_OBJECT_ID_FIELD, MultiPathPolicy, water_main_columns,
};

const DEFAULT_INTERVAL_SECS: u64 = 3600;

#[derive(Parser)]
#[command(
    name = "watermain_ingest",
    about = "Sync municipal water-main layers from ArcGIS REST into PostGIS"
)]
struct Cli {
    #[command(flatten)]
    options: SyncOptions,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct SyncOptions {
    /// Dataset configuration: `{"<city>": {"<dataset>": "<query url>"}}`
    #[arg(long, global = true, default_value = "gis_rest_config.json")]
    config: PathBuf,
    /// JSON list of `{source, column, kind}` attribute mappings
    /// (defaults to the water-main field set)
    #[arg(long, global = true)]
    columns: Option<PathBuf>,
    /// Attribute holding the feature id
    #[arg(long, global = true, default_value = DEFAULT_OBJECT_ID_FIELD)]
    object_id_field: String,
    /// Destination table, optionally schema-qualified
    #[arg(long, global = true, default_value = DEFAULT_TABLE)]
    table: String,
    /// Spatial reference id of the geometry column
    #[arg(long, global = true, default_value_t = DEFAULT_SRID)]
    srid: i32,
    /// Features per page; must match `resultRecordCount` in the URLs
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_PAGE_SIZE,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    page_size: u32,
    /// Maximum page requests per dataset
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_MAX_PAGES,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    max_pages: u32,
    /// Timeout for each HTTP request, in seconds
    #[arg(long, global = true, default_value = "60")]
    request_timeout_secs: u64,
    /// Columns that identify a row
    #[arg(long, global = true, default_value_t = ConflictScope::default())]
    conflict_scope: ConflictScope,
    /// Handling of multi-part polylines
    #[arg(long, global = true, default_value_t = MultiPathPolicy::default())]
    multi_path: MultiPathPolicy,
    /// Write to an in-memory store instead of the database
    #[arg(long, global = true)]
    dry_run: bool,
    /// Database settings file: `{"database": {host, port, dbname, user, password}}`.
    /// Overrides `DATABASE_URL`.
    #[arg(long, global = true)]
    db_config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every configured dataset on a fixed interval (the default)
    Run {
        /// Seconds between the start of consecutive cycles
        #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
        interval_secs: u64,
    },
    /// Sync every configured dataset once and exit
    Once,
    /// List the configured datasets
    Datasets,
    /// Print the table DDL
    Schema {
        /// Execute the DDL against the database instead of printing it
        #[arg(long)]
        apply: bool,
    },
}

impl SyncOptions {
    fn table_schema(&self) -> Result<TableSchema, Box<dyn std::error::Error>> {
        let columns = match &self.columns {
            Some(path) => load_columns(path)?,
            None => water_main_columns(),
        };
        Ok(TableSchema::new(
            &self.table,
            self.srid,
            columns,
            self.conflict_scope,
        )?)
    }

    fn sync_settings(&self, schema: &TableSchema) -> SyncSettings {
        SyncSettings {
            fetch: FetchSettings {
                page_size: self.page_size,
                max_pages: self.max_pages,
            },
            normalize: NormalizeOptions {
                columns: schema.columns().to_vec(),
                object_id_field: self.object_id_field.clone(),
                multi_path: self.multi_path,
            },
        }
    }

    fn database_url(&self) -> Result<String, Box<dyn std::error::Error>> {
        let url = match &self.db_config {
            Some(path) => db::url_from_config_file(path)?,
            None => db::url_from_env(),
        };
        log::info!("Using database {}", db::redact_url(&url));
        Ok(url)
    }

    fn store(
        &self,
        schema: TableSchema,
    ) -> Result<Box<dyn FeatureStore>, Box<dyn std::error::Error>> {
        if self.dry_run {
            log::info!("Dry run: records are kept in memory and discarded on exit");
            return Ok(Box::new(MemoryStore::new(schema)));
        }
        Ok(Box::new(PostgisStore::new(self.database_url()?, schema)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let cli = Cli::parse();
    let options = cli.options;

    let command = cli.command.unwrap_or(Commands::Run {
        interval_secs: DEFAULT_INTERVAL_SECS,
    });

    match command {
        Commands::Datasets => {
            let config = load_config(&options.config, options.page_size)?;
            println!("{:<16} {:<20} URL", "CITY", "DATASET");
            println!("{}", "-".repeat(80));
            for endpoint in config.endpoints() {
                println!(
                    "{:<16} {:<20} {}",
                    endpoint.city, endpoint.dataset_type, endpoint.url
                );
            }
        }
        Commands::Schema { apply } => {
            let schema = options.table_schema()?;
            if apply {
                let db = db::connect(&options.database_url()?).await?;
                ensure_table(db.as_ref(), &schema).await?;
            } else {
                for statement in schema.create_table_sql() {
                    println!("{statement};\n");
                }
            }
        }
        Commands::Once => {
            let schema = options.table_schema()?;
            let settings = options.sync_settings(&schema);
            let config = load_config(&options.config, options.page_size)?;
            let store = options.store(schema)?;
            let client = HttpPageClient::new(Duration::from_secs(options.request_timeout_secs))?;

            let report = run_cycle(&client, store.as_ref(), &config, &settings).await;
            if report.failed() > 0 {
                log::warn!("{} dataset(s) failed", report.failed());
            }
        }
        Commands::Run { interval_secs } => {
            let schema = options.table_schema()?;
            let settings = options.sync_settings(&schema);
            let config = load_config(&options.config, options.page_size)?;
            let store = options.store(schema)?;
            let client = HttpPageClient::new(Duration::from_secs(options.request_timeout_secs))?;

            run_scheduled(
                &options.config,
                config,
                &client,
                store.as_ref(),
                &settings,
                Duration::from_secs(interval_secs.max(1)),
            )
            .await;
        }
    }

    Ok(())
}

/// Runs a cycle immediately and then once per `interval` until Ctrl-C.
///
/// A cycle in progress always runs to completion.
async fn run_scheduled(
    config_path: &Path,
    mut config: Arc<DatasetConfig>,
    client: &HttpPageClient,
    store: &dyn FeatureStore,
    settings: &SyncSettings,
    interval: Duration,
) {
    log::info!(
        "Scheduler started: syncing every {}s (Ctrl-C to stop)",
        interval.as_secs()
    );

    let mut shutdown = tokio::spawn(tokio::signal::ctrl_c());
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut first = true;
    loop {
        tokio::select! {
            biased;
            result = &mut shutdown => {
                match result {
                    Ok(Ok(())) => log::info!("Interrupted, stopping scheduler"),
                    Ok(Err(e)) => log::error!("Failed to listen for Ctrl-C, stopping: {e}"),
                    Err(e) => log::error!("Ctrl-C listener panicked, stopping: {e}"),
                }
                break;
            }
            _ = ticker.tick() => {}
        }

        if !first {
            config = refresh_config(config_path, settings.fetch.page_size, config);
        }
        first = false;

        run_cycle(client, store, &config, settings).await;
    }
}
