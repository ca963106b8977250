use axon::capture::setup_capture;
use axon::config::AxonConfig;
use axon::pipeline::{connect, Axon};
use axon::shutdown::Shutdown;
use axon::verify::{verify, VerifyOptions};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "axon")]
#[command(about = "Trigger-based logical replication between PostgreSQL databases")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the replication daemon until SIGINT or SIGTERM
    Run,

    /// Install the capture schema and triggers on the source database
    SetupDb {
        /// Schema whose tables are tracked for replication
        #[arg(long, short = 'S', default_value = "public")]
        schema: String,

        /// Tables to exclude from replication setup
        #[arg(long, short = 'i', value_delimiter = ',')]
        ignore_tables: Vec<String>,
    },

    /// Compare source and target table checksums
    Verify {
        #[arg(long, value_delimiter = ',', default_value = "public")]
        schemas: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        include_tables: Vec<String>,

        #[arg(long, value_delimiter = ',')]
        exclude_tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    telemetry::init_tracing()?;

    let config = match AxonConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            eprintln!("\nRequired environment variables:");
            eprintln!("  AXON_SOURCE_DB_NAME  - source PostgreSQL database name");
            eprintln!("  AXON_TARGET_DB_NAME  - target PostgreSQL database name");
            eprintln!("\nSee the README for all available AXON_* options");
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Run => {
            config.require_source()?;
            config.require_target()?;
            run(config).await
        }
        Command::SetupDb {
            schema,
            ignore_tables,
        } => {
            config.require_source()?;
            setup_db(config, &schema, &ignore_tables).await
        }
        Command::Verify {
            schemas,
            include_tables,
            exclude_tables,
        } => {
            config.require_source()?;
            config.require_target()?;
            run_verify(
                config,
                VerifyOptions {
                    schemas,
                    include_tables,
                    exclude_tables,
                },
            )
            .await
        }
    }
}

async fn run(config: AxonConfig) -> anyhow::Result<()> {
    info!("starting axon v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();

    let signals = shutdown.clone();
    let signal_handle = tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }

        signals.fire();
    });

    let result = Axon::new(config).run(shutdown).await;

    signal_handle.abort();
    let _ = signal_handle.await;

    result?;
    Ok(())
}

async fn setup_db(config: AxonConfig, schema: &str, ignore_tables: &[String]) -> anyhow::Result<()> {
    let client = connect(
        "source",
        &config.source_pg_config(),
        config.connect_timeout(),
    )
    .await?;

    setup_capture(&client, schema, ignore_tables).await?;
    Ok(())
}

async fn run_verify(config: AxonConfig, options: VerifyOptions) -> anyhow::Result<()> {
    let source = connect(
        "source",
        &config.source_pg_config(),
        config.connect_timeout(),
    )
    .await?;
    let target = connect(
        "target",
        &config.target_pg_config(),
        config.connect_timeout(),
    )
    .await?;

    verify(&source, &target, &options).await?;
    info!("verification passed");
    Ok(())
}
