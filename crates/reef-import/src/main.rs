//! Reef Import - run and inspect import profiles

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reef_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use reef_import::{ImportPipeline, ImportProfile, PlainTextDecryptor, SourceRegistry};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "reef-import")]
#[command(author, version, about = "Import files and API data into databases")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a profile once
    Run {
        /// Profile file (TOML, JSON or YAML)
        profile: PathBuf,

        /// Parse, map and classify without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// List the files the profile's source would consume
    ListFiles { profile: PathBuf },

    /// Check that the source is reachable
    TestSource { profile: PathBuf },

    /// Check that the target is reachable
    TestTarget { profile: PathBuf },

    /// Print the target table's columns
    Schema { profile: PathBuf },
}

impl Command {
    fn profile_path(&self) -> &PathBuf {
        match self {
            Command::Run { profile, .. }
            | Command::ListFiles { profile }
            | Command::TestSource { profile }
            | Command::TestTarget { profile }
            | Command::Schema { profile } => profile,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let log_config = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::Console)
            .log_file_prefix("reef-import")
            .build()
    } else {
        // Environment variables take precedence
        LogConfig::from_env().unwrap_or_else(|_| {
            LogConfig::builder()
                .level(LogLevel::Info)
                .output(LogOutput::Console)
                .log_file_prefix("reef-import")
                .build()
        })
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {}", e);
            None
        },
    };

    reef_import::init();

    if let Err(e) = execute(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(command: Command) -> Result<()> {
    let path = command.profile_path();
    let profile = ImportProfile::load(path).with_context(|| format!("Failed to load profile {}", path.display()))?;
    let registry = SourceRegistry::new(Arc::new(PlainTextDecryptor));

    match command {
        Command::Run { dry_run, .. } => {
            let pipeline = ImportPipeline::from_profile(profile, &registry, &PlainTextDecryptor)
                .await?
                .dry_run(dry_run);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing the current batch");
                    on_signal.cancel();
                }
            });

            let summary = pipeline.run(cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.failed_rows() > 0 {
                warn!(failed = summary.failed_rows(), "Import finished with failed rows");
            }
        },
        Command::ListFiles { .. } => {
            let source = registry.for_config(&profile.source)?;
            for file in source.list_files(&profile.source).await? {
                let modified = file.last_modified.map(|t| t.to_rfc3339()).unwrap_or_default();
                let size = file.size.map(|s| s.to_string()).unwrap_or_default();
                println!("{}\t{}\t{}", file.identifier, size, modified);
            }
        },
        Command::TestSource { .. } => {
            let source = registry.for_config(&profile.source)?;
            let probe = source.test(&profile.source).await;
            report(probe.ok, &probe.message)?;
        },
        Command::TestTarget { .. } => {
            let target = reef_import::target::build_target(&profile.target, &PlainTextDecryptor).await?;
            let ctx = reef_import::ImportWriteContext::from_profile(&profile);
            let probe = target.test(&ctx).await;
            report(probe.ok, &probe.message)?;
        },
        Command::Schema { .. } => {
            let target = reef_import::target::build_target(&profile.target, &PlainTextDecryptor).await?;
            let ctx = reef_import::ImportWriteContext::from_profile(&profile);
            for column in target.get_table_schema(&ctx).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    column.name,
                    column.data_type,
                    if column.nullable { "NULL" } else { "NOT NULL" },
                    if column.is_primary_key { "PK" } else { "" }
                );
            }
        },
    }

    info!("Done");
    Ok(())
}

fn report(ok: bool, message: &str) -> Result<()> {
    if ok {
        println!("OK: {}", message);
        Ok(())
    } else {
        anyhow::bail!("{}", message)
    }
}
