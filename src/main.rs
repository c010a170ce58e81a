// ========================================
// main.rs - rowtrail administration CLI
// ========================================

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;

use rowtrail::{
    logger, BindOutcome, BindingSpec, CaptureConfig, CaptureFilter, Database, DatabaseLocation,
    Operation, Page, Result,
};

/// Row-level change capture for SQLite.
#[derive(Parser)]
#[command(name = "rowtrail", version, about = "Row-level change capture for SQLite", long_about = None)]
struct Cli {
    /// Database file, or `:memory:`. Overrides ROWTRAIL_DATABASE.
    #[arg(short, long, global = true)]
    database: Option<String>,

    /// Print JSON instead of aligned text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capturing a table.
    Bind {
        table: String,

        /// Integer primary key column recorded as record_id.
        identity: String,

        /// Skip updates that leave the row unchanged.
        #[arg(long)]
        changed_only: bool,
    },

    /// Stop capturing a table. Captured entries are kept.
    Unbind { table: String },

    /// List bound tables.
    Bindings,

    /// List every table and whether it is bound.
    Coverage,

    /// Regenerate triggers for tables whose columns changed.
    Refresh,

    /// Show captured entries, most recent first.
    Log {
        #[arg(short, long)]
        table: Option<String>,

        /// INSERT, UPDATE or DELETE.
        #[arg(short, long)]
        operation: Option<String>,

        #[arg(short, long)]
        record: Option<i64>,

        #[arg(long)]
        actor: Option<String>,

        #[arg(short, long, default_value_t = Page::DEFAULT_LIMIT)]
        limit: u32,
    },

    /// Every entry for one row, oldest first.
    History { table: String, record_id: i64 },

    /// Entry counts per table and operation.
    Summary,

    /// Write matching entries to a gzip-compressed JSON Lines file.
    Export {
        file: PathBuf,

        #[arg(short, long)]
        table: Option<String>,
    },

    /// Foreign key check, trigger refresh, and stale and unbound tables.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    logger::init("info");
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = CaptureConfig::from_env()?;
    if let Some(raw) = &cli.database {
        config.database = DatabaseLocation::parse(raw);
    }

    let db = Database::connect(&config).await?;
    let result = dispatch(&db, cli.command, cli.json).await;
    db.close().await;
    result
}

async fn dispatch(db: &Database, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Bind { table, identity, changed_only } => {
            let mut spec = BindingSpec::new(table, identity);
            if changed_only {
                spec = spec.changed_only();
            }
            match db.bind(&spec).await? {
                BindOutcome::Bound => println!("bound {}", spec.table_name),
                BindOutcome::AlreadyBound => println!("{} is already bound", spec.table_name),
            }
        }

        Commands::Unbind { table } => {
            if db.unbind(&table).await? {
                println!("unbound {}", table);
            } else {
                println!("{} was not bound", table);
            }
        }

        Commands::Bindings => {
            let bindings = db.bindings().await?;
            if json {
                print_json(&bindings)?;
            } else {
                let rows = bindings
                    .iter()
                    .map(|b| {
                        vec![
                            b.table_name.clone(),
                            b.identity_column.clone(),
                            b.mode.to_string(),
                            b.columns.len().to_string(),
                            b.bound_at.to_rfc3339(),
                        ]
                    })
                    .collect::<Vec<_>>();
                print_table(&["TABLE", "IDENTITY", "MODE", "COLUMNS", "BOUND AT"], &rows);
            }
        }

        Commands::Coverage => {
            let coverage = db.coverage().await?;
            if json {
                print_json(&coverage)?;
            } else {
                let rows = coverage
                    .iter()
                    .map(|c| {
                        vec![
                            c.table_name.clone(),
                            c.identity_column.clone().unwrap_or_else(|| "-".into()),
                            if c.is_bound() { "bound" } else { "NOT CAPTURED" }.to_string(),
                        ]
                    })
                    .collect::<Vec<_>>();
                print_table(&["TABLE", "IDENTITY", "STATUS"], &rows);
            }
        }

        Commands::Refresh => {
            let report = db.refresh_bindings().await?;
            if json {
                print_json(&report)?;
            } else {
                println!("refreshed: {}", list_or_none(&report.refreshed));
                println!("stale:     {}", list_or_none(&report.stale));
            }
        }

        Commands::Log { table, operation, record, actor, limit } => {
            let filter = CaptureFilter {
                table_name: table,
                operation: operation.as_deref().map(str::parse::<Operation>).transpose()?,
                record_id: record,
                actor,
                ..CaptureFilter::default()
            };

            let page = db.query(&filter, &Page::newest_first(limit)).await?;
            print_json_lines(&page.entries)?;
        }

        Commands::History { table, record_id } => {
            let entries = db.record_history(&table, record_id).await?;
            print_json_lines(&entries)?;
        }

        Commands::Summary => {
            let summary = db.summary().await?;
            if json {
                print_json(&summary)?;
            } else {
                let rows = summary
                    .iter()
                    .map(|s| {
                        vec![
                            s.table_name.clone(),
                            s.operation.clone(),
                            s.entries.to_string(),
                            s.last_activity.to_rfc3339(),
                        ]
                    })
                    .collect::<Vec<_>>();
                print_table(&["TABLE", "OPERATION", "ENTRIES", "LAST ACTIVITY"], &rows);
            }
        }

        Commands::Export { file, table } => {
            let filter = CaptureFilter {
                table_name: table,
                ..CaptureFilter::default()
            };

            let mut writer = BufWriter::new(File::create(&file)?);
            let written = db.export_jsonl_gz(&filter, &mut writer).await?;
            writer.flush()?;
            println!("wrote {} entries to {}", written, file.display());
        }

        Commands::Check => {
            let violations = db.validate_integrity().await?;
            let report = db.refresh_bindings().await?;
            let unbound = db.unbound_tables().await?;

            if json {
                print_json(&serde_json::json!({
                    "foreign_key_violations": violations,
                    "refreshed": report.refreshed,
                    "stale": report.stale,
                    "unbound": unbound,
                }))?;
            } else {
                println!("foreign key violations: {}", violations.len());
                for v in &violations {
                    println!("  {}", v);
                }
                println!("refreshed bindings:     {}", list_or_none(&report.refreshed));
                println!("stale bindings:         {}", list_or_none(&report.stale));
                println!("unbound tables:         {}", list_or_none(&unbound));
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_json_lines<T: Serialize>(items: &[T]) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for item in items {
        serde_json::to_writer(&mut out, item)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.len());
            }
        }
    }

    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, w)| format!("{:<width$}", cell, width = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    println!("{}", line(headers.to_vec()));
    for row in rows {
        println!("{}", line(row.iter().map(String::as_str).collect()));
    }
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
