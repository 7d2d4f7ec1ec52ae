//! `conduit` - run queries and inspect stored sessions from the terminal

mod logging;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use conduit_connection::{ConnectOptions, ConnectionFactory};
use conduit_core::{DataFrame, TomlSecrets, Value};
use conduit_session::{
    KvSessionStorage, RedisSessionStorage, SessionStorage, StorageConfig, UploadedFileManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version, about = "Query configured data sources and inspect stored sessions", long_about = None)]
struct Cli {
    /// Secrets file; defaults to ~/.conduit/secrets.toml merged with ./.conduit/secrets.toml
    #[arg(long, global = true, env = "CONDUIT_SECRETS")]
    secrets: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write JSON logs to the data directory
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a query against a named connection and print the result
    Query {
        /// Connection name, or env:VAR to read it from the environment
        connection: String,

        sql: String,

        /// Connection kind; inferred from the name or secrets when omitted
        #[arg(long)]
        kind: Option<String>,

        /// Cache the result for this many seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Connect options as a JSON object, e.g. '{"autocommit": true}'
        #[arg(long)]
        options: Option<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Print a summary of a named connection
    Describe {
        connection: String,

        #[arg(long)]
        kind: Option<String>,
    },

    /// Inspect sessions in the session store
    Session {
        /// Session storage config file (TOML)
        #[arg(long, env = "CONDUIT_SESSION_CONFIG")]
        config: Option<PathBuf>,

        /// Redis URL, overriding the config file
        #[arg(long, env = "CONDUIT_REDIS_URL")]
        redis_url: Option<String>,

        #[command(subcommand)]
        command: SessionCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Show a stored session
    Get { session_id: String },

    /// Delete a stored session
    Delete { session_id: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// Restored sessions from the CLI own no uploaded files
struct DetachedFileManager;

impl UploadedFileManager for DetachedFileManager {
    fn remove_session_files(&self, _session_id: &str) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(logging::LoggingConfig::for_verbosity(cli.verbose).with_json_logs(cli.json_logs))?;

    match cli.command {
        Command::Query {
            connection,
            sql,
            kind,
            ttl,
            options,
            format,
        } => {
            let factory = factory(cli.secrets);
            let options = parse_options(options.as_deref())?;
            let conn = factory
                .connection(&connection, kind.as_deref(), options)
                .await
                .with_context(|| format!("failed to open connection '{}'", connection))?;
            let frame = conn
                .query(&sql, ttl.map(Duration::from_secs))
                .await
                .context("query failed")?;
            tracing::info!(rows = frame.row_count(), "query finished");
            match format {
                OutputFormat::Table => println!("{}", render_table(&frame)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&render_json(&frame))?),
            }
        }
        Command::Describe { connection, kind } => {
            let factory = factory(cli.secrets);
            let conn = factory
                .connection(&connection, kind.as_deref(), ConnectOptions::new())
                .await
                .with_context(|| format!("failed to open connection '{}'", connection))?;
            println!("{}", conn.describe().await?);
        }
        Command::Session {
            config,
            redis_url,
            command,
        } => {
            let mut storage_config = match config {
                Some(path) => StorageConfig::load(&path)?,
                None => StorageConfig::default(),
            };
            if let Some(url) = redis_url {
                storage_config.redis_url = url;
            }
            let storage = RedisSessionStorage::from_config(&storage_config)?;
            run_session_command(&storage, command).await?;
        }
    }

    Ok(())
}

fn factory(secrets: Option<PathBuf>) -> ConnectionFactory {
    let secrets = match secrets {
        Some(path) => TomlSecrets::from_files(vec![path]),
        None => TomlSecrets::load_default(),
    };
    ConnectionFactory::new(Arc::new(secrets))
}

fn parse_options(raw: Option<&str>) -> anyhow::Result<ConnectOptions> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--options must be a JSON object"),
        None => Ok(ConnectOptions::new()),
    }
}

async fn run_session_command<S>(storage: &KvSessionStorage<S>, command: SessionCommand) -> anyhow::Result<()>
where
    S: conduit_session::KeyValueStore,
{
    match command {
        SessionCommand::Get { session_id } => {
            storage.set_uploaded_file_manager(Arc::new(DetachedFileManager));
            storage.set_message_enqueued_callback(Arc::new(|| {}));

            let Some(info) = storage.get(&session_id).await? else {
                println!("No stored session '{}'", session_id);
                return Ok(());
            };

            let session = &info.session;
            let summary = serde_json::json!({
                "session_id": session.id(),
                "main_script_path": session.session_data().main_script_path,
                "command_line": session.session_data().command_line,
                "script_run_count": info.script_run_count,
                "user_info": session.user_info(),
                "session_state": session.session_state().filtered_state(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        SessionCommand::Delete { session_id } => {
            storage.delete(&session_id).await?;
            println!("Deleted session '{}'", session_id);
        }
    }
    Ok(())
}

fn header(frame: &DataFrame) -> Vec<String> {
    frame
        .index_names()
        .iter()
        .cloned()
        .chain(frame.column_names().into_iter().map(str::to_string))
        .collect()
}

fn render_table(frame: &DataFrame) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header(frame));

    for (idx, row) in frame.rows().iter().enumerate() {
        table.add_row(
            frame
                .index_values(idx)
                .iter()
                .chain(row.iter())
                .map(|value| value.to_string()),
        );
    }
    table
}

fn render_json(frame: &DataFrame) -> serde_json::Value {
    let names = header(frame);
    let records = frame
        .rows()
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let record: serde_json::Map<String, serde_json::Value> = names
                .iter()
                .cloned()
                .zip(frame.index_values(idx).iter().chain(row.iter()).map(json_value))
                .collect();
            serde_json::Value::Object(record)
        })
        .collect();
    serde_json::Value::Array(records)
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int64(n) => serde_json::Value::from(*n),
        Value::Float64(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Json(json) => json.clone(),
        Value::Array(values) => serde_json::Value::Array(values.iter().map(json_value).collect()),
        other => serde_json::Value::String(other.to_string()),
    }
}
