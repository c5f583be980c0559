//! pgtunnel CLI: run queries and scripts against PostgreSQL, directly or
//! through an SSH tunnel, with credentials taken from a dotenv file.

#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use pgtunnel::db::{
    DataFrame, DataOps, DatabaseConnector, IfExists, SshDatabaseConnector, TunnelOptions,
    hash_value,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "pgtunnel")]
#[command(about = "Query PostgreSQL directly or through an SSH tunnel using a dotenv credentials file")]
#[command(version)]
struct Cli {
    /// Directory holding the credentials file (defaults to current directory)
    #[arg(short = 'p', long = "path", default_value = ".", global = true)]
    path: PathBuf,

    /// Credentials file name
    #[arg(short = 'e', long = "env-file", default_value = ".env", global = true)]
    env_file: String,

    /// Reach the database through the SSH host named in the credentials file
    #[arg(long = "ssh", global = true)]
    ssh: bool,

    /// SSH port used when the credentials file has no SSH_PORT
    #[arg(long = "ssh-port", default_value_t = 22, global = true)]
    ssh_port: u16,

    /// Passphrase for an encrypted SSH_PKEY
    #[arg(long = "passphrase", env = "SSH_KEY_PASSPHRASE", hide_env_values = true, global = true)]
    passphrase: Option<String>,

    /// Offer SSH agent identities after the configured key
    #[arg(long = "use-agent", global = true)]
    use_agent: bool,

    /// SSH connect timeout in seconds
    #[arg(long = "connect-timeout", global = true)]
    connect_timeout: Option<u64>,

    /// Output format for query results
    #[arg(short = 'f', long = "format", default_value = "table", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a read query and print the rows
    Query {
        /// SQL text; omit to read it from --file
        sql: Option<String>,
        #[arg(long = "file", conflicts_with = "sql")]
        file: Option<PathBuf>,
    },
    /// Run a SQL script of one or more statements
    Exec {
        #[arg(long = "file")]
        file: PathBuf,
    },
    /// Drop a table if it exists
    Drop { table: String },
    /// Load a CSV file into a table
    Push {
        table: String,
        csv: PathBuf,
        #[arg(long = "if-exists", default_value = "fail")]
        if_exists: IfExists,
    },
    /// Print the SHA-256 hex digest of a value
    Hash { value: String },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Command::Hash { value } = &cli.command {
        println!("{}", hash_value(value));
        return Ok(());
    }

    let path = if cli.path == PathBuf::from(".") {
        std::env::current_dir()?
    } else {
        cli.path.clone()
    };

    if cli.ssh {
        let mut options = TunnelOptions::default()
            .with_path(path)
            .with_credential_file(cli.env_file.clone())
            .with_ssh_port(cli.ssh_port)
            .with_agent(cli.use_agent);
        if let Some(passphrase) = &cli.passphrase {
            options = options.with_passphrase(passphrase.clone());
        }
        if let Some(secs) = cli.connect_timeout {
            options = options.with_connect_timeout(Duration::from_secs(secs));
        }

        let mut connector = SshDatabaseConnector::connect(options).await?;
        let result = run(&connector, &cli).await;
        connector.close().await;
        result
    } else {
        let connector = DatabaseConnector::new(&path, &cli.env_file)?;
        let result = run(&connector, &cli).await;
        connector.close().await;
        result
    }
}

async fn run(db: &dyn DataOps, cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.command {
        Command::Query { sql, file } => {
            let sql = match (sql, file) {
                (Some(sql), _) => sql.clone(),
                (None, Some(file)) => std::fs::read_to_string(file)?,
                (None, None) => return Err("query needs SQL text or --file".into()),
            };
            let frame = db.get_data(&sql).await?;
            print_frame(&frame, &cli.format)?;
        }
        Command::Exec { file } => {
            let script = std::fs::read_to_string(file)?;
            let affected = db.execute_script(&script).await?;
            info!("Script {} affected {} row(s)", file.display(), affected);
        }
        Command::Drop { table } => {
            db.drop_table(table).await?;
        }
        Command::Push {
            table,
            csv,
            if_exists,
        } => {
            let frame = DataFrame::from_csv(File::open(csv)?)?;
            let inserted = db.push_data(table, &frame, *if_exists).await?;
            println!("{}", inserted);
        }
        Command::Hash { value } => {
            println!("{}", hash_value(value));
        }
    }
    Ok(())
}

fn print_frame(frame: &DataFrame, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let cell = |v: &pgtunnel::db::Value| v.as_text().unwrap_or_default();

    match format {
        OutputFormat::Json => {
            let records: Vec<serde_json::Map<String, serde_json::Value>> = frame
                .rows()
                .iter()
                .map(|row| {
                    frame
                        .column_names()
                        .into_iter()
                        .zip(row)
                        .map(|(name, value)| {
                            serde_json::to_value(value).map(|v| (name.to_string(), v))
                        })
                        .collect::<Result<_, serde_json::Error>>()
                })
                .collect::<Result<_, _>>()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Csv => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            writer.write_record(frame.column_names())?;
            for row in frame.rows() {
                writer.write_record(row.iter().map(cell))?;
            }
            writer.flush()?;
        }
        OutputFormat::Table => {
            let names = frame.column_names();
            let rendered: Vec<Vec<String>> = frame
                .rows()
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|v| if v.is_null() { "NULL".to_string() } else { cell(v) })
                        .collect()
                })
                .collect();
            let widths: Vec<usize> = names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    rendered
                        .iter()
                        .filter_map(|row| row.get(i))
                        .map(|s| s.chars().count())
                        .fold(name.chars().count(), usize::max)
                })
                .collect();

            let line = |cells: Vec<&str>| {
                cells
                    .iter()
                    .zip(&widths)
                    .map(|(c, w)| format!("{:<width$}", c, width = *w))
                    .collect::<Vec<_>>()
                    .join(" | ")
            };
            println!("{}", line(names.clone()));
            println!(
                "{}",
                widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-")
            );
            for row in &rendered {
                println!("{}", line(row.iter().map(String::as_str).collect()));
            }
            println!("({} row(s))", frame.len());
        }
    }
    Ok(())
}
