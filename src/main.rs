use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docsql::dsl::{parse_filter, parse_group, parse_projection, parse_sort, GroupQuery, Query};
use docsql::schema::CollectionSpec;
use docsql::{DeleteOptions, DocumentDriver, Driver, DriverConfig, NativeResult, UpdateOptions};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Document-style queries over SQLite, MySQL and PostgreSQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to <config dir>/docsql/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database to use instead of the configured one
    #[arg(long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List databases
    Dbs,
    /// List collections of the current database
    Collections,
    /// Create a collection, optionally from a JSON collection spec
    CreateCollection {
        name: String,
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    DropCollection { name: String },
    /// Insert one document or an array of documents
    Insert { collection: String, docs: String },
    Find {
        collection: String,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        skip: Option<u64>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        projection: Option<String>,
    },
    Count {
        collection: String,
        #[arg(long)]
        filter: Option<String>,
    },
    Update {
        collection: String,
        filter: String,
        update: String,
        #[arg(long)]
        multi: bool,
        #[arg(long)]
        upsert: bool,
    },
    Delete {
        collection: String,
        filter: String,
        #[arg(long)]
        multi: bool,
    },
    Group {
        collection: String,
        group: String,
        #[arg(long)]
        filter: Option<String>,
    },
    /// Run SQL as-is
    Native {
        sql: String,
        /// The statement returns rows
        #[arg(long)]
        query: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = DriverConfig::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database = Some(database);
    }
    config.resolve_password(true)?;

    let driver = Driver::connect(&config).await?;
    let result = run(&driver, cli.command).await;
    driver.close().await;
    print(&result?)
}

async fn run(driver: &Driver, command: Command) -> Result<Value> {
    Ok(match command {
        Command::Dbs => serde_json::to_value(driver.list_dbs().await?)?,
        Command::Collections => serde_json::to_value(driver.list_collections().await?)?,
        Command::CreateCollection { name, schema } => {
            let spec: CollectionSpec = match schema {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&content)
                        .with_context(|| format!("invalid collection spec in {}", path.display()))?
                }
                None => CollectionSpec::default(),
            };
            driver.create_collection(&name, &spec).await?;
            Value::Bool(true)
        }
        Command::DropCollection { name } => {
            driver.drop_collection(&name).await?;
            Value::Bool(true)
        }
        Command::Insert { collection, docs } => match json(&docs)? {
            Value::Array(items) => {
                let docs = items
                    .into_iter()
                    .map(object)
                    .collect::<Result<Vec<_>>>()?;
                serde_json::to_value(driver.insert_many(&collection, docs, None).await?)?
            }
            doc => Value::String(driver.insert_one(&collection, object(doc)?, None).await?),
        },
        Command::Find {
            collection,
            filter,
            sort,
            skip,
            limit,
            projection,
        } => {
            let mut query = Query::new(parse_filter(&optional_json(filter)?)?);
            if let Some(sort) = sort {
                query.sort = parse_sort(&json(&sort)?)?;
            }
            if let Some(projection) = projection {
                query.projection = parse_projection(&json(&projection)?)?;
            }
            query.skip = skip;
            query.limit = limit;
            serde_json::to_value(driver.query_list(&collection, &query, None).await?)?
        }
        Command::Count { collection, filter } => {
            Value::from(driver.query_count(&collection, &optional_json(filter)?, None).await?)
        }
        Command::Update {
            collection,
            filter,
            update,
            multi,
            upsert,
        } => {
            let options = UpdateOptions {
                multi,
                upsert,
                hint: None,
            };
            let count = driver
                .update(&collection, &json(&filter)?, &json(&update)?, options, None)
                .await?;
            Value::from(count)
        }
        Command::Delete {
            collection,
            filter,
            multi,
        } => {
            let options = DeleteOptions { multi, hint: None };
            Value::from(driver.delete(&collection, &json(&filter)?, options, None).await?)
        }
        Command::Group {
            collection,
            group,
            filter,
        } => {
            let query = GroupQuery::new(
                parse_filter(&optional_json(filter)?)?,
                parse_group(&json(&group)?)?,
            );
            serde_json::to_value(driver.query_group_by(&collection, &query, None).await?)?
        }
        Command::Native { sql, query } => match driver.run_native_cmd(&sql, vec![], query, None).await? {
            NativeResult::Affected(n) => Value::from(n),
            NativeResult::Rows(rows) => serde_json::to_value(rows)?,
        },
    })
}

fn json(text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("invalid JSON: {}", text))
}

fn optional_json(text: Option<String>) -> Result<Value> {
    match text {
        Some(text) => json(&text),
        None => Ok(Value::Object(Default::default())),
    }
}

fn object(value: Value) -> Result<docsql::Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("expected a JSON object, got {}", other),
    }
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
