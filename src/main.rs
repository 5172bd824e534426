use std::path::PathBuf;

use anyhow::Result;
use bson::Document;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use class_dao::common::utils::{json_to_document, to_json};
use class_dao::{
    CallContext, Class, ClassQueries, ClassRepository, DaoConfig, DataSource, MongoSessionProvider,
    TextQuery, TransactionOptions, TransactionalMutation, init_tracing,
};

/// class-dao - transactional data access for the class collection
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overall deadline for the command, in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk through connect, insert, find, aggregate and index creation
    Demo,
    /// Insert a class
    Insert(InsertCommand),
    /// Find classes, newest class id first
    Find(FilterArgs),
    /// Update classes (upsert on)
    Update {
        /// Filter as JSON
        #[arg(short, long)]
        filter: String,
        /// Update as JSON, e.g. '{"$set": {"classname": "MBA三班"}}'
        #[arg(short, long)]
        update: String,
    },
    /// Delete classes; an empty filter deletes all
    Delete {
        #[command(flatten)]
        filter: FilterArgs,
        /// Skip the transaction
        #[arg(long)]
        direct: bool,
    },
    /// Count classes
    Count(FilterArgs),
    /// Distinct values of a field
    Distinct {
        /// Field name
        #[arg(long, default_value = "classid")]
        field: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Highest years per class name
    Aggregate {
        /// Count classes per name instead
        #[arg(long)]
        count: bool,
    },
    /// Index management
    Indexes {
        #[command(subcommand)]
        action: IndexAction,
    },
    /// Full-text search over the brief field
    Search {
        /// Loose terms (any may match)
        terms: Vec<String>,
        /// Phrase that must be present
        #[arg(short, long)]
        phrase: Vec<String>,
        /// Term that must be absent
        #[arg(short, long)]
        exclude: Vec<String>,
    },
    /// Print insert events (replica set or sharded cluster only)
    Watch {
        /// Stop after this many events
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct FilterArgs {
    /// Filter as JSON; empty matches everything
    #[arg(short, long, default_value = "{}")]
    filter: String,
}

impl FilterArgs {
    fn document(&self) -> Result<Document> {
        Ok(json_to_document(&self.filter)?)
    }
}

#[derive(Args)]
struct InsertCommand {
    /// Class id
    #[arg(long)]
    class_id: u32,
    /// Class name
    #[arg(long)]
    name: String,
    #[arg(long, default_value_t = 0)]
    years: i32,
    #[arg(long, default_value = "")]
    brief: String,
    /// Number of students
    #[arg(long)]
    students: Option<i32>,
    /// Number of teachers
    #[arg(long)]
    teachers: Option<i32>,
    /// Skip the transaction
    #[arg(long)]
    direct: bool,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Create the text index on brief
    Create,
    /// List indexes
    List,
}

/// Everything a command needs, built once per process
struct AppContext {
    source: DataSource,
    queries: ClassQueries,
    repository: ClassRepository<MongoSessionProvider>,
    call: CallContext,
}

impl AppContext {
    async fn connect(config: &DaoConfig, deadline_ms: Option<u64>) -> Result<Self> {
        let source = DataSource::connect(&config.mongo).await?;
        let queries = ClassQueries::new(&source);
        let mutation = TransactionalMutation::new(
            source.session_provider(),
            TransactionOptions::from(&config.transaction),
        );
        let repository = ClassRepository::new(config.mongo.collection.clone(), mutation);
        let call = match deadline_ms {
            Some(ms) => CallContext::with_timeout(std::time::Duration::from_millis(ms)),
            None => CallContext::background(),
        };
        Ok(AppContext {
            source,
            queries,
            repository,
            call,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaoConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging.filter);

    if matches!(cli.command, Commands::Config) {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let app = AppContext::connect(&config, cli.deadline_ms).await?;
    let result = run_command(&app, cli.command).await;
    app.source.shutdown().await;
    result
}

async fn run_command(app: &AppContext, command: Commands) -> Result<()> {
    match command {
        Commands::Demo => run_demo(app).await,
        Commands::Insert(cmd) => handle_insert_command(app, cmd).await,
        Commands::Find(filter) => {
            let classes = app.queries.find_class_by_filter(filter.document()?).await?;
            println!("{}", to_json(&classes));
            Ok(())
        }
        Commands::Update { filter, update } => {
            let outcome = app
                .repository
                .update_class(&app.call, json_to_document(&filter)?, json_to_document(&update)?)
                .await?;
            println!("✅ {}", to_json(&outcome));
            Ok(())
        }
        Commands::Delete { filter, direct } => {
            let filter = filter.document()?;
            let deleted = if direct {
                app.queries.delete_class(filter).await?
            } else {
                app.repository.delete_class_with_transaction(&app.call, filter).await?
            };
            println!("✅ Deleted {} classes", deleted);
            Ok(())
        }
        Commands::Count(filter) => {
            println!("count: {}", app.queries.count_class(filter.document()?).await?);
            Ok(())
        }
        Commands::Distinct { field, filter } => {
            let values = app.queries.distinct(&field, filter.document()?).await?;
            println!("{}", to_json(&values));
            Ok(())
        }
        Commands::Aggregate { count } => {
            let rows = if count {
                app.queries.aggregate_count_by_name().await?
            } else {
                app.queries.aggregate_max_years().await?
            };
            for row in rows {
                println!("{}", to_json(&row));
            }
            Ok(())
        }
        Commands::Indexes { action } => match action {
            IndexAction::Create => {
                let names = app.queries.create_indexes().await?;
                println!("✅ Created indexes {:?}", names);
                Ok(())
            }
            IndexAction::List => {
                for index in app.queries.list_indexes().await? {
                    let name = index.options.and_then(|o| o.name).unwrap_or_default();
                    println!("{} {}", name, index.keys);
                }
                Ok(())
            }
        },
        Commands::Search {
            terms,
            phrase,
            exclude,
        } => {
            let query = TextQuery {
                terms,
                phrases: phrase,
                excluded: exclude,
            };
            if query.is_empty() {
                anyhow::bail!("give at least one term or phrase to search for");
            }
            for document in app.queries.find_by_full_text(&query).await? {
                println!("{}", to_json(&document));
            }
            Ok(())
        }
        Commands::Watch { limit } => {
            let seen = app
                .queries
                .watch_inserts(limit, |event| println!("{:?}", event))
                .await?;
            info!("watch finished after {} events", seen);
            Ok(())
        }
        Commands::Config => Ok(()),
    }
}

async fn handle_insert_command(app: &AppContext, cmd: InsertCommand) -> Result<()> {
    let mut class = Class::new(cmd.class_id, cmd.name)
        .with_years(cmd.years)
        .with_brief(cmd.brief);
    if cmd.students.is_some() || cmd.teachers.is_some() {
        class = class.with_desc(cmd.students.unwrap_or(0), cmd.teachers.unwrap_or(0));
    }

    let id = if cmd.direct {
        app.queries.add_class(&class).await?
    } else {
        app.repository.add_class_with_transaction(&app.call, &class).await?
    };
    println!("✅ Class inserted with id: {}", id);
    Ok(())
}

async fn run_demo(app: &AppContext) -> Result<()> {
    let databases = app.source.list_database_names().await?;
    println!("show databases:\n {}", to_json(&databases));

    let class = Class::new(3, "CS-3")
        .with_desc(20, 2)
        .with_years(13)
        .with_brief("Sxs");
    let id = app.repository.add_class_with_transaction(&app.call, &class).await?;
    println!("✅ Class inserted with id: {}", id);

    let classes = app.queries.find_class_by_filter(Document::new()).await?;
    println!("query result: {}", to_json(&classes));

    for row in app.queries.aggregate_max_years().await? {
        println!("{}", to_json(&row));
    }

    let names = app.queries.create_indexes().await?;
    println!("✅ Created indexes {:?}", names);
    Ok(())
}
