pub mod catalog;
pub mod config;
pub mod history;
pub mod logging;
pub mod model;
pub mod paging;
pub mod search;
pub mod seed;
pub mod storage;

use anyhow::{Context, Result, bail};
use catalog::SqliteCityCatalog;
use clap::{CommandFactory, Parser, Subcommand};
use config::AppConfig;
use history::{QueryHistoryStore, SqliteQueryHistory};
use model::{City, SearchQuery};
use paging::{Pager, PagingSnapshot};
use search::{NavigationIntent, SearchCommand, SearchCoordinator};
use seed::SeedOutcome;
use std::path::PathBuf;
use std::sync::Arc;
use storage::{Database, IoContext};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "cities",
    version,
    about = "Search, star and locate cities from a local catalog"
)]
pub struct Cli {
    /// Path to the SQLite database (defaults to <data-dir>/cities.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Override data dir. Defaults to platform data dir.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Results per page
    #[arg(long, global = true)]
    pub page_size: Option<usize>,

    /// Verbose logging to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load the city dataset into the catalog
    Init {
        /// Cities JSON, plain or gzip (defaults to CITIES_SEED)
        #[arg(long)]
        file: Option<PathBuf>,

        /// Load even if the catalog already has cities
        #[arg(long)]
        force: bool,
    },
    /// Search cities by name prefix and record the query in history
    Search {
        query: String,

        /// Number of pages to fetch
        #[arg(long, default_value_t = 1)]
        pages: usize,

        #[arg(long)]
        json: bool,
    },
    /// Show the most recent searches
    History {
        #[arg(long)]
        json: bool,
    },
    /// Remove a search from history
    Forget { id: i64 },
    /// Show one city with its map link
    Show {
        id: i64,

        #[arg(long)]
        json: bool,
    },
    /// Star a city
    Star { id: i64 },
    /// Remove the star from a city
    Unstar { id: i64 },
    /// List starred cities
    Starred {
        #[arg(long, default_value_t = 1)]
        pages: usize,

        #[arg(long)]
        json: bool,
    },
    /// Interactive search session reading commands from stdin
    Shell,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = AppConfig::from_env().with_overrides(cli.data_dir, cli.db, cli.page_size);
    debug!(db = %config.db_path().display(), "resolved configuration");

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "cities", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
        Commands::Init { file, force } => {
            let db = open_db(&config)?;
            run_init(&db, file.or(config.seed_path.clone()), force).await
        }
        Commands::Search { query, pages, json } => {
            let db = open_db(&config)?;
            run_search(db, &config, query, pages, json).await
        }
        Commands::History { json } => {
            let history = SqliteQueryHistory::open(open_db(&config)?).await?;
            let list = history
                .snapshot()
                .map_err(|e| anyhow::anyhow!(e))
                .context("reading history")?;
            print_history(&list, json)
        }
        Commands::Forget { id } => {
            let history = SqliteQueryHistory::open(open_db(&config)?).await?;
            let entry = SearchQuery {
                id,
                text: String::new(),
                timestamp: 0,
            };
            if !history.remove(&entry).await? {
                bail!("no history entry with id {id}");
            }
            println!("Removed history entry {id}");
            Ok(())
        }
        Commands::Show { id, json } => {
            let catalog = SqliteCityCatalog::new(open_db(&config)?);
            let city = catalog
                .city_by_id(id)
                .await?
                .with_context(|| format!("no city with id {id}"))?;
            print_city_detail(&city, json)
        }
        Commands::Star { id } => set_star(&config, id, true).await,
        Commands::Unstar { id } => set_star(&config, id, false).await,
        Commands::Starred { pages, json } => {
            let catalog = SqliteCityCatalog::new(open_db(&config)?);
            let pager = Pager::new(catalog.starred_cities(), config.paging.clone());
            let cities = pager
                .collect(Some(pages.saturating_sub(1)))
                .await
                .map_err(|e| anyhow::anyhow!(e))
                .context("loading starred cities")?;
            print_cities(&cities, json)
        }
        Commands::Shell => {
            let db = open_db(&config)?;
            run_shell(db, &config).await
        }
    }
}

fn open_db(config: &AppConfig) -> Result<Database> {
    let path = config.db_path();
    Database::open(&path, IoContext::current())
        .with_context(|| format!("opening database {}", path.display()))
}

async fn run_init(db: &Database, file: Option<PathBuf>, force: bool) -> Result<()> {
    let file = file.context("no dataset given: pass --file or set CITIES_SEED")?;
    let cities = seed::load_cities_json(&file)?;
    match seed::initialize_database(db, cities, force).await? {
        SeedOutcome::Seeded { count } => println!("Loaded {count} cities"),
        SeedOutcome::Skipped { existing } => {
            println!("Catalog already has {existing} cities; use --force to reload")
        }
    }
    Ok(())
}

async fn run_search(
    db: Database,
    config: &AppConfig,
    query: String,
    pages: usize,
    json: bool,
) -> Result<()> {
    let history = Arc::new(SqliteQueryHistory::open(db.clone()).await?);
    let catalog = Arc::new(SqliteCityCatalog::new(db));
    let coordinator = SearchCoordinator::new(history, catalog, config.paging.clone());

    coordinator.dispatch(SearchCommand::TextChanged(query));
    if let Some(pending) = coordinator.dispatch(SearchCommand::Submit) {
        pending.wait().await.context("recording search in history")?;
    }

    let results = coordinator.current_results();
    let pager = results
        .pager
        .map_err(|e| anyhow::anyhow!(e))
        .context("building search results")?;
    let cities = pager
        .collect(Some(pages.saturating_sub(1)))
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("loading search results")?;
    print_cities(&cities, json)
}

async fn set_star(config: &AppConfig, id: i64, starred: bool) -> Result<()> {
    let catalog = SqliteCityCatalog::new(open_db(config)?);
    if !catalog.set_starred(id, starred).await? {
        bail!("no city with id {id}");
    }
    println!("{} city {id}", if starred { "Starred" } else { "Unstarred" });
    Ok(())
}

fn format_city(city: &City) -> String {
    format!(
        "{:>9}  {} {}, {}  ({:.4}, {:.4})",
        city.id,
        if city.is_starred { '*' } else { ' ' },
        city.name,
        city.country_code,
        city.coordinates.latitude,
        city.coordinates.longitude,
    )
}

fn print_cities(cities: &[City], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(cities)?);
    } else if cities.is_empty() {
        println!("No cities found");
    } else {
        for city in cities {
            println!("{}", format_city(city));
        }
    }
    Ok(())
}

fn print_city_detail(city: &City, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "city": city,
            "map_url": city.map_url(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}, {}", city.name, city.country_code);
        println!("  id:          {}", city.id);
        println!(
            "  coordinates: {}, {}",
            city.coordinates.latitude, city.coordinates.longitude
        );
        println!("  starred:     {}", if city.is_starred { "yes" } else { "no" });
        println!("  map:         {}", city.map_url());
    }
    Ok(())
}

fn print_history(list: &[SearchQuery], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(list)?);
    } else if list.is_empty() {
        println!("No recent searches");
    } else {
        for (n, entry) in list.iter().enumerate() {
            println!("{:>2}. {}  (id {})", n + 1, entry.text, entry.id);
        }
    }
    Ok(())
}

const SHELL_HELP: &str = "\
commands:
  type <text>   edit the search box
  submit        search for the text and remember it
  retry         search again
  clear         clear the search box
  pick <n>      search for history entry n
  drop <n>      forget history entry n
  more          load the next page of results
  open <n>      show result n
  history       list recent searches
  quit";

async fn run_shell(db: Database, config: &AppConfig) -> Result<()> {
    let history = Arc::new(SqliteQueryHistory::open(db.clone()).await?);
    let catalog = Arc::new(SqliteCityCatalog::new(db));
    let coordinator = SearchCoordinator::new(history, catalog, config.paging.clone());
    let intents = coordinator.navigation_intents();

    println!("{SHELL_HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (word, arg) = line.split_once(' ').unwrap_or((line, ""));
        let arg = arg.trim();

        let command = match word {
            "" => continue,
            "quit" | "exit" => break,
            "help" => {
                println!("{SHELL_HELP}");
                continue;
            }
            "type" => Some(SearchCommand::TextChanged(arg.to_string())),
            "submit" => Some(SearchCommand::Submit),
            "retry" => Some(SearchCommand::Retry),
            "clear" => Some(SearchCommand::ClearQuery),
            "pick" | "drop" => {
                let Some(entry) = history_entry(&coordinator, arg) else {
                    println!("no history entry {arg}");
                    continue;
                };
                Some(if word == "pick" {
                    SearchCommand::SelectHistoryItem(entry)
                } else {
                    SearchCommand::RemoveHistoryItem(entry)
                })
            }
            "open" => {
                let items = current_snapshot(&coordinator).await.map(|s| s.items);
                let Some(city) = nth(arg, items.as_deref().unwrap_or_default()) else {
                    println!("no result {arg}");
                    continue;
                };
                Some(SearchCommand::SelectCity(city))
            }
            "more" => {
                if let Ok(pager) = &coordinator.current_results().pager
                    && !pager.load_next()
                {
                    println!("no more results");
                }
                None
            }
            "history" => {
                print_shell_history(&coordinator);
                continue;
            }
            other => {
                println!("unknown command `{other}`; try `help`");
                continue;
            }
        };

        if let Some(command) = command
            && let Some(pending) = coordinator.dispatch(command)
            && let Err(err) = pending.wait().await
        {
            println!("history update failed: {err}");
        }

        if let Some(NavigationIntent::SelectedCity(city)) = intents.try_recv() {
            print_city_detail(&city, false)?;
            continue;
        }

        print_shell_state(&coordinator).await;
    }
    Ok(())
}

type ShellCoordinator = SearchCoordinator<SqliteQueryHistory, SqliteCityCatalog>;

fn nth<T: Clone>(arg: &str, items: &[T]) -> Option<T> {
    let n: usize = arg.parse().ok()?;
    items.get(n.checked_sub(1)?).cloned()
}

fn history_entry(coordinator: &ShellCoordinator, arg: &str) -> Option<SearchQuery> {
    let list = coordinator.history().borrow().clone().ok()?;
    nth(arg, &list)
}

async fn current_snapshot(coordinator: &ShellCoordinator) -> Option<PagingSnapshot<City>> {
    let pager = coordinator.current_results().pager.ok()?;
    Some(pager.settled().await)
}

fn print_shell_history(coordinator: &ShellCoordinator) {
    match coordinator.history().borrow().as_ref() {
        Ok(list) if list.is_empty() => println!("No recent searches"),
        Ok(list) => {
            for (n, entry) in list.iter().enumerate() {
                println!("{:>2}. {}", n + 1, entry.text);
            }
        }
        Err(err) => println!("history unavailable: {err}"),
    }
}

async fn print_shell_state(coordinator: &ShellCoordinator) {
    println!(
        "query: {:?} (searching {:?})",
        coordinator.displayed_text(),
        coordinator.committed_query()
    );
    let results = coordinator.current_results();
    let pager = match results.pager {
        Ok(pager) => pager,
        Err(err) => {
            println!("search failed: {err}; `retry` to try again");
            return;
        }
    };
    let snapshot = pager.settled().await;
    if let Some(err) = snapshot.load_states.error() {
        println!("loading failed: {err}; `retry` to try again");
    } else if snapshot.is_empty_result() {
        println!("No cities found");
    }
    for (n, city) in snapshot.items.iter().enumerate() {
        println!("{:>4}. {}", n + 1, format_city(city).trim_start());
    }
    if !snapshot.items.is_empty() && !snapshot.load_states.append.end_of_pagination_reached() {
        println!("(`more` for more results)");
    }
}
