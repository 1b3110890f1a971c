use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};

use crate::api::{BackendClient, LibrarySource, SavedSource};
use crate::auth;
use crate::config::{self, Config, LoadOptions};
use crate::library::Library;
use crate::logging;
use crate::media::{self, MediaType};
use crate::ordering::{DateRange, FilterCriteria, OrderMode};
use crate::paginator::PageSource;
use crate::reddit::{self, Upstream};
use crate::selection::Collections;
use crate::server::{Backend, State};
use crate::session::{self, Controller};
use crate::storage::{self, KeyValueStore, Store};

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Browse saved Reddit media or a local media folder
#[derive(Parser)]
#[command(name = "saved-gallery", version)]
#[command(about = "Browse your saved Reddit media or a local media folder", long_about = None)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file to read instead of the default location
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the backend: token exchange, Reddit proxy and media library
    Serve {
        /// Address to listen on, overriding the config
        #[arg(short, long)]
        bind: Option<String>,
        /// Media folder to serve, overriding the config
        #[arg(long)]
        media_dir: Option<PathBuf>,
    },
    /// Sign in with Reddit through the backend
    Login {
        /// Print the authorize URL without opening a browser
        #[arg(long)]
        no_browser: bool,
        /// How long to wait for the redirect
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
    /// Forget the stored tokens
    Logout,
    /// List media from saved posts or the library
    Browse(BrowseArgs),
    /// Manage local collections
    Collections {
        #[command(subcommand)]
        action: CollectionAction,
    },
    /// Ask the backend whether it is up
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    Saved,
    Media,
}

#[derive(Args)]
pub struct BrowseArgs {
    /// Where the posts come from
    #[arg(short, long, value_enum, default_value_t = SourceKind::Saved)]
    pub source: SourceKind,
    /// Shuffle the list
    #[arg(long, conflicts_with = "stable")]
    pub random: bool,
    /// Keep the order the source returned
    #[arg(long)]
    pub stable: bool,
    /// Substring matched against title, subreddit and author
    #[arg(short, long)]
    pub query: Option<String>,
    /// Media types to keep (image, video, gif)
    #[arg(short = 't', long = "type")]
    pub types: Vec<String>,
    /// Only posts newer than this (all, week, month, year)
    #[arg(short, long)]
    pub range: Option<String>,
    /// Subreddits or folders to keep
    #[arg(short, long = "group")]
    pub groups: Vec<String>,
    /// Stop after this many pages
    #[arg(long)]
    pub max_pages: Option<usize>,
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum CollectionAction {
    /// List collections
    List,
    /// Create a collection and print its id
    Create { name: String },
    /// Show the posts in a collection
    Show { id: String },
    /// Add posts to a collection
    Add {
        id: String,
        #[arg(required = true)]
        posts: Vec<String>,
    },
    /// Remove posts from a collection
    Remove {
        id: String,
        #[arg(required = true)]
        posts: Vec<String>,
    },
    /// Rename a collection
    Rename { id: String, name: String },
    /// Delete a collection
    Delete { id: String },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load(LoadOptions {
        config_file: cli.config.clone(),
        env_prefix: None,
    })?;

    match cli.command {
        Commands::Serve { bind, media_dir } => serve(cfg, bind, media_dir),
        Commands::Login {
            no_browser,
            timeout,
        } => login(&cfg, !no_browser, timeout),
        Commands::Logout => {
            auth::clear_tokens(open_store(&cfg)?.as_ref());
            println!("Signed out.");
            Ok(())
        }
        Commands::Browse(args) => browse(&cfg, args),
        Commands::Collections { action } => collections(&cfg, action),
        Commands::Status => {
            let status = backend_client(&cfg)?.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn serve(mut cfg: Config, bind: Option<String>, media_dir: Option<PathBuf>) -> Result<()> {
    if let Some(bind) = bind {
        cfg.server.bind = bind;
    }
    if media_dir.is_some() {
        cfg.library.root = media_dir;
    }

    if let Err(err) = cfg.require_reddit_credentials() {
        warn!("{err}; token exchange will answer 500");
    }
    let client = reddit::Client::new(reddit::ClientConfig {
        user_agent: cfg.reddit.user_agent.clone(),
        client_id: cfg.reddit.client_id.clone(),
        client_secret: cfg.reddit.client_secret.clone(),
        page_limit: Some(cfg.reddit.page_limit),
        ..reddit::ClientConfig::default()
    })?;
    let upstream: Arc<dyn Upstream> = Arc::new(client);

    let library = match cfg.library.root.as_ref() {
        Some(root) => match Library::new(root, cfg.library.cache_ttl) {
            Ok(library) => {
                info!(root = %root.display(), "serving media library");
                Some(Arc::new(library))
            }
            Err(err) => {
                warn!("media library disabled: {err}");
                None
            }
        },
        None => None,
    };

    let state = State::new(Some(upstream), library, cfg.library.page_size);
    let backend = Backend::bind(&cfg.server.bind, state, cfg.server.workers)?;
    println!("Listening on http://{}", backend.local_addr());
    backend.run();
    Ok(())
}

fn login(cfg: &Config, open_browser: bool, timeout: Duration) -> Result<()> {
    let flow = auth_flow(cfg)?;
    let session = flow.login(open_browser, timeout)?;
    println!("Signed in as u/{}", session.username());
    Ok(())
}

fn browse(cfg: &Config, args: BrowseArgs) -> Result<()> {
    let store = open_store(cfg)?;
    let backend = Arc::new(backend_client(cfg)?);

    let source: Arc<dyn PageSource> = match args.source {
        SourceKind::Saved => {
            let flow = auth::Flow::new(auth_config(cfg), store.clone(), backend.clone());
            let session = flow
                .resume()?
                .ok_or_else(|| anyhow!("not signed in; run `saved-gallery login` first"))?;
            Arc::new(SavedSource::new(
                backend,
                session.token.clone(),
                session.username(),
            ))
        }
        SourceKind::Media => Arc::new(LibrarySource::new(backend, cfg.library.page_size)),
    };

    let order = if args.random || (cfg.gallery.random_order && !args.stable) {
        OrderMode::Random
    } else {
        OrderMode::Stable
    };
    let mut controller = Controller::new(
        source,
        store,
        session::Options {
            lookahead: cfg.gallery.lookahead,
            debounce: cfg.gallery.debounce,
            order,
        },
    );
    controller.set_criteria(criteria_from(&args)?);

    controller.start();
    loop {
        if !controller.wait_idle(FETCH_TIMEOUT) {
            bail!("timed out waiting for {}", controller.describe());
        }
        if let Some(err) = controller.last_error() {
            return Err(anyhow!(err.user_message()));
        }
        if !controller.has_more() {
            break;
        }
        if args
            .max_pages
            .is_some_and(|max| controller.pages_loaded() >= max)
        {
            break;
        }
        let shown = controller.view().len();
        let triggered = shown > 0 && controller.on_visible(shown - 1);
        if !triggered && !controller.load_more() {
            break;
        }
    }

    if args.json {
        let items: Vec<_> = controller
            .view()
            .iter()
            .map(|post| {
                let resolved = media::resolve(post);
                json!({
                    "id": post.id,
                    "title": post.title,
                    "group": post.group(),
                    "media": resolved,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for post in controller.view() {
        let (rule, resolved) = media::resolve_with_rule(post);
        println!(
            "{:<12} {:<20} {}\n             {} ({rule})",
            format!("{:?}", resolved.kind).to_lowercase(),
            post.group(),
            post.title,
            resolved.primary_url,
        );
    }
    println!(
        "{} shown of {} loaded, {} page(s) from {}",
        controller.view().len(),
        controller.source_list().len(),
        controller.pages_loaded(),
        controller.describe(),
    );
    Ok(())
}

fn criteria_from(args: &BrowseArgs) -> Result<FilterCriteria> {
    let mut criteria = FilterCriteria {
        query: args.query.clone().unwrap_or_default(),
        ..FilterCriteria::default()
    };
    for raw in &args.types {
        let kind =
            MediaType::parse(raw).ok_or_else(|| anyhow!("unknown media type {raw:?}"))?;
        criteria.media_types.insert(kind);
    }
    criteria.groups = args.groups.iter().cloned().collect();
    if let Some(raw) = args.range.as_deref() {
        criteria.date_range =
            DateRange::parse(raw).ok_or_else(|| anyhow!("unknown date range {raw:?}"))?;
    }
    Ok(criteria)
}

fn collections(cfg: &Config, action: CollectionAction) -> Result<()> {
    let mut all = Collections::load(open_store(cfg)?);
    match action {
        CollectionAction::List => {
            if all.is_empty() {
                println!("No collections.");
            }
            for collection in all.list() {
                println!(
                    "{}  {:<24} {:>4} post(s)  created {}",
                    collection.id,
                    collection.name,
                    collection.post_ids.len(),
                    collection.created_at.format("%Y-%m-%d %H:%M"),
                );
            }
        }
        CollectionAction::Create { name } => {
            let id = all.create(&name)?;
            println!("{id}");
        }
        CollectionAction::Show { id } => {
            let collection = all
                .get(&id)
                .ok_or_else(|| anyhow!("no collection with id {id}"))?;
            println!("{}", collection.name);
            for post in &collection.post_ids {
                println!("  {post}");
            }
        }
        CollectionAction::Add { id, posts } => all.add(&id, &posts)?,
        CollectionAction::Remove { id, posts } => all.remove(&id, &posts)?,
        CollectionAction::Rename { id, name } => all.rename(&id, &name)?,
        CollectionAction::Delete { id } => all.delete(&id),
    }
    Ok(())
}

fn auth_config(cfg: &Config) -> auth::Config {
    auth::Config {
        client_id: cfg.reddit.client_id.clone(),
        scopes: cfg.reddit.scopes.clone(),
        redirect_uri: cfg.reddit.redirect_uri.clone(),
        ..auth::Config::default()
    }
}

fn auth_flow(cfg: &Config) -> Result<auth::Flow> {
    let store = open_store(cfg)?;
    let backend = Arc::new(backend_client(cfg)?);
    Ok(auth::Flow::new(auth_config(cfg), store, backend))
}

fn backend_client(cfg: &Config) -> Result<BackendClient> {
    BackendClient::new(&cfg.server.backend_url).context("backend url")
}

fn open_store(cfg: &Config) -> Result<Arc<dyn KeyValueStore>> {
    let store = Store::open(storage::Options {
        path: cfg.storage.path.clone(),
    })?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn browse_args(argv: &[&str]) -> BrowseArgs {
        let mut full = vec!["saved-gallery", "browse"];
        full.extend_from_slice(argv);
        match Cli::parse_from(full).command {
            Commands::Browse(args) => args,
            _ => panic!("expected browse"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn browse_flags_build_criteria() {
        let args = browse_args(&[
            "--source", "media", "-q", "cat", "-t", "gif", "-t", "video", "-r", "week", "-g", "aww",
        ]);
        assert_eq!(args.source, SourceKind::Media);
        let criteria = criteria_from(&args).unwrap();
        assert_eq!(criteria.query, "cat");
        assert!(criteria.media_types.contains(&MediaType::Gif));
        assert!(criteria.media_types.contains(&MediaType::Video));
        assert_eq!(criteria.date_range, DateRange::Week);
        assert!(criteria.groups.contains("aww"));
    }

    #[test]
    fn unknown_filter_values_are_rejected() {
        assert!(criteria_from(&browse_args(&["-t", "audio"])).is_err());
        assert!(criteria_from(&browse_args(&["-r", "decade"])).is_err());
    }

    #[test]
    fn random_and_stable_conflict() {
        assert!(Cli::try_parse_from(["saved-gallery", "browse", "--random", "--stable"]).is_err());
    }

    #[test]
    fn login_timeout_is_humantime() {
        let cli = Cli::parse_from(["saved-gallery", "login", "--timeout", "90s", "--no-browser"]);
        match cli.command {
            Commands::Login {
                no_browser,
                timeout,
            } => {
                assert!(no_browser);
                assert_eq!(timeout, Duration::from_secs(90));
            }
            _ => panic!("expected login"),
        }
    }
}
