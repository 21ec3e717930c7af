use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use sluice_engine::{DocumentConsumer, Engine, load_declaration_document};
use sluice_types::{Location, SourceId, absolutize};
use sluice_util::{EngineConfig, load_config};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("normalize", sub)) => run_normalize(sub),
        Some(("fetch", sub)) => run_fetch(sub).await,
        Some(("resolve", sub)) => run_resolve(sub).await,
        _ => {
            build_cli().print_help()?;
            Ok(())
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` directives decide the level; unset or unparsable falls back to `info`.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn origin_arg() -> Arg {
    Arg::new("origin")
        .long("origin")
        .action(ArgAction::Set)
        .help("Base URL relative sources are resolved against (overrides the config file)")
}

fn build_cli() -> Command {
    Command::new("sluice")
        .about("Resolve, fetch and cache declarative data sources")
        .subcommand(
            Command::new("normalize")
                .about("Print the normalized cache key for each source")
                .arg(origin_arg())
                .arg(Arg::new("source").required(true).num_args(1..).help("Raw source strings")),
        )
        .subcommand(
            Command::new("fetch")
                .about("Fetch sources and print the resulting cache snapshot")
                .arg(origin_arg())
                .arg(Arg::new("source").required(true).num_args(1..).help("Sources to load")),
        )
        .subcommand(
            Command::new("resolve")
                .about("Mount a declaration document and print its local data tree")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .short('f')
                        .required(true)
                        .action(ArgAction::Set)
                        .help("Path to a declaration document (YAML or JSON)"),
                )
                .arg(origin_arg())
                .arg(Arg::new("path").long("path").action(ArgAction::Set).help("Navigation path"))
                .arg(
                    Arg::new("param")
                        .long("param")
                        .action(ArgAction::Append)
                        .help("Route parameter as name=value"),
                )
                .arg(
                    Arg::new("query")
                        .long("query")
                        .action(ArgAction::Append)
                        .help("Query pair as name=value"),
                ),
        )
}

/// Load the config file and apply command-line overrides.
fn engine_config(matches: &ArgMatches) -> Result<EngineConfig> {
    let mut config = load_config().context("failed to load engine configuration")?;
    if let Some(origin) = matches.get_one::<String>("origin") {
        config.origin = Some(Url::parse(origin).with_context(|| format!("invalid origin '{origin}'"))?);
    }
    Ok(config)
}

fn build_engine(config: EngineConfig, location: Location) -> Result<Engine> {
    Engine::builder(config)
        .location(location)
        .redirect_handler(|location| warn!(location = %location, "source redirected; result was not cached"))
        .build()
        .context("failed to build engine")
}

fn run_normalize(matches: &ArgMatches) -> Result<()> {
    let origin = match matches.get_one::<String>("origin") {
        Some(origin) => Some(Url::parse(origin).with_context(|| format!("invalid origin '{origin}'"))?),
        None => None,
    };
    for raw in matches.get_many::<String>("source").into_iter().flatten() {
        let normalized = match &origin {
            Some(origin) => absolutize(raw, Some(origin)),
            None => SourceId::normalize(raw),
        };
        println!("{normalized}");
    }
    Ok(())
}

async fn run_fetch(matches: &ArgMatches) -> Result<()> {
    let engine = build_engine(engine_config(matches)?, Location::default())?;
    let sources: Vec<&String> = matches.get_many::<String>("source").into_iter().flatten().collect();

    let started = engine.load_state(&sources, true);
    info!(requested = sources.len(), started, "fetching sources");
    engine.wait_idle().await;

    println!("{}", serde_json::to_string_pretty(&*engine.snapshot())?);
    Ok(())
}

fn parse_pair(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .with_context(|| format!("expected name=value, got '{raw}'"))
}

async fn run_resolve(matches: &ArgMatches) -> Result<()> {
    let file = matches.get_one::<String>("file").context("--file is required")?;
    let document = load_declaration_document(file).with_context(|| format!("failed to load {file}"))?;
    let consumer = DocumentConsumer::new(&document).with_context(|| format!("invalid declarations in {file}"))?;

    let mut location = Location::new(matches.get_one::<String>("path").cloned().unwrap_or_default());
    for raw in matches.get_many::<String>("param").into_iter().flatten() {
        let (name, value) = parse_pair(raw)?;
        location = location.with_param(name, value);
    }
    for raw in matches.get_many::<String>("query").into_iter().flatten() {
        let (name, value) = parse_pair(raw)?;
        location = location.with_query(name, value);
    }

    let engine = build_engine(engine_config(matches)?, location)?;
    let binding = engine.mount(Arc::new(consumer));
    engine.wait_idle().await;

    for record in &engine.snapshot().errors {
        warn!(source = %record.source, status = ?record.status, kind = ?record.kind, "{}", record.error);
    }
    println!("{}", serde_json::to_string_pretty(&binding.data())?);
    Ok(())
}
