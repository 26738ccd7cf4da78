use anyhow::{Context, Result};
use log::info;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use park_registry::{
    load_observations, BatchCoordinator, BatchWindow, BrandInferenceStep, CsvRegistryStore, Ledger,
    Pipeline, RegistryConfig, RegistryStore, RuleEngine, SystemClock, VERSION,
};

const USAGE: &str = "usage:
  park-registry ingest <registry.csv> <observations.csv>
  park-registry brands <registry.csv> [offset] [limit]
  park-registry summary <registry.csv>

env:
  REGISTRY_CONFIG  JSON config file (defaults built in)
  REGISTRY_RULES   JSON classification rules (defaults built in)
  RUST_LOG         log level (info, debug, ...)";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("ingest") if args.len() == 4 => run_ingest(Path::new(&args[2]), Path::new(&args[3])),
        Some("brands") if args.len() >= 3 => {
            let offset = parse_arg(args.get(3), 0)?;
            let limit = parse_arg(args.get(4), usize::MAX)?;
            run_brands(Path::new(&args[2]), BatchWindow::new(offset, limit))
        }
        Some("summary") if args.len() == 3 => run_summary(Path::new(&args[2])),
        _ => {
            eprintln!("park-registry {}\n{}", VERSION, USAGE);
            std::process::exit(2);
        }
    }
}

fn parse_arg(arg: Option<&String>, default: usize) -> Result<usize> {
    match arg {
        Some(a) => a.parse().with_context(|| format!("Not a number: {}", a)),
        None => Ok(default),
    }
}

fn load_config() -> Result<RegistryConfig> {
    match env::var("REGISTRY_CONFIG") {
        Ok(path) => RegistryConfig::from_file(&path),
        Err(_) => Ok(RegistryConfig::default()),
    }
}

fn load_rules() -> Result<RuleEngine> {
    match env::var("REGISTRY_RULES") {
        Ok(path) => RuleEngine::from_file(&path),
        Err(_) => Ok(RuleEngine::default()),
    }
}

/// Audit ledger lives next to the registry: parks.csv → parks.ledger.db
fn ledger_path(registry: &Path) -> PathBuf {
    registry.with_extension("ledger.db")
}

fn run_ingest(registry_path: &Path, observations: &Path) -> Result<()> {
    println!("🏕️  Park Registry - ingest");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = load_config()?;
    let clock = SystemClock;
    let store = CsvRegistryStore::new(registry_path);
    let ledger = Ledger::open(ledger_path(registry_path)).context("Failed to open ledger")?;

    println!("\n📂 Loading observations...");
    let (raws, bad_rows) = load_observations(observations, chrono::Utc::now())?;
    println!("✓ {} observations ({} unreadable rows skipped)", raws.len(), bad_rows);

    println!("\n🔗 Resolving and reconciling...");
    let pipeline = Pipeline::new(&store, &config, &clock)
        .with_rules(load_rules()?)
        .with_ledger(&ledger);
    let report = pipeline
        .ingest(&raws)
        .with_context(|| format!("Ingest into {:?} failed", registry_path))?;

    println!("✓ {}", report.summary());
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Registry written to {:?}", registry_path);
    Ok(())
}

fn run_brands(registry_path: &Path, window: BatchWindow) -> Result<()> {
    let config = load_config()?;
    let clock = SystemClock;
    let store = CsvRegistryStore::new(registry_path);
    let ledger = Ledger::open(ledger_path(registry_path)).context("Failed to open ledger")?;
    let pipeline = Pipeline::new(&store, &config, &clock).with_rules(load_rules()?);

    let step = BrandInferenceStep::new();
    let report = BatchCoordinator::new(&store, pipeline.reconciler(), pipeline.classifier(), &clock)
        .with_ledger(&ledger)
        .with_retry(config.retry.clone())
        .run(&step, window, false)
        .context("Brand inference batch failed")?;

    println!("✅ {}", report.summary());
    Ok(())
}

fn run_summary(registry_path: &Path) -> Result<()> {
    let store = CsvRegistryStore::new(registry_path);
    let registry = store
        .load()
        .with_context(|| format!("Failed to load {:?}", registry_path))?;
    info!("{} parks loaded", registry.len());

    let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
    let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
    let mut review = 0;
    let mut with_area = 0;
    for park in registry.iter() {
        *by_category.entry(park.category.as_str()).or_default() += 1;
        let state = park.state().map(|s| s.code().to_string()).unwrap_or_else(|| "?".to_string());
        *by_state.entry(state).or_default() += 1;
        if park.needs_review {
            review += 1;
        }
        if park.area(park_registry::Field::LandAreaSqm).is_some() {
            with_area += 1;
        }
    }

    println!("📊 {} parks in {:?}", registry.len(), registry_path);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for (category, n) in &by_category {
        println!("  {:<16} {:>6}", category, n);
    }
    println!();
    for (state, n) in &by_state {
        println!("  {:<16} {:>6}", state, n);
    }
    println!();
    println!("  needs review     {:>6}", review);
    println!("  land area known  {:>6}", with_area);
    Ok(())
}
