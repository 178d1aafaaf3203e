//! imgstash - inspect and drive the on-device image cache
#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use imgstash::{CacheConfigUpdate, HttpDownloader, ImageCache, Settings, SqliteStore};

type Cache = ImageCache<HttpDownloader, SqliteStore>;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (RUST_LOG=debug for verbose output)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse CLI arguments
    match parse_args()? {
        Command::Get { url } => get_cli(&url).await,
        Command::Preload { urls } => preload_cli(urls).await,
        Command::Stats => stats_cli().await,
        Command::Clear => clear_cli().await,
        Command::Config => show_config(),
        Command::ConfigSet { field, value } => set_config(&field, &value),
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Version => {
            print_version();
            Ok(())
        }
    }
}

/// CLI commands
enum Command {
    Get { url: String },
    Preload { urls: Vec<String> },
    Stats,
    Clear,
    Config,
    ConfigSet { field: String, value: String },
    Help,
    Version,
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() == 1 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "-h" | "--help" | "help" => Ok(Command::Help),
        "-v" | "--version" | "version" => Ok(Command::Version),

        "get" => {
            let url = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("Missing image URL"))?
                .clone();
            Ok(Command::Get { url })
        }

        "preload" => {
            let urls: Vec<String> = args[2..].to_vec();
            if urls.is_empty() {
                return Err(anyhow::anyhow!("Missing image URLs"));
            }
            Ok(Command::Preload { urls })
        }

        "stats" => Ok(Command::Stats),
        "clear" => Ok(Command::Clear),

        "config" => match args.get(2).map(String::as_str) {
            None => Ok(Command::Config),
            Some("set") => {
                let field = args
                    .get(3)
                    .ok_or_else(|| anyhow::anyhow!("Missing config field"))?
                    .clone();
                let value = args
                    .get(4)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for {field}"))?
                    .clone();
                Ok(Command::ConfigSet { field, value })
            }
            Some(other) => Err(anyhow::anyhow!("Unknown config action: {other}")),
        },

        other => Err(anyhow::anyhow!(
            "Unknown command: {other}\nRun 'imgstash --help' for usage"
        )),
    }
}

fn open_cache() -> Result<Cache> {
    let settings = Settings::load()?;
    let cache_dir = settings.resolved_cache_dir()?;
    let store = SqliteStore::open_path(&imgstash::paths::store_path()?)
        .context("Failed to open image cache store")?;

    Ok(ImageCache::new(
        cache_dir,
        settings.cache,
        HttpDownloader::new(),
        store,
    ))
}

fn print_help() {
    let config_path = Settings::default_path()
        .map_or_else(|_| "Unknown".to_string(), |p| p.display().to_string());

    println!(
        r#"imgstash - persistent LRU image cache

USAGE:
    imgstash [COMMAND]

COMMANDS:
    get <url>                          Resolve a URL to a cached file (downloads on miss)
    preload <url>...                   Warm the cache for several URLs
    stats                              Show item count, size and hit rate
    clear                              Delete every cached image
    config                             Show current settings
    config set <field> <value>         Update a budget
      Fields:
        max_cache_size_bytes, max_age_hours, max_items, compression_quality

OPTIONS:
    -h, --help                         Show this help message
    -v, --version                      Show version information

CONFIG:
    {}
"#,
        config_path
    );
}

fn print_version() {
    println!("imgstash {}", imgstash::VERSION);
}

async fn get_cli(url: &str) -> Result<()> {
    let cache = open_cache()?;
    let resolved = cache.get_cached_image(url).await;
    cache.flush().await;

    if resolved == url {
        println!("Not cached (serving remote): {}", url);
    } else {
        println!("{}", resolved);
    }
    Ok(())
}

async fn preload_cli(urls: Vec<String>) -> Result<()> {
    let cache = open_cache()?;
    let total = urls.len();
    let loaded = cache.preload_images(urls).await;
    cache.flush().await;

    println!("✓ Downloaded {} of {} images", loaded, total);
    Ok(())
}

async fn stats_cli() -> Result<()> {
    let cache = open_cache()?;
    let stats = cache.get_cache_stats().await;
    let config = cache.config();

    println!("Cache directory: {}", cache.cache_dir().display());
    println!(
        "Items:           {} / {}",
        stats.total_items, config.max_items
    );
    println!(
        "Size:            {:.2} MB / {:.2} MB",
        stats.total_size_mb,
        config.max_cache_size_bytes as f64 / (1024.0 * 1024.0)
    );
    println!(
        "Hit rate:        {:.1}% ({} hits, {} misses)",
        stats.hit_rate * 100.0,
        stats.hits,
        stats.misses
    );
    if let (Some(oldest), Some(newest)) = (stats.oldest_item, stats.newest_item) {
        println!("Oldest:          {}", oldest.format("%Y-%m-%d %H:%M"));
        println!("Newest:          {}", newest.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}

async fn clear_cli() -> Result<()> {
    let cache = open_cache()?;
    cache.clear_cache().await;
    println!("✓ Image cache cleared");
    Ok(())
}

fn show_config() -> Result<()> {
    let settings = Settings::load()?;
    let content = toml::to_string_pretty(&settings).context("Failed to serialize config")?;
    println!("{}", content);
    Ok(())
}

fn set_config(field: &str, value: &str) -> Result<()> {
    let mut update = CacheConfigUpdate::default();
    match field {
        "max_cache_size_bytes" => update.max_cache_size_bytes = Some(value.parse()?),
        "max_age_hours" => update.max_age_hours = Some(value.parse()?),
        "max_items" => update.max_items = Some(value.parse()?),
        "compression_quality" => update.compression_quality = Some(value.parse()?),
        other => return Err(anyhow::anyhow!("Unknown config field: {other}")),
    }

    let mut settings = Settings::load()?;
    settings.cache.apply(&update);
    settings.save()?;

    println!("✓ {} = {}", field, value);
    Ok(())
}
