// Command-line front end for the eGarden core.
// Drives the image cache and the secure store from the shell.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use egarden_core::{CacheConfig, EgardenError, ImageCacheManager, Result, SecureConfig, secure};

const USAGE: &str = "usage: egarden <command>

commands:
  get <uri>              cache an image and print its local path
  stats                  print cache usage as JSON
  clear                  delete every cached image
  secret-set <key> <v>   store a secret
  secret-get <key>       print a stored secret
  secret-delete <key>    remove a stored secret";

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(&args).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: &[String]) -> Result<()> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["get", uri] => {
            let cache = ImageCacheManager::new(CacheConfig::from_env()?)?;
            println!("{}", cache.get_cached_image(uri).await);
        }
        ["stats"] => {
            let cache = ImageCacheManager::new(CacheConfig::from_env()?)?;
            cache.initialize().await?;
            println!("{}", serde_json::to_string_pretty(&cache.get_cache_stats())?);
        }
        ["clear"] => {
            let cache = ImageCacheManager::new(CacheConfig::from_env()?)?;
            cache.clear_cache().await?;
        }
        ["secret-set", key, value] => {
            let storage = secure::open(&SecureConfig::from_env()?);
            storage.set_secure_item(key, value).await?;
        }
        ["secret-get", key] => {
            let storage = secure::open(&SecureConfig::from_env()?);
            match storage.get_secure_item(key).await? {
                Some(value) => println!("{}", value),
                None => return Err(EgardenError::Other(format!("no secret stored under {}", key))),
            }
        }
        ["secret-delete", key] => {
            let storage = secure::open(&SecureConfig::from_env()?);
            storage.delete_secure_item(key).await?;
        }
        _ => return Err(EgardenError::Other(USAGE.to_string())),
    }

    Ok(())
}
