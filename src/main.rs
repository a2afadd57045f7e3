//! Gateway binary: load configuration, wire the subsystems, serve.
//!
//! ```text
//! cascade-gateway --config gateway.toml
//! cascade-gateway --schema        # print the config JSON schema
//! ```

use cascade_gateway::config::GatewayConfig;
use cascade_gateway::provider::{HttpProvider, Provider, ProviderRegistry};
use cascade_gateway::{init_tracing, CostBook, Gateway, GatewayError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Default base URLs for the providers the cost book knows about.
fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "perplexity" => Some("https://api.perplexity.ai"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        _ => None,
    }
}

fn build_providers(config: &GatewayConfig, cost_book: Arc<CostBook>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for (name, section) in &config.providers {
        let base_url = section
            .base_url
            .clone()
            .or_else(|| default_base_url(name).map(str::to_string));
        let Some(base_url) = base_url else {
            warn!(provider = name.as_str(), "no base_url known for provider, skipping");
            continue;
        };
        let adapter: Arc<dyn Provider> = Arc::new(HttpProvider::new(
            name.clone(),
            section.api_key.clone(),
            base_url,
            section.models.clone(),
            cost_book.clone(),
        ));
        info!(provider = name.as_str(), models = section.models.len(), "provider enabled");
        registry.register(adapter);
    }
    registry
}

fn load_config() -> Result<GatewayConfig, GatewayError> {
    let mut args = std::env::args().skip(1);
    let mut path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--schema" => {
                match cascade_gateway::config::export_schema() {
                    Ok(schema) => println!("{schema}"),
                    Err(e) => eprintln!("schema export failed: {e}"),
                }
                std::process::exit(0);
            }
            "--config" => path = args.next().map(PathBuf::from),
            other => {
                return Err(GatewayError::InvalidInput(format!("unknown argument: {other}")))
            }
        }
    }
    let path = path.or_else(|| std::env::var("CASCADE_GATEWAY_CONFIG").ok().map(PathBuf::from));
    match path {
        Some(p) => {
            info!(path = %p.display(), "loading configuration");
            GatewayConfig::from_path(&p)
        }
        None => {
            info!("no configuration file given, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    init_tracing();
    cascade_gateway::metrics::init_metrics()?;

    let config = load_config()?;
    let cost_book = Arc::new(CostBook::new());
    let registry = build_providers(&config, cost_book);
    if registry.is_empty() {
        warn!("no providers configured; only cache hits can be served");
    }

    let gateway = Arc::new(build_gateway(&config, registry).await?);

    // Periodic maintenance: expired cache entries and aged budget records.
    let maintenance = gateway.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(600));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let removed = maintenance.cache().prune_expired().await;
            maintenance.budget().prune();
            if removed > 0 {
                info!(removed, "cache maintenance pass complete");
            }
        }
    });

    cascade_gateway::server::start_server(&config, gateway).await
}

#[cfg(feature = "redis-cache")]
async fn build_gateway(
    config: &GatewayConfig,
    registry: ProviderRegistry,
) -> Result<Gateway, GatewayError> {
    use cascade_gateway::config::CacheAdapter;
    if config.cache.adapter == CacheAdapter::Redis {
        let url = config
            .cache
            .redis_url
            .as_deref()
            .ok_or_else(|| GatewayError::InvalidInput("cache.redis_url missing".into()))?;
        let store = cascade_gateway::cache::store::RedisStore::connect(url)
            .await
            .map_err(|e| GatewayError::Cache(e.to_string()))?;
        info!("redis cache adapter connected");
        return Ok(Gateway::with_store(config, registry, Arc::new(store)));
    }
    Ok(Gateway::new(config, registry))
}

#[cfg(not(feature = "redis-cache"))]
async fn build_gateway(
    config: &GatewayConfig,
    registry: ProviderRegistry,
) -> Result<Gateway, GatewayError> {
    use cascade_gateway::config::CacheAdapter;
    if config.cache.adapter == CacheAdapter::Redis {
        warn!("built without the redis-cache feature; falling back to the memory adapter");
    }
    Ok(Gateway::new(config, registry))
}
