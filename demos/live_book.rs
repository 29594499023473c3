/// Live order book demo
///
/// Mirrors one product's book from the public feed and prints the top of
/// book every second until Ctrl-C.
///
/// Usage: cargo run --example live_book -- [PRODUCT_ID] [CONFIG_JSON_PATH]

use std::time::Duration;

use book_feed::{BookEngine, FeedConfig, FeedError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let product = args.next();
    let config = match args.next() {
        Some(path) => FeedConfig::from_json_str(&std::fs::read_to_string(path)?)?,
        None => FeedConfig::default(),
    };
    let config = match product {
        Some(product) => config.with_product(product),
        None => config,
    };

    let mut engine = BookEngine::connect(config)?;
    let handle = engine.handle();
    engine.start()?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match handle.view() {
                    Ok(view) => println!(
                        "sequence {} ({:?})\n{}",
                        handle.sequence(),
                        handle.health(),
                        view
                    ),
                    Err(e) => error!(error = %FeedError::from(e), "view unavailable"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping");
                break;
            }
        }
    }

    engine.stop().await;
    Ok(())
}
