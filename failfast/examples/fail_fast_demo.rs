use std::time::{Duration, Instant};

use failfast::{
    Dynamic, Error, FailFastMapExt, PoolConfig, WorkPool, repr_safe_str, safe_for_json,
};
use futures::TryStreamExt;
use tokio::time::sleep;
use tracing::{Level, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(thiserror::Error, Debug)]
enum FetchError {
    #[error("page {0} is gone")]
    Gone(u64),
    #[error(transparent)]
    Pool(#[from] Error),
}

/// RUST_LOG can be used to set the log level, `failfast=trace` shows every spawned task.
fn setup_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// Pretends to fetch a page, pages above `missing_from` do not exist.
async fn fetch(page: u64, missing_from: u64) -> Result<Dynamic, FetchError> {
    sleep(Duration::from_millis(20 * (page % 4))).await;
    if page >= missing_from {
        return Err(FetchError::Gone(page));
    }
    Ok(Dynamic::map([
        (Dynamic::from("page"), Dynamic::Int(page as i64)),
        (Dynamic::from("tags"), Dynamic::Set(vec!["demo".into(), 1.into()])),
    ]))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();

    // FAILFAST_POOL_CAPACITY and FAILFAST_POOL_NAME override the defaults
    let config = PoolConfig::from_env()?;
    let pool = WorkPool::from_config(&config)?;
    info!(pool = pool.name(), capacity = pool.capacity(), "pool ready");

    println!("1. every page exists:");
    let start = Instant::now();
    let pages: Vec<Dynamic> = (0..8u64)
        .fail_fast_map(&pool, |page| fetch(page, u64::MAX))
        .try_collect()
        .await?;
    for page in &pages {
        println!("   {}", safe_for_json(page));
    }
    println!("   done in {:?}, free slots {}", start.elapsed(), pool.free_slots());

    println!("\n2. page 5 is missing:");
    let start = Instant::now();
    let result: Result<Vec<Dynamic>, FetchError> = (0..100u64)
        .fail_fast_map(&pool, |page| fetch(page, 5))
        .try_collect()
        .await;
    match result {
        Ok(pages) => println!("   unexpectedly got {} pages", pages.len()),
        Err(e) => {
            let reason = Dynamic::from(e.to_string());
            println!(
                "   failed fast in {:?}: {}",
                start.elapsed(),
                String::from_utf8_lossy(&repr_safe_str(&reason))
            );
        }
    }
    println!("   free slots {}", pool.free_slots());

    Ok(())
}
