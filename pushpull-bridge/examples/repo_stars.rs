//! Live repository stars through a pull cache.
//!
//! Run with `RUST_LOG=pushpull_bridge=debug cargo run -p pushpull-bridge --example repo_stars`
//! to watch subscriptions open, share and close.

use std::sync::Arc;
use std::time::Duration;

use pushpull_bridge::{QueryBridge, QueryClientExt};
use pushpull_cache::QueryClient;
use pushpull_core::{ActionRef, BridgeConfig, BridgeResult, MutationRef, QueryRef};
use pushpull_test_utils::DemoBackend;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const REPO: &str = "tokio-rs/tokio";
const TARGET_STARS: u64 = 45;

#[derive(Debug, Clone, Serialize)]
struct RepoArgs {
    repo: String,
}

#[derive(Debug, Deserialize)]
struct Repo {
    repo: String,
    stars: u64,
}

#[derive(Debug, Serialize)]
struct CityArgs {
    city: String,
}

#[derive(Debug, Deserialize)]
struct Weather {
    city: String,
    temperature_c: i64,
}

#[tokio::main]
async fn main() -> BridgeResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pushpull_bridge=info,info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let backend = DemoBackend::with_stars([(REPO.to_string(), 41)]);
    let client = Arc::new(QueryClient::default());
    let bridge = QueryBridge::new(backend, BridgeConfig::from_env()?)?;
    bridge.connect(&client)?;

    let get_repo: QueryRef<RepoArgs, Repo> = QueryRef::parse("repos:get")?;
    let star_repo: MutationRef<RepoArgs, u64> = MutationRef::parse("repos:star")?;
    let get_weather: ActionRef<CityArgs, Weather> = ActionRef::parse("weather:get")?;
    let args = RepoArgs {
        repo: REPO.to_string(),
    };

    let mut repo = client.observe(bridge.reactive_query(&get_repo, args.clone())?);
    let first = repo.wait_for_data().await?;
    tracing::info!(repo = %first.repo, stars = first.stars, "Initial value");

    let star = bridge.mutation(&star_repo);
    let starring = tokio::spawn(async move {
        while star.call(&args).await? < TARGET_STARS {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        BridgeResult::Ok(())
    });

    while let Some(state) = repo.observer_mut().changed().await {
        let Some(Ok(current)) = repo.data() else {
            continue;
        };
        tracing::info!(stars = current.stars, updates = state.data_update_count, "Pushed");
        if current.stars >= TARGET_STARS {
            break;
        }
    }
    if let Ok(result) = starring.await {
        result?;
    }

    let weather = client
        .ensure_data(bridge.action_query(
            &get_weather,
            CityArgs {
                city: "Oslo".to_string(),
            },
        )?)
        .await?;
    tracing::info!(city = %weather.city, temperature_c = weather.temperature_c, "Action result");

    tracing::info!(
        active = bridge.active_subscriptions(),
        held = bridge.held_queries(),
        "Disconnecting"
    );
    drop(repo);
    bridge.disconnect()?;
    Ok(())
}
