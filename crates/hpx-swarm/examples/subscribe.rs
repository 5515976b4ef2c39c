//! Subscribe Example
//!
//! Connects to a swarm backend, subscribes to a query and prints the merged
//! state on every update.
//!
//! Run with: `SWARM_URL=wss://swarm.example.com RUST_LOG=hpx_swarm=debug cargo run -p hpx-swarm --example subscribe`

use std::{sync::Arc, time::Duration};

use hpx_swarm::{BroadcastSink, EndpointConfig, SwarmClient, SwarmConfig};
use serde_json::{Map, json};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::var("SWARM_URL").unwrap_or_else(|_| "wss://swarm.example.com".to_string());
    let site_id = std::env::var("SWARM_SITE_ID").unwrap_or_else(|_| "1".to_string());

    let mut config = SwarmConfig::new(site_id)
        .socket_endpoint(EndpointConfig::new(url))
        .debug_statistics(true);
    if let Ok(poll_url) = std::env::var("SWARM_POLL_URL") {
        config = config.poll_endpoint(EndpointConfig::new(poll_url));
    }

    let sink = Arc::new(BroadcastSink::new(16));
    let mut notifications = sink.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            println!("notification: {notification}");
        }
    });

    let client = SwarmClient::builder(config).notifications(sink).build()?;

    let mut params = Map::new();
    params.insert("source".to_string(), json!("betting"));
    params.insert(
        "what".to_string(),
        json!({"game": ["id", "team1_name", "team2_name"]}),
    );
    let (subid, state) = client
        .subscribe(params, |state| println!("update: {state}"))
        .await?;
    println!("subscribed as {subid}: {state}");

    tokio::time::sleep(Duration::from_secs(30)).await;

    client.unsubscribe(&subid).await?;
    client.dump_statistics();
    client.shutdown().await;
    Ok(())
}
