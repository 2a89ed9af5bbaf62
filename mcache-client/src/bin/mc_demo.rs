//! Walks through the basic commands against a running memcached.
//!
//! Usage: `mc_demo [config.json]`. Without a file, `MCACHE_*` environment
//! variables are used. Set `RUST_LOG=mcache_client=debug` to watch the pool.

use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcache_client::{ClientConfig, Item, McClient, StoreOptions};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            ClientConfig::from_json(&text)?
        }
        None => ClientConfig::from_env()?,
    };
    info!(host = %config.host, port = config.port, "starting demo");
    let client = McClient::with_config(config)?;

    let version = client.version().await.context("server unreachable")?;
    println!("version => {}", String::from_utf8_lossy(&version));

    let (k1, k2) = (&b"k1"[..], &b"k2"[..]);
    let keys = [k1, k2];
    let opts = StoreOptions::default();

    println!("\nget and set key:");
    println!("set(k1, 1) => {}", client.set(k1, b"1", opts).await?);
    println!("get(k1) => {}", show(client.get(k1).await?.as_ref()));
    println!("set(k2, v2) => {}", client.set(k2, b"v2", opts).await?);
    println!("get(k2) => {}", show(client.get(k2).await?.as_ref()));

    println!("\nincr and decr value:");
    println!("incr(k1) => {:?}", client.incr_one(k1).await?);
    println!("decr(k1) => {:?}", client.decr_one(k1).await?);

    println!("\nget multi key:");
    println!("get_many(keys) => {}", show_many(&client.get_many(&keys).await?));
    println!("gets_many(keys) => {}", show_many(&client.gets_many(&keys).await?));
    println!("set(k2, v2) => {}", client.set(k2, b"v2", opts).await?);
    println!("gets_many(keys) => {}", show_many(&client.gets_many(&keys).await?));

    println!("\ndelete key:");
    println!("delete(k1) => {}", client.delete(k1).await?);
    println!("gets_many(keys) => {}", show_many(&client.gets_many(&keys).await?));

    println!("\nappend value to key:");
    println!("append(k2, append) => {}", client.append(k2, b"append", opts).await?);
    println!("get(k2) => {}", show(client.get(k2).await?.as_ref()));

    println!("\nflush memcached:");
    client.flush_all().await?;
    println!("flush_all() => ok");
    println!("get_many(keys) => {}", show_many(&client.get_many(&keys).await?));

    client.close();
    Ok(())
}

fn show(item: Option<&Item>) -> String {
    match item {
        Some(item) => match item.cas {
            Some(cas) => format!(
                "{:?} (flags {}, cas {})",
                String::from_utf8_lossy(&item.data),
                item.flags,
                cas
            ),
            None => format!("{:?} (flags {})", String::from_utf8_lossy(&item.data), item.flags),
        },
        None => "miss".to_string(),
    }
}

fn show_many(items: &HashMap<Vec<u8>, Item>) -> String {
    let mut keys: Vec<&Vec<u8>> = items.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys
        .into_iter()
        .map(|key| format!("{}: {}", String::from_utf8_lossy(key), show(items.get(key))))
        .collect();
    format!("{{{}}}", parts.join(", "))
}
