//! pool-probe: submit one read request to a validator pool
//!
//! Usage: pool-probe <genesis.txn> <operation> [payload-json] [config.toml]

use anyhow::{bail, Context};
use pool_client::{ConsensusResult, PoolConfig, PoolHandle, Request, RequestPolicy};
use serde_json::{json, Value};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        bail!("usage: pool-probe <genesis.txn> <operation> [payload-json] [config.toml]");
    }

    let payload: Value = match args.get(2) {
        Some(raw) => serde_json::from_str(raw).context("payload is not valid JSON")?,
        None => json!({}),
    };
    let config = match args.get(3) {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => PoolConfig::from_env()?,
    };

    let pool = PoolHandle::open_from_file(&args[0], config)
        .await
        .with_context(|| format!("failed to open pool from {}", args[0]))?;

    info!(
        nodes = pool.nodes().len(),
        pool_seq_no = pool.pool_seq_no(),
        "Pool ready"
    );

    let request = Request::new(args[1].as_str(), payload);
    let result = pool.submit(&request, &RequestPolicy::read()).await?;

    let report = match &result {
        ConsensusResult::Consensus {
            payload,
            contributing_nodes,
        } => json!({
            "consensus": true,
            "payload": payload,
            "contributing_nodes": contributing_nodes,
        }),
        ConsensusResult::NoConsensus {
            reason,
            diagnostics,
        } => json!({
            "consensus": false,
            "reason": reason.to_string(),
            "diagnostics": diagnostics
                .iter()
                .map(|d| json!({"node": d.node, "detail": d.detail}))
                .collect::<Vec<_>>(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.close();
    Ok(())
}
