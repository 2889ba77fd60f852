//! End-to-end demo: submit a batch, watch it complete, read the artifacts.
//!
//! Runs entirely in-process (in-memory store, local object store):
//!   cargo run --example bulk_email

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use conveyor::{
    BatchProcessor, DoneSummary, Engine, EngineConfig, InitBlock, JobStatus, LocalObjectStore,
    MemoryStore, MessageEntry, MokaStatusCache, NewRow, NoopInitializer, Result, RowOutcome,
};

/// Pretends to send one email per row and logs a line into a shared report.
struct SendEmails;

#[async_trait]
impl BatchProcessor for SendEmails {
    async fn process(
        &self,
        _init: &dyn InitBlock,
        context: &Value,
        line: i32,
        input: &Value,
    ) -> Result<RowOutcome> {
        let Some(to) = input.get("to").and_then(Value::as_str) else {
            return Ok(RowOutcome::failed(
                json!(null),
                vec![MessageEntry::new("missing_recipient", "no `to` address").with_field("to")],
            ));
        };

        let sender = context["sender"].as_str().unwrap_or("noreply@example.com");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        Ok(RowOutcome::success(json!({"delivered": to}))
            .with_fragment("delivery.log", format!("{sender} -> {to} (line {line})\n").into_bytes()))
    }

    async fn done(
        &self,
        _init: &dyn InitBlock,
        _context: &Value,
        summary: &DoneSummary,
    ) -> Result<()> {
        println!(
            "done hook: batch {} finished as {} ({} ok / {} failed / {} aborted)",
            summary.batch_id,
            summary.status,
            summary.counters.n_success,
            summary.counters.n_failed,
            summary.counters.n_aborted
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let workdir = tempfile::tempdir()?;
    let mut config = EngineConfig::default();
    config.poll_interval = std::time::Duration::from_millis(50);
    config.spool_dir = Some(workdir.path().join("spool"));

    let engine = Arc::new(Engine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MokaStatusCache::default()),
        Arc::new(LocalObjectStore::new(workdir.path().join("objects"))),
        config,
    ));

    engine.register_processor("emailapp", "sendbulkemail", Arc::new(SendEmails))?;
    engine.register_initializer("emailapp", Arc::new(NoopInitializer))?;

    let pool = engine.start_workers(Some(2));

    let rows = vec![
        NewRow::new(1, json!({"to": "ada@example.com"})),
        NewRow::new(2, json!({"to": "grace@example.com"})),
        NewRow::new(3, json!({})), // fails: no recipient
        NewRow::new(4, json!({"to": "edsger@example.com"})),
    ];

    let batch = engine
        .submit(
            "emailapp",
            "SendBulkEmail",
            json!({"sender": "newsletter@example.com"}),
            rows,
            false,
        )
        .await?;
    println!("submitted batch {batch}");

    let result = loop {
        let result = engine.poll_done(batch).await?;
        if result.is_finished() {
            break result;
        }
        println!("  status: {}", result.status);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    };

    println!("terminal status: {}", result.status);
    assert_eq!(result.status, JobStatus::Failed); // one row had no recipient
    for row in &result.rows {
        println!(
            "  line {}: {} {}",
            row.line,
            row.status,
            row.result.as_ref().map(|v| v.to_string()).unwrap_or_default()
        );
    }

    let log = engine.fetch_output(batch, "delivery.log").await?;
    println!("delivery.log:\n{}", String::from_utf8_lossy(&log));

    pool.shutdown().await;
    Ok(())
}
