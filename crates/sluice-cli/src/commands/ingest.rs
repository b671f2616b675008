//! Ingest command implementation.

use super::{channel_options, connect, shutdown_token};
use crate::server::{start_server, ServerState};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use sluice_core::{Config, InsertStats};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::info;

/// Arguments of `sluice ingest`.
#[derive(Debug)]
pub struct IngestArgs {
    pub channel: String,
    pub input: Option<PathBuf>,
    pub batch_size: usize,
    pub wait: bool,
    pub metrics_port: Option<u16>,
}

/// Records of one insert call and the input lines they came from.
#[derive(Debug, Default)]
struct Batch {
    rows: Vec<Value>,
    first_line: u64,
    last_line: u64,
}

/// Accumulates non-empty input lines into batches.
struct BatchReader<R> {
    lines: tokio::io::Lines<R>,
    line_number: u64,
    batch_size: usize,
}

impl<R: AsyncBufRead + Unpin> BatchReader<R> {
    fn new(reader: R, batch_size: usize) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
            batch_size,
        }
    }

    /// Next batch, or `None` at end of input.
    async fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut batch = Batch::default();
        while batch.rows.len() < self.batch_size {
            let Some(line) = self.lines.next_line().await.context("Failed to read input")? else {
                break;
            };
            self.line_number += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(line)
                .with_context(|| format!("Invalid JSON on line {}", self.line_number))?;
            if !record.is_object() {
                bail!("Line {} is not a JSON object", self.line_number);
            }
            if batch.rows.is_empty() {
                batch.first_line = self.line_number;
            }
            batch.last_line = self.line_number;
            batch.rows.push(record);
        }
        Ok((!batch.rows.is_empty()).then_some(batch))
    }
}

/// Insert records from a file or stdin into one channel.
pub async fn run(config: Config, args: IngestArgs) -> Result<()> {
    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }
    let options = channel_options(&config, &args.channel)?;
    let ct = shutdown_token();

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let client = Arc::new(connect(&config, &ct).await?);

    let server_shutdown = ct.child_token();
    if let Some(port) = args.metrics_port {
        let health_client = Arc::clone(&client);
        let state = Arc::new(ServerState {
            metrics: Arc::clone(client.metrics()),
            uploader_healthy: Box::new(move || health_client.uploader_healthy()),
        });
        tokio::spawn(start_server(state, port, server_shutdown.clone()));
    }

    let result = ingest(&client, options, reader, &args, &ct).await;

    server_shutdown.cancel();
    client.close().await.context("Failed to close client")?;
    result
}

async fn ingest(
    client: &sluice_core::ServiceClient,
    options: sluice_core::ChannelOptions,
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    args: &IngestArgs,
    ct: &sluice_core::CancellationToken,
) -> Result<()> {
    let mut channel = client
        .open_channel(options, ct)
        .await
        .with_context(|| format!("Failed to open channel {}", args.channel))?;

    info!(
        channel = %args.channel,
        offset_token = channel.latest_offset_token().unwrap_or("-"),
        batch_size = args.batch_size,
        "Starting ingestion"
    );

    let mut batches = BatchReader::new(reader, args.batch_size);
    let mut total_rows = 0usize;
    let mut inserts = 0usize;

    while let Some(batch) = batches.next_batch().await? {
        let stats = channel
            .insert_rows_with_offsets(
                &batch.rows,
                &batch.first_line.to_string(),
                &batch.last_line.to_string(),
                ct,
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to insert lines {}-{} into channel {}",
                    batch.first_line, batch.last_line, args.channel
                )
            })?;
        print_stats(&stats, batch.last_line);
        total_rows += stats.row_count;
        inserts += 1;
    }

    if args.wait && inserts > 0 {
        let polls = channel
            .wait_until_committed(ct)
            .await
            .with_context(|| format!("Commit of channel {} not confirmed", args.channel))?;
        println!("Committed after {} poll(s)", polls);
    }

    println!(
        "Inserted {} row(s) in {} blob(s); row sequencer {}, offset token {}",
        total_rows,
        inserts,
        channel.row_sequencer(),
        channel.latest_offset_token().unwrap_or("-")
    );
    Ok(())
}

fn print_stats(stats: &InsertStats, last_line: u64) {
    println!(
        "{} rows={} size={}B build={}ms upload={}ms attempts={} offset={}",
        stats.blob_path,
        stats.row_count,
        stats.compressed_output_size,
        stats.build_time.as_millis(),
        stats.upload_time.as_millis(),
        stats.upload_attempts,
        last_line
    );
}
