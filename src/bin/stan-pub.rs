//! # stan-pub
//!
//! Publish a single message to a subject, either waiting for the server
//! acknowledgment inline or (`--async`) waiting for it separately with a
//! bounded timeout.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use stan_bench::{
    cli::PubArgs,
    client::{connector_for, ClientError, Connector, StreamingConnection},
    logging::init_logging,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = PubArgs::parse();
    let _log_guard = init_logging(args.log.verbose, args.log.quiet, args.log.log_file.as_deref())?;

    let options = args
        .connect
        .to_options()
        .context("Invalid connection options")?;
    let connector = connector_for(options)?;
    let conn = connector
        .connect(&args.client_id)
        .await
        .with_context(|| format!("Cannot connect as '{}'", args.client_id))?;

    let result = publish(&args, conn.as_ref()).await;
    conn.close().await?;
    result
}

async fn publish(args: &PubArgs, conn: &dyn StreamingConnection) -> Result<()> {
    let payload = Bytes::from(args.message.clone().into_bytes());

    if !args.async_publish {
        conn.publish(&args.subject, payload)
            .await
            .context("Error during publish")?;
        info!("Published [{}] : '{}'", args.subject, args.message);
        return Ok(());
    }

    let ack = conn
        .publish_async(&args.subject, payload)
        .await
        .context("Error during async publish")?;
    info!("Published [{}] : '{}'", args.subject, args.message);

    let guid = tokio::time::timeout(args.ack_wait, ack)
        .await
        .map_err(|_| ClientError::AckTimeout(args.ack_wait))?
        .context("Error in server ack")?;
    info!("Received ACK for guid {}", guid);
    Ok(())
}
