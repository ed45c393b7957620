//! # stan-sub
//!
//! Subscribe to a subject from a chosen start position and print every
//! message until interrupted with Ctrl-C, then unsubscribe and close.

use anyhow::{Context, Result};
use clap::Parser;
use stan_bench::{
    cli::SubArgs,
    client::{connector_for, Connector, StreamMessage, StreamingConnection, SubscriptionOptions},
    logging::init_logging,
};
use tracing::info;

fn render(message: &StreamMessage, index: u64, timestamps: bool) -> String {
    let line = format!(
        "[#{}] Received on [{}]: 'sequence:{} data:{}'",
        index,
        message.subject,
        message.sequence,
        String::from_utf8_lossy(&message.payload)
    );
    if timestamps {
        format!("{} {}", message.timestamp.format("%Y/%m/%d %H:%M:%S"), line)
    } else {
        line
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = SubArgs::parse();
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
    info!(
        "Connected to {} clusterID: [{}] clientID: [{}]",
        args.connect.servers, args.connect.cluster_id, args.client_id
    );

    let result = listen(&args, conn.as_ref()).await;
    conn.close().await?;
    result
}

async fn listen(args: &SubArgs, conn: &dyn StreamingConnection) -> Result<()> {
    let options = SubscriptionOptions::new(args.start_position()).queue_group(args.queue_group.clone());
    let mut subscription = conn
        .subscribe(&args.subject, options)
        .await
        .with_context(|| format!("Cannot subscribe to '{}'", args.subject))?;
    info!(
        "Listening on [{}], clientID=[{}], qgroup=[{}]",
        args.subject,
        args.client_id,
        args.queue_group.as_deref().unwrap_or("")
    );

    let mut received = 0u64;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Cannot listen for Ctrl-C")?;
                info!("Received an interrupt, unsubscribing and closing connection...");
                break;
            }
            message = subscription.next_message() => match message {
                Some(message) => {
                    received += 1;
                    println!("{}", render(&message, received, args.timestamps));
                }
                None => {
                    info!("Subscription on '{}' ended", args.subject);
                    break;
                }
            },
        }
    }

    subscription.unsubscribe().await?;
    Ok(())
}
