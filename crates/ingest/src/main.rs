use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use ingest::{Ingest, Verdict};
use models::{results_exchange, to_validate_exchange, MatchMessage, MATCHED_EXCHANGE};

/// Performs metadata acceptance checks on matched submissions.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the message broker.
    #[clap(long, env = "BROKER_URL", default_value = "nats://127.0.0.1:4222")]
    broker_url: String,
    /// Broker stream holding the pipeline exchanges.
    #[clap(long, env = "BROKER_STREAM", default_value = "inbound")]
    broker_stream: String,
    /// Object-store endpoint.
    #[clap(long, env = "S3_ENDPOINT")]
    s3_endpoint: String,
    /// Base URL of the Onyx record service.
    #[clap(long, env = "ONYX_DOMAIN")]
    onyx_url: url::Url,
    /// Onyx API token.
    #[clap(long, env = "ONYX_TOKEN", hide_env_values = true)]
    onyx_token: String,
    /// Concurrent unacknowledged matches.
    #[clap(long, default_value = "16")]
    prefetch: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(broker = %args.broker_url, s3 = %args.s3_endpoint, "started!");

    let store = objstore::Store::connect(&objstore::Config {
        endpoint: args.s3_endpoint.clone(),
    })
    .await;
    let onyx = onyx_client::Client::new(onyx_client::Config {
        base_url: args.onyx_url.clone(),
        token: args.onyx_token.clone(),
    });
    let ingest = Ingest::new(store, onyx);

    let fabric = fabric::Fabric::connect(&fabric::Config {
        url: args.broker_url.clone(),
        stream: args.broker_stream.clone(),
    })
    .await
    .context("connecting to message broker")?;

    let mut matches = fabric
        .subscribe(
            MATCHED_EXCHANGE,
            "ingest",
            fabric::SubscribeOpts {
                prefetch: args.prefetch,
                ..Default::default()
            },
        )
        .await
        .context("subscribing to matches")?;

    loop {
        let delivery = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("caught signal; exiting...");
                return Ok(());
            }
            delivery = matches.next() => delivery.context("receiving match")?,
        };

        let matched: MatchMessage = match delivery.decode() {
            Ok(matched) => matched,
            Err(err) => {
                tracing::error!(error = %err, "undecodable match message, rejecting");
                delivery.reject().await?;
                continue;
            }
        };

        let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        match ingest.process(matched, now_ns).await {
            Verdict::Forward(payload) => {
                fabric
                    .send(&to_validate_exchange(&payload.project), &payload)
                    .await
                    .context("forwarding payload to validator")?;
                delivery.ack().await?;
            }
            Verdict::Drop(payload) => {
                fabric
                    .send(&results_exchange(&payload.project, &payload.site), &payload)
                    .await
                    .context("reporting dropped payload")?;
                delivery.ack().await?;
            }
            Verdict::Retry { reason } => {
                tracing::error!(%reason, "transient ingest failure, requeueing");
                delivery.requeue().await?;
            }
        }
    }
}
