use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use matcher::{Action, MatchError, Matcher, StateStore};
use models::{
    results_exchange, EventEnvelope, MatchReport, PipelineConfig, Stage, MATCHED_EXCHANGE,
    PAYLOAD_VERSION, UPLOAD_EXCHANGE,
};

/// Correlates object-store upload events into complete submissions.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the message broker.
    #[clap(long, env = "BROKER_URL", default_value = "nats://127.0.0.1:4222")]
    broker_url: String,
    /// Broker stream holding the pipeline exchanges.
    #[clap(long, env = "BROKER_STREAM", default_value = "inbound")]
    broker_stream: String,
    /// Path of the pipeline configuration document.
    #[clap(long, env = "PIPELINE_CONFIG_JSON")]
    config: std::path::PathBuf,
    /// Path of the matcher's durable state database.
    #[clap(long, env = "MATCHER_STATE_DB", default_value = "matcher-state.sqlite")]
    state_db: std::path::PathBuf,
    /// Base URL of the Onyx record service.
    #[clap(long, env = "ONYX_DOMAIN")]
    onyx_url: url::Url,
    /// Onyx API token.
    #[clap(long, env = "ONYX_TOKEN", hide_env_values = true)]
    onyx_token: String,
    /// Drop incomplete submissions idle for longer than this.
    #[clap(long, default_value = "72h")]
    stale_after: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(
        config = ?args.config,
        broker = %args.broker_url,
        state_db = ?args.state_db,
        "started!"
    );

    let config = PipelineConfig::load(&args.config).context("loading pipeline configuration")?;
    let state = StateStore::open(&args.state_db).context("opening matcher state database")?;
    let onyx = onyx_client::Client::new(onyx_client::Config {
        base_url: args.onyx_url.clone(),
        token: args.onyx_token.clone(),
    });

    let stale_after = chrono::Duration::from_std(*args.stale_after)
        .context("stale-after window out of range")?;
    let mut matcher = Matcher::new(config, state, onyx, stale_after);

    let fabric = fabric::Fabric::connect(&fabric::Config {
        url: args.broker_url.clone(),
        stream: args.broker_stream.clone(),
    })
    .await
    .context("connecting to message broker")?;

    // The matcher is deliberately serial: one event processed to
    // completion before the next is pulled, so a re-upload can never
    // overtake the match it supersedes.
    let mut events = fabric
        .subscribe(UPLOAD_EXCHANGE, "matcher", fabric::SubscribeOpts::default())
        .await
        .context("subscribing to upload events")?;

    let mut sweep = tokio::time::interval(std::time::Duration::from_secs(3600));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("caught signal; exiting...");
                return Ok(());
            }
            _ = sweep.tick() => {
                if let Err(err) = matcher.expire_stale(Utc::now()) {
                    tracing::error!(error = ?err, "stale-submission sweep failed");
                }
            }
            delivery = events.next() => {
                let delivery = delivery.context("receiving upload event")?;
                handle_delivery(&mut matcher, &fabric, delivery).await?;
            }
        }
    }
}

async fn handle_delivery(
    matcher: &mut Matcher<onyx_client::Client>,
    fabric: &fabric::Fabric,
    delivery: fabric::Delivery,
) -> anyhow::Result<()> {
    let envelope: EventEnvelope = match delivery.decode() {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::error!(error = %err, "undecodable upload event, rejecting");
            delivery.reject().await?;
            return Ok(());
        }
    };

    for record in &envelope.records {
        let actions = match matcher.handle_event(record, Utc::now()).await {
            Ok(actions) => actions,
            Err(MatchError::RecordLookup {
                artifact,
                project,
                site,
                source,
            }) => {
                // Surface the outage, then leave the event unacknowledged
                // so it redelivers once the record service recovers.
                tracing::error!(
                    %artifact,
                    error = ?source,
                    "record service unavailable, requeueing event"
                );
                report(
                    fabric,
                    &project,
                    &site,
                    format!("record service lookup failed for artifact {artifact}: {source}"),
                )
                .await;
                delivery.requeue().await?;
                return Ok(());
            }
            Err(err) => {
                tracing::error!(error = ?err, "matcher state failure, requeueing event");
                delivery.requeue().await?;
                return Ok(());
            }
        };

        for action in actions {
            match action {
                Action::Dispatch(message) => {
                    fabric
                        .send(MATCHED_EXCHANGE, &message)
                        .await
                        .context("publishing match")?;
                }
                Action::Report { project, site, error } => {
                    tracing::warn!(%project, %site, %error, "reporting rejected event");
                    report(fabric, &project, &site, error).await;
                }
            }
        }
    }

    delivery.ack().await?;
    Ok(())
}

/// Publish a user-visible matcher failure. Reporting is best-effort: a
/// result the user never sees must not wedge event processing.
async fn report(fabric: &fabric::Fabric, project: &str, site: &str, error: String) {
    let message = MatchReport {
        payload_version: PAYLOAD_VERSION,
        stage: Stage::Matched,
        project: project.to_string(),
        site: site.to_string(),
        errors: vec![error],
        timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
    };

    if let Err(err) = fabric.send(&results_exchange(project, site), &message).await {
        tracing::error!(error = %err, %project, %site, "failed to publish match report");
    }
}
