use std::sync::Arc;

use anyhow::Context;
use assembly_validator::{HttpRegistry, Terminal, Validator};
use clap::Parser;
use models::{to_validate_exchange, ValidationPayload};
use validator::exec::Workflow;
use validator::pool::{Outcome, Pool, Worker};
use validator::report;

/// Runs the bacterial-assembly validation workflow for approved
/// submissions.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Project this validator serves.
    #[clap(long, default_value = "assembly")]
    project: String,
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
    /// Genome registry submission endpoint.
    #[clap(long, env = "REGISTRY_ENDPOINT")]
    registry_endpoint: url::Url,
    /// Genome registry API key.
    #[clap(long, env = "REGISTRY_API_KEY", hide_env_values = true)]
    registry_api_key: String,
    /// Registry collection submissions land in.
    #[clap(long, env = "REGISTRY_COLLECTION")]
    registry_collection: i64,
    /// Directory holding per-submission workflow results.
    #[clap(long, env = "RESULT_DIR")]
    result_dir: std::path::PathBuf,
    /// Path of the workflow executable.
    #[clap(long, env = "WORKFLOW_EXECUTABLE", default_value = "nextflow")]
    workflow_executable: std::path::PathBuf,
    /// Workflow repository in org/repo form.
    #[clap(long, default_value = "climb-tre/assembly-polisher")]
    workflow_repo: String,
    #[clap(long, default_value = "main")]
    workflow_branch: String,
    /// Optional workflow configuration file.
    #[clap(long)]
    workflow_config: Option<std::path::PathBuf>,
    /// Workflow profile.
    #[clap(long)]
    workflow_profile: Option<String>,
    /// Hard workflow timeout.
    #[clap(long, default_value = "3h")]
    workflow_timeout: humantime::Duration,
    /// Parallel validation workers.
    #[clap(long, default_value = "5")]
    n_workers: usize,
    /// Retries for recoverable validation failures.
    #[clap(long, default_value = "2")]
    max_retries: u32,
}

struct ValidateTask {
    delivery: Option<fabric::Delivery>,
    payload: ValidationPayload,
}

struct ValidateWorker {
    project: String,
    validator: Validator<onyx_client::Client, HttpRegistry>,
    fabric: fabric::Fabric,
}

#[async_trait::async_trait]
impl Worker for ValidateWorker {
    type Task = ValidateTask;

    async fn run(&self, task: &mut ValidateTask, _attempt: u32) -> Outcome {
        if task.payload.project != self.project {
            tracing::error!(project = %task.payload.project, "payload for another project, rejecting");
            if let Some(delivery) = task.delivery.take() {
                if let Err(err) = delivery.reject().await {
                    tracing::error!(error = %err, "failed to reject delivery");
                }
            }
            return Outcome::Done;
        }

        match self.validator.validate(&mut task.payload).await {
            Terminal::Committed => self.finish(task, true).await,
            Terminal::Report => self.finish(task, false).await,
            Terminal::Transient(reason) => Outcome::Retry(reason),
        }
    }

    async fn exhausted(&self, task: ValidateTask, last_reason: String) {
        tracing::error!(
            uuid = %task.payload.uuid,
            %last_reason,
            "validation exhausted its retries, returning delivery to the queue"
        );
        if let Some(delivery) = task.delivery {
            if let Err(err) = delivery.requeue().await {
                tracing::error!(error = %err, "failed to requeue delivery");
            }
        }
    }
}

impl ValidateWorker {
    async fn finish(&self, task: &mut ValidateTask, committed: bool) -> Outcome {
        if committed {
            if let Err(err) = report::notify_new_artifact(&self.fabric, &task.payload).await {
                return Outcome::Retry(format!("failed to publish new-artifact: {err:#}"));
            }
        }
        if let Err(err) = report::report(&self.fabric, &task.payload).await {
            return Outcome::Retry(format!("failed to publish result: {err:#}"));
        }

        if let Some(delivery) = task.delivery.take() {
            if let Err(err) = delivery.ack().await {
                tracing::error!(error = %err, "failed to acknowledge delivery");
            }
        }
        Outcome::Done
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(
        project = %args.project,
        broker = %args.broker_url,
        workers = args.n_workers,
        "started!"
    );

    let store = objstore::Store::connect(&objstore::Config {
        endpoint: args.s3_endpoint.clone(),
    })
    .await;
    let records = onyx_client::Client::new(onyx_client::Config {
        base_url: args.onyx_url.clone(),
        token: args.onyx_token.clone(),
    });
    let registry = HttpRegistry::new(
        args.registry_endpoint.clone(),
        args.registry_api_key.clone(),
        args.registry_collection,
    );

    let fabric = fabric::Fabric::connect(&fabric::Config {
        url: args.broker_url.clone(),
        stream: args.broker_stream.clone(),
    })
    .await
    .context("connecting to message broker")?;

    let validator = Validator {
        records,
        registry,
        store,
        workflow: Workflow {
            executable: args.workflow_executable.clone(),
            repo: args.workflow_repo.clone(),
            branch: args.workflow_branch.clone(),
            config: args.workflow_config.clone(),
            profile: args.workflow_profile.clone(),
            timeout: *args.workflow_timeout,
        },
        result_dir: args.result_dir.clone(),
    };

    let worker = ValidateWorker {
        project: args.project.clone(),
        validator,
        fabric: fabric.clone(),
    };
    let pool = Arc::new(Pool::new(worker, args.n_workers, args.max_retries));

    let mut payloads = fabric
        .subscribe(
            &to_validate_exchange(&args.project),
            "validator",
            fabric::SubscribeOpts {
                prefetch: args.n_workers,
                ack_wait: *args.workflow_timeout + std::time::Duration::from_secs(1800),
            },
        )
        .await
        .context("subscribing to validation payloads")?;

    loop {
        let permit = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("caught signal; exiting...");
                return Ok(());
            }
            permit = pool.acquire() => permit,
        };

        let delivery = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("caught signal; exiting...");
                return Ok(());
            }
            delivery = payloads.next() => delivery.context("receiving payload")?,
        };

        let payload: ValidationPayload = match delivery.decode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "undecodable validation payload, rejecting");
                delivery.reject().await?;
                continue;
            }
        };

        let _ = pool.spawn(
            permit,
            ValidateTask {
                delivery: Some(delivery),
                payload,
            },
        );
    }
}
