//! Transformation stages and the boundary code that runs them.
//!
//! A [`Stage`] is a single transformation unit: it consumes the current byte
//! stream of a document and produces the next one. Stages know nothing about
//! channels; [`spawn_stage`] wires a stage between an input and an output
//! channel and owns everything around the stage body:
//!
//! ```text
//!   input rx ──► dispatch loop ──► worker (one per context) ──► output tx
//!                    │                 │
//!                    │                 ├─ error already set? pass through
//!                    │                 ├─ status "<stage>: started"
//!                    │                 ├─ Stage::process
//!                    │                 └─ status "<stage>: finished" / "failed: …"
//!                    └─ stops on cancellation or closed input
//! ```
//!
//! Built-in stages are selected by name with [`build_stages`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn, Instrument};

use crate::config::{Config, Secrets};
use crate::error::PipelineError;
use crate::models::{ByteStream, SourceDocument, TransformContext};
use crate::stage_bundle::BundleStage;
use crate::stage_cleanup::CleanupStage;
use crate::stage_ocr::OcrStage;
use crate::stage_staging::StagingStage;
use crate::store::DocumentStore;
use crate::supervisor::{CancelScope, FailureSupervisor};

// ═══════════════════════════════════════════════════════════════════════
// Stage Trait
// ═══════════════════════════════════════════════════════════════════════

/// A single transformation step in the pipeline.
///
/// # Lifecycle
///
/// 1. [`initialize`](Stage::initialize) is called once while the pipeline
///    is built, in declared order. An error aborts the build.
/// 2. [`process`](Stage::process) is called concurrently, once per document
///    that reaches the stage without an error.
/// 3. [`teardown`](Stage::teardown) is called after the pipeline has shut
///    down and every worker has exited.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in status strings and logs.
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Transforms `input` into the document's next representation.
    ///
    /// Return a [`PipelineError`] (wrapped in `anyhow`) to report a failure
    /// callers can distinguish; any other error becomes
    /// [`PipelineError::Stage`].
    async fn process(&self, doc: &SourceDocument, input: ByteStream) -> Result<ByteStream>;

    async fn teardown(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════
// Stage Runner
// ═══════════════════════════════════════════════════════════════════════

/// Shared handles every stage runner needs.
#[derive(Clone)]
pub(crate) struct StageEnv {
    pub store: Arc<dyn DocumentStore>,
    pub scope: CancelScope,
    pub tracker: TaskTracker,
    pub supervisor: Arc<FailureSupervisor>,
    /// Maximum concurrently running workers per stage; 0 is unbounded.
    pub concurrency: usize,
}

/// Starts the dispatch loop for `stage` and returns its output channel.
pub(crate) fn spawn_stage(
    stage: Arc<dyn Stage>,
    mut input: mpsc::Receiver<TransformContext>,
    env: StageEnv,
) -> mpsc::Receiver<TransformContext> {
    let (output, rx) = mpsc::channel(1);
    let limit = (env.concurrency > 0).then(|| Arc::new(Semaphore::new(env.concurrency)));
    let span = tracing::debug_span!("stage", stage = stage.name());

    let tracker = env.tracker.clone();
    tracker.spawn(
        async move {
            loop {
                let ctx = tokio::select! {
                    biased;
                    _ = env.scope.cancelled() => break,
                    msg = input.recv() => match msg {
                        Some(ctx) => ctx,
                        None => break,
                    },
                };

                let permit = match &limit {
                    Some(sem) => tokio::select! {
                        biased;
                        _ = env.scope.cancelled() => break,
                        permit = sem.clone().acquire_owned() => match permit {
                            Ok(p) => Some(p),
                            Err(_) => break,
                        },
                    },
                    None => None,
                };

                let worker = run_worker(stage.clone(), ctx, output.clone(), env.clone());
                env.tracker.spawn(
                    async move {
                        worker.await;
                        drop(permit);
                    }
                    .in_current_span(),
                );
            }
            debug!("dispatch loop stopped");
        }
        .instrument(span),
    );

    rx
}

async fn set_status(store: &dyn DocumentStore, record_id: &str, status: String) {
    if let Err(e) = store.update_status(record_id, Utc::now(), &status).await {
        warn!(record_id, status = %status, "failed to record status: {:#}", e);
    }
}

async fn run_worker(
    stage: Arc<dyn Stage>,
    mut ctx: TransformContext,
    output: mpsc::Sender<TransformContext>,
    env: StageEnv,
) {
    let name = stage.name().to_string();

    if ctx.error.is_none() {
        match ctx.stream.take() {
            Some(stream) => {
                set_status(env.store.as_ref(), &ctx.record_id, format!("{}: started", name)).await;

                let result = tokio::select! {
                    biased;
                    _ = env.scope.cancelled() => {
                        debug!(record_id = %ctx.record_id, "abandoned mid-stage");
                        return;
                    }
                    result = stage.process(&ctx.source, stream) => result,
                };

                match result {
                    Ok(out) => {
                        ctx.stream = Some(out);
                        set_status(env.store.as_ref(), &ctx.record_id, format!("{}: finished", name))
                            .await;
                    }
                    Err(e) => {
                        let err = PipelineError::from_stage(&name, e);
                        error!(
                            source_id = %ctx.source.source_id,
                            record_id = %ctx.record_id,
                            "stage failed: {}",
                            err
                        );
                        set_status(
                            env.store.as_ref(),
                            &ctx.record_id,
                            format!("{}: failed: {}", name, err),
                        )
                        .await;
                        env.supervisor.record(&err);
                        ctx.fail(err);
                    }
                }
            }
            None => ctx.fail(PipelineError::Stage {
                stage: name.clone(),
                message: "no input stream".to_string(),
            }),
        }
    } else {
        // Close whatever the upstream left open.
        ctx.stream = None;
        debug!(record_id = %ctx.record_id, "passing errored context through");
    }

    tokio::select! {
        biased;
        _ = env.scope.cancelled() => {}
        sent = output.send(ctx) => {
            if sent.is_err() {
                debug!("downstream closed, dropping context");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Stages
// ═══════════════════════════════════════════════════════════════════════

/// Builds the configured stage chain, in `pipeline.stages` order.
pub fn build_stages(config: &Config, secrets: &Secrets) -> Result<Vec<Arc<dyn Stage>>> {
    let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(config.pipeline.stages.len());
    for name in &config.pipeline.stages {
        stages.push(build_stage(name, config, secrets)?);
    }
    Ok(stages)
}

fn build_stage(name: &str, config: &Config, secrets: &Secrets) -> Result<Arc<dyn Stage>> {
    let stage: Arc<dyn Stage> = match name {
        "staging" => Arc::new(StagingStage::new(config.staging_folder())),
        "ocr" => {
            let (Some(app_id), Some(app_key)) = (&secrets.mathpix_app_id, &secrets.mathpix_app_key)
            else {
                bail!("MATHPIX_APP_ID and MATHPIX_APP_KEY are required by the ocr stage");
            };
            Arc::new(OcrStage::new(
                &config.ocr.api_url,
                app_id,
                app_key,
                Duration::from_secs(config.ocr.poll_interval_secs),
                Duration::from_secs(config.ocr.timeout_secs),
            )?)
        }
        "cleanup" => {
            let Some(api_key) = &secrets.openai_api_key else {
                bail!("OPENAI_API_KEY is required by the cleanup stage");
            };
            Arc::new(CleanupStage::new(&config.cleanup, api_key)?)
        }
        "bundle" => Arc::new(BundleStage::new(
            config.bundles.clone(),
            config.staging_folder(),
        )),
        other => bail!("Unknown stage: '{}'", other),
    };
    Ok(stage)
}
