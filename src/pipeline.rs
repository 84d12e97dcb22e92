//! Pipeline coordinator.
//!
//! [`PipelineBuilder`] wires an ordered list of stages into a chain of
//! capacity-1 channels (N stages ⇒ N+1 channels counting entry and exit)
//! and returns an immutable [`Pipeline`]. The chain's shape never changes
//! after [`PipelineBuilder::build`].
//!
//! # Document lifecycle
//!
//! ```text
//! submit(doc)
//!   ├─ create_document(store, source_id)   AlreadyExists ⇒ no-op
//!   ├─ watcher.open(doc)                   ⇒ TransformContext
//!   ├─ entry tx ─► stage 1 ─► … ─► stage N ─► exit rx ─► collector
//!   │                                                       │
//!   ├─ ◄──────────────── oneshot keyed by record id ────────┘
//!   ├─ close stream, watcher.archive(doc)
//!   └─ status "completed" | "failed: …" | "abandoned"
//! ```
//!
//! Every task the pipeline starts (submissions, dispatch loops, stage
//! workers, the collector) is tracked by one [`TaskTracker`], and every
//! blocking point races the shared [`CancelScope`]. [`Pipeline::shutdown`]
//! returns only after all of them have exited.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{SourceDocument, TransformContext};
use crate::stage::{spawn_stage, Stage, StageEnv};
use crate::store::{Admission, DocumentStore};
use crate::supervisor::{CancelScope, FailureSupervisor};
use crate::watcher::Watcher;

/// Tunables for a pipeline, usually taken from `[pipeline]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub failure_threshold: usize,
    pub failure_window: Duration,
    /// Per-stage worker bound; 0 is unbounded.
    pub stage_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(600),
            stage_concurrency: 0,
        }
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            failure_window: Duration::from_secs(cfg.failure_window_secs),
            stage_concurrency: cfg.stage_concurrency,
        }
    }
}

/// How a submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The document already had a record; nothing was done.
    AlreadyAdmitted { record_id: String },
    Completed { record_id: String },
    Failed {
        record_id: String,
        error: PipelineError,
    },
    /// The pipeline was cancelled before the document came out of the chain.
    Abandoned { record_id: Option<String> },
    /// The admission check itself failed (store unreachable).
    Rejected { reason: String },
}

impl Outcome {
    pub fn record_id(&self) -> Option<&str> {
        match self {
            Outcome::AlreadyAdmitted { record_id }
            | Outcome::Completed { record_id }
            | Outcome::Failed { record_id, .. } => Some(record_id),
            Outcome::Abandoned { record_id } => record_id.as_deref(),
            Outcome::Rejected { .. } => None,
        }
    }
}

pub struct PipelineBuilder {
    store: Arc<dyn DocumentStore>,
    watcher: Arc<dyn Watcher>,
    settings: PipelineSettings,
    stages: Vec<Arc<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        watcher: Arc<dyn Watcher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            watcher,
            settings,
            stages: Vec::new(),
        }
    }

    /// Appends a stage to the chain.
    pub fn add_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn add_stages(mut self, stages: impl IntoIterator<Item = Arc<dyn Stage>>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Initializes every stage in order and starts the channel chain.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn build(self) -> Result<Pipeline> {
        for stage in &self.stages {
            stage
                .initialize()
                .await
                .with_context(|| format!("Failed to initialize stage '{}'", stage.name()))?;
        }

        let scope = CancelScope::new();
        let tracker = TaskTracker::new();
        let supervisor = Arc::new(FailureSupervisor::new(
            self.settings.failure_threshold,
            self.settings.failure_window,
            scope.clone(),
        ));
        let env = StageEnv {
            store: self.store.clone(),
            scope: scope.clone(),
            tracker: tracker.clone(),
            supervisor: supervisor.clone(),
            concurrency: self.settings.stage_concurrency,
        };

        let (entry, mut rx) = mpsc::channel(1);
        for stage in &self.stages {
            rx = spawn_stage(stage.clone(), rx, env.clone());
        }

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        tracker.spawn(collect(rx, routes.clone(), scope.clone()));

        info!(
            stages = ?self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            store = self.watcher.store_name(),
            "pipeline built"
        );

        Ok(Pipeline {
            inner: Arc::new(Inner {
                store: self.store,
                watcher: self.watcher,
                stages: self.stages,
                entry,
                routes,
                scope,
                tracker,
                supervisor,
            }),
        })
    }
}

type Routes = Arc<Mutex<HashMap<String, oneshot::Sender<TransformContext>>>>;

/// Owns the exit channel and hands each finished context to its submitter.
async fn collect(mut exit: mpsc::Receiver<TransformContext>, routes: Routes, scope: CancelScope) {
    loop {
        let ctx = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            msg = exit.recv() => match msg {
                Some(ctx) => ctx,
                None => break,
            },
        };

        let route = routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx.record_id);
        match route {
            Some(tx) => {
                if tx.send(ctx).is_err() {
                    debug!("submitter gone before result arrived");
                }
            }
            None => warn!(record_id = %ctx.record_id, "no submitter waiting for result"),
        }
    }
    debug!("collector stopped");
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    watcher: Arc<dyn Watcher>,
    stages: Vec<Arc<dyn Stage>>,
    entry: mpsc::Sender<TransformContext>,
    routes: Routes,
    scope: CancelScope,
    tracker: TaskTracker,
    supervisor: Arc<FailureSupervisor>,
}

/// A running, immutable stage chain. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn stage_names(&self) -> Vec<&str> {
        self.inner.stages.iter().map(|s| s.name()).collect()
    }

    /// Admits `doc` on its own task. The handle resolves when the document
    /// leaves the pipeline (or was not admitted).
    pub fn submit(&self, doc: SourceDocument) -> JoinHandle<Outcome> {
        let pipeline = self.clone();
        let span = tracing::info_span!("document", source_id = %doc.source_id);
        self.inner
            .tracker
            .spawn(async move { pipeline.process(doc).await }.instrument(span))
    }

    /// Submits every document received on `rx` until it closes or the
    /// pipeline is cancelled.
    pub fn start_monitoring(&self, mut rx: mpsc::Receiver<SourceDocument>) {
        let pipeline = self.clone();
        self.inner.tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = pipeline.inner.scope.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(doc) => {
                            pipeline.submit(doc);
                        }
                        None => {
                            info!("watcher channel closed");
                            break;
                        }
                    },
                }
            }
            debug!("monitor stopped");
        });
    }

    /// Resolves once the pipeline is cancelled, by shutdown or a fatal cause.
    pub async fn cancelled(&self) {
        self.inner.scope.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    /// The fatal cause the pipeline was cancelled with, if any.
    pub fn cause(&self) -> Option<PipelineError> {
        self.inner.scope.cause()
    }

    /// Number of live tasks across the coordinator and every stage.
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Systemic failures inside the supervision window.
    pub fn recent_failures(&self) -> usize {
        self.inner.supervisor.recent_failures()
    }

    /// Cancels the pipeline and waits for every task to exit, then tears the
    /// stages down. Returns the fatal cause if one cancelled the pipeline.
    pub async fn shutdown(&self) -> std::result::Result<(), PipelineError> {
        self.inner.scope.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        for stage in &self.inner.stages {
            stage.teardown().await;
        }
        info!("pipeline stopped");

        match self.inner.scope.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    async fn set_status(&self, record_id: &str, status: &str) {
        if let Err(e) = self
            .inner
            .store
            .update_status(record_id, Utc::now(), status)
            .await
        {
            warn!(record_id, status, "failed to record status: {:#}", e);
        }
    }

    async fn abandon(&self, record_id: String) -> Outcome {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record_id);
        self.set_status(&record_id, "abandoned").await;
        debug!(record_id = %record_id, "abandoned");
        Outcome::Abandoned {
            record_id: Some(record_id),
        }
    }

    async fn process(&self, doc: SourceDocument) -> Outcome {
        let inner = &self.inner;
        if inner.scope.is_cancelled() {
            return Outcome::Abandoned { record_id: None };
        }

        let admission = inner
            .store
            .create_document(inner.watcher.store_name(), &doc.source_id, &doc.name)
            .await;
        let record = match admission {
            Ok(Admission::Created(record)) => record,
            Ok(Admission::AlreadyExists(record)) => {
                warn!(record_id = %record.id, "document already admitted, skipping");
                return Outcome::AlreadyAdmitted {
                    record_id: record.id,
                };
            }
            Err(e) => {
                error!("admission check failed: {:#}", e);
                return Outcome::Rejected {
                    reason: format!("{:#}", e),
                };
            }
        };
        let record_id = record.id;
        info!(record_id = %record_id, name = %doc.name, "document admitted");

        let stream = match inner.watcher.open(&doc).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = PipelineError::SourceUnavailable(format!("{:#}", e));
                error!(record_id = %record_id, "{}", err);
                self.set_status(&record_id, &format!("failed: {}", err)).await;
                inner.supervisor.record(&err);
                return Outcome::Failed {
                    record_id,
                    error: err,
                };
            }
        };

        let source = Arc::new(doc);
        let (tx, rx) = oneshot::channel();
        inner
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record_id.clone(), tx);

        let ctx = TransformContext::new(source.clone(), record_id.clone(), stream);
        tokio::select! {
            biased;
            _ = inner.scope.cancelled() => return self.abandon(record_id).await,
            sent = inner.entry.send(ctx) => {
                if sent.is_err() {
                    return self.abandon(record_id).await;
                }
            }
        }

        let mut ctx = tokio::select! {
            biased;
            _ = inner.scope.cancelled() => return self.abandon(record_id).await,
            result = rx => match result {
                Ok(ctx) => ctx,
                Err(_) => return self.abandon(record_id).await,
            },
        };

        // Closes the final stream.
        ctx.stream = None;

        if let Err(e) = inner.watcher.archive(&source).await {
            error!(record_id = %record_id, "failed to archive source document: {:#}", e);
        }

        match ctx.error {
            None => {
                self.set_status(&record_id, "completed").await;
                info!(record_id = %record_id, "document completed");
                Outcome::Completed { record_id }
            }
            Some(err) => {
                self.set_status(&record_id, &format!("failed: {}", err)).await;
                warn!(record_id = %record_id, "document failed: {}", err);
                Outcome::Failed {
                    record_id,
                    error: err,
                }
            }
        }
    }
}
