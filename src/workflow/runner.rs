//! Stage Runner
//!
//! Executes a validated workflow:
//! - every stage whose upstreams are all terminal is spawned on a `JoinSet`
//! - stages without an edge between them run concurrently
//! - a failed mandatory upstream fails the dependent with `StageStartError`,
//!   which cascades further downstream
//! - a pipeline timeout cancels the run token; stages not yet started end `cancelled`
//!
//! The join loop is the only writer of `PipelineState`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use super::dag::Workflow;
use super::progress::{MessageLevel, ProgressTracker};
use super::stage::StageContext;
use super::state::{PipelineState, PipelineStatus};
use crate::scoring::ConfidenceScore;
use crate::types::{RunId, StageResult, StageStartError, StageStatus};

pub struct WorkflowRunner {
    workflow: Arc<Workflow>,
    timeout: Option<Duration>,
    progress: ProgressTracker,
}

impl WorkflowRunner {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
            timeout: None,
            progress: ProgressTracker::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Run to completion. Cancelling `cancel` stops new work after the next tick.
    pub async fn run(
        &self,
        run_id: RunId,
        query: &str,
        cancel: &CancellationToken,
    ) -> PipelineState {
        let nodes = &self.workflow.nodes;
        let names = self.workflow.stage_names();
        let token = cancel.child_token();
        let mut state = PipelineState::new(run_id.clone(), query, &names);
        let mut join_set: JoinSet<(usize, StageResult)> = JoinSet::new();
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut timed_out = false;

        self.progress.start(nodes.len());
        info!(run_id = %run_id, stages = nodes.len(), "Pipeline started");

        loop {
            let mut start_failures = false;

            if !token.is_cancelled() {
                for (idx, node) in nodes.iter().enumerate() {
                    let name = node.name();
                    if state.stage_status(name) != Some(StageStatus::Idle) {
                        continue;
                    }
                    let upstream_terminal = node.deps.iter().all(|d| {
                        state
                            .stage_status(&d.upstream)
                            .is_some_and(|s| s.is_terminal())
                    });
                    if !upstream_terminal {
                        continue;
                    }

                    let missing: Vec<String> = node
                        .deps
                        .iter()
                        .filter(|d| {
                            d.mandatory
                                && !state
                                    .stage_status(&d.upstream)
                                    .is_some_and(|s| s.produced_output())
                        })
                        .map(|d| d.upstream.clone())
                        .collect();

                    if !missing.is_empty() {
                        let err = StageStartError {
                            stage: name.to_string(),
                            missing_upstream: missing,
                        };
                        warn!(stage = name, error = %err, "Stage not started");
                        self.progress.message(MessageLevel::Error, err.to_string());
                        let result = StageResult::start_failed(&err);
                        self.complete(&mut state, result);
                        start_failures = true;
                        continue;
                    }

                    // Upstream handles in declaration order
                    let upstream: Vec<Arc<StageResult>> = nodes
                        .iter()
                        .filter(|n| node.deps.iter().any(|d| d.upstream == n.name()))
                        .filter_map(|n| state.result(n.name()).cloned())
                        .collect();

                    state.mark_running(name);
                    state.advance(node.stage.phase());
                    self.progress.stage_started(name);
                    info!(stage = name, "Stage started");

                    let ctx = StageContext::new(
                        run_id.clone(),
                        query,
                        upstream,
                        token.clone(),
                        self.progress.clone(),
                    );
                    let stage = Arc::clone(&node.stage);
                    let span = info_span!("stage", stage = name);
                    join_set.spawn(
                        async move {
                            let started = Instant::now();
                            let name = stage.name().to_string();
                            let outcome = AssertUnwindSafe(stage.run(ctx)).catch_unwind().await;
                            let result = match outcome {
                                Ok(Ok(result)) => result,
                                Ok(Err(e)) => {
                                    error!(error = %e, "Stage failed");
                                    StageResult::failed(&name, e.to_string())
                                }
                                Err(_) => {
                                    error!("Stage panicked");
                                    StageResult::failed(&name, "stage panicked")
                                }
                            };
                            (idx, result.with_elapsed_ms(started.elapsed().as_millis() as u64))
                        }
                        .instrument(span),
                    );
                }
            }

            if join_set.is_empty() {
                if start_failures && !token.is_cancelled() {
                    // Start failures may unblock further dependents
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok((idx, result))) => {
                        let mut result = result;
                        if let Some(node) = nodes.get(idx) {
                            // Results are keyed by the declared name
                            result.stage = node.name().to_string();
                        }
                        self.complete(&mut state, result);
                    }
                    Some(Err(e)) => error!(error = %e, "Stage task aborted"),
                    None => {}
                },
                _ = token.cancelled(), if !state.is_cancelled() => {
                    warn!("Pipeline cancelled; waiting for in-flight stages");
                    state.mark_cancelled(false);
                }
                _ = sleep_until(deadline), if deadline.is_some() && !timed_out => {
                    warn!(timeout_secs = self.timeout.map(|t| t.as_secs()), "Pipeline timed out");
                    timed_out = true;
                    state.mark_cancelled(true);
                    token.cancel();
                }
            }
        }

        if token.is_cancelled() {
            state.mark_cancelled(timed_out);
        }

        // Anything left never started (or its task was lost)
        for name in &names {
            match state.stage_status(name) {
                Some(StageStatus::Idle) => {
                    state.record(StageResult::cancelled(name));
                }
                Some(StageStatus::Running) => {
                    state.record(StageResult::failed(name, "stage task lost"));
                }
                _ => {}
            }
        }

        let status = state.finish();
        let summary = format!(
            "{} ({} stages, failed: [{}])",
            status,
            names.len(),
            state.failed_stages().join(", ")
        );
        info!(run_id = %run_id, status = %status, "Pipeline finished");
        self.progress.finish(status == PipelineStatus::Done, &summary);
        state
    }

    fn complete(&self, state: &mut PipelineState, result: StageResult) {
        let failed = result.failures.len();
        info!(
            stage = %result.stage,
            status = %result.status,
            succeeded = result.succeeded,
            failed,
            "Stage finished"
        );
        let result = state.record(result);

        let analysis: Vec<Arc<StageResult>> = self
            .workflow
            .nodes
            .iter()
            .filter(|n| n.stage.phase() == PipelineStatus::Analyzing)
            .filter_map(|n| state.result(n.name()).cloned())
            .collect();
        let running = ConfidenceScore::from_results(analysis.iter().map(Arc::as_ref));

        self.progress.stage_completed(
            &result.stage,
            result.status,
            result.succeeded,
            failed,
            running.value,
        );
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CassandraError, Finding, FindingKind, ItemStatus, Result, Severity, SourceOrder, WorkItem,
    };
    use crate::workflow::items::process_items;
    use crate::workflow::stage::Stage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Items listed as (delay_ms, fails)
    struct ItemStage {
        name: &'static str,
        items: Vec<(u64, bool)>,
    }

    #[async_trait]
    impl Stage for ItemStage {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, ctx: StageContext) -> Result<StageResult> {
            let items: Vec<WorkItem> = self
                .items
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    WorkItem::new(
                        format!("{}-{}", self.name, i),
                        format!("{}/src-{}", self.name, i),
                        SourceOrder::document(i),
                    )
                })
                .collect();
            let plan = self.items.clone();
            let name = self.name;
            Ok(process_items(name, items, 4, &ctx.cancel, |item| {
                let (delay, fails) = plan[item.order.document];
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if fails {
                        return Err(CassandraError::Provider("scripted failure".into()));
                    }
                    Ok(vec![Finding::new(
                        name,
                        &item,
                        0,
                        FindingKind::TextEvidence,
                        Severity::Medium,
                        item.id.clone(),
                    )])
                }
            })
            .await)
        }
    }

    /// Records what it saw from its upstreams
    struct FanIn {
        seen: Arc<Mutex<Vec<String>>>,
        upstream_terminal: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Stage for FanIn {
        fn name(&self) -> &str {
            "aggregate"
        }

        fn phase(&self) -> PipelineStatus {
            PipelineStatus::Aggregating
        }

        async fn run(&self, ctx: StageContext) -> Result<StageResult> {
            let terminal = ctx
                .upstream_results()
                .iter()
                .all(|r| r.status.is_terminal() && r.items.iter().all(|i| i.is_terminal()));
            *self.upstream_terminal.lock().unwrap() = terminal && ctx.upstream_results().len() == 2;
            *self.seen.lock().unwrap() =
                ctx.merged_findings().into_iter().map(|f| f.quote).collect();
            Ok(StageResult::from_items("aggregate", Vec::new(), Vec::new()))
        }
    }

    struct Failing;

    #[async_trait]
    impl Stage for Failing {
        fn name(&self) -> &str {
            "collect"
        }

        async fn run(&self, _ctx: StageContext) -> Result<StageResult> {
            Err(CassandraError::Provider("search backend down".into()))
        }
    }

    fn item_stage(name: &'static str, items: Vec<(u64, bool)>) -> Arc<ItemStage> {
        Arc::new(ItemStage { name, items })
    }

    #[tokio::test]
    async fn test_fan_in_after_both_terminal_in_source_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let upstream_terminal = Arc::new(Mutex::new(false));
        let workflow = Workflow::builder()
            // Declared first but finishes last
            .stage(item_stage("mine", vec![(60, false), (5, true)]))
            .stage(item_stage("audit", vec![(30, false), (1, false), (10, true)]))
            .stage(Arc::new(FanIn {
                seen: Arc::clone(&seen),
                upstream_terminal: Arc::clone(&upstream_terminal),
            }))
            .edge("mine", "aggregate", true)
            .edge("audit", "aggregate", true)
            .build()
            .unwrap();

        let state = WorkflowRunner::new(workflow)
            .run(RunId::new("r1"), "q", &CancellationToken::new())
            .await;

        assert_eq!(state.status(), PipelineStatus::Done);
        assert!(*upstream_terminal.lock().unwrap());
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["mine-0", "audit-0", "audit-1"]
        );
        assert_eq!(state.stage_status("mine"), Some(StageStatus::Degraded));
        let audit = state.result("audit").unwrap();
        assert_eq!((audit.attempted, audit.succeeded), (3, 2));
    }

    #[tokio::test]
    async fn test_missing_mandatory_upstream_cascades() {
        let workflow = Workflow::builder()
            .stage(Arc::new(Failing))
            .stage(item_stage("mine", vec![(1, false)]))
            .stage(item_stage("write", vec![(1, false)]))
            .stage(item_stage("notes", vec![(1, false)]))
            .edge("collect", "mine", true)
            .edge("mine", "write", true)
            .edge("collect", "notes", false)
            .build()
            .unwrap();

        let state = WorkflowRunner::new(workflow)
            .run(RunId::new("r2"), "q", &CancellationToken::new())
            .await;

        assert_eq!(state.stage_status("collect"), Some(StageStatus::Failed));
        assert_eq!(state.stage_status("mine"), Some(StageStatus::Failed));
        assert!(
            state.result("mine").unwrap().error.as_deref().unwrap().contains("collect")
        );
        assert_eq!(state.stage_status("write"), Some(StageStatus::Failed));
        // Optional dependency does not block
        assert_eq!(state.stage_status("notes"), Some(StageStatus::Completed));
        assert_eq!(state.status(), PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_leaves_no_pending_items() {
        let workflow = Workflow::builder()
            .stage(item_stage("mine", vec![(1, false), (5_000, false), (5_000, false)]))
            .stage(item_stage("write", vec![(1, false)]))
            .edge("mine", "write", true)
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let state = WorkflowRunner::new(workflow)
            .run(RunId::new("r3"), "q", &cancel)
            .await;

        let mine = state.result("mine").unwrap();
        assert!(mine.items.iter().all(|i| i.is_terminal()));
        assert_eq!(mine.items[0].status(), ItemStatus::Success);
        assert_eq!(mine.items[1].status(), ItemStatus::Cancelled);
        assert_eq!(state.stage_status("write"), Some(StageStatus::Cancelled));
        assert!(state.is_cancelled());
        assert_eq!(state.status(), PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_cancels_run() {
        let workflow = Workflow::builder()
            .stage(item_stage("mine", vec![(5_000, false)]))
            .build()
            .unwrap();

        let started = Instant::now();
        let state = WorkflowRunner::new(workflow)
            .with_timeout(Duration::from_millis(40))
            .run(RunId::new("r4"), "q", &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(state.timed_out());
        assert_eq!(state.status(), PipelineStatus::Failed);
        assert_eq!(
            state.result("mine").unwrap().items[0].status(),
            ItemStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_progress_events_emitted() {
        let workflow = Workflow::builder()
            .stage(item_stage("mine", vec![(1, false), (1, true)]))
            .build()
            .unwrap();
        let runner = WorkflowRunner::new(workflow);
        let mut rx = runner.progress().subscribe();

        runner
            .run(RunId::new("r5"), "q", &CancellationToken::new())
            .await;

        let mut confidence = None;
        while let Ok(event) = rx.try_recv() {
            if let crate::workflow::progress::ProgressEvent::StageCompleted {
                running_confidence,
                ..
            } = event
            {
                confidence = Some(running_confidence);
            }
        }
        assert_eq!(confidence, Some(5.0));
    }
}
