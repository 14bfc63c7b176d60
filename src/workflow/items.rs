//! Work Item Fan-Out
//!
//! Runs one stage's work items independently with a concurrency limit. An
//! item's failure is captured into its failure record and never aborts its
//! siblings. On cancellation, pending and in-flight items become `cancelled`.

use std::future::Future;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{Finding, Result, StageResult, WorkItem};

pub async fn process_items<F, Fut>(
    stage: &str,
    items: Vec<WorkItem>,
    concurrency: usize,
    cancel: &CancellationToken,
    process: F,
) -> StageResult
where
    F: Fn(WorkItem) -> Fut,
    Fut: Future<Output = Result<Vec<Finding>>>,
{
    let outcomes: Vec<(WorkItem, Vec<Finding>)> = futures::stream::iter(items)
        .map(|item| {
            let cancel = cancel.clone();
            let work = process(item.clone());
            async move {
                if cancel.is_cancelled() {
                    return (item.cancel(stage), Vec::new());
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => (item.cancel(stage), Vec::new()),
                    outcome = work => match outcome {
                        Ok(findings) => {
                            debug!(stage, item = %item.id, findings = findings.len(), "Item succeeded");
                            (item.succeed(), findings)
                        }
                        Err(e) => {
                            if !e.is_cancelled() {
                                warn!(stage, item = %item.id, error = %e, "Item failed");
                            }
                            (item.fail_with(stage, &e), Vec::new())
                        }
                    },
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut items = Vec::with_capacity(outcomes.len());
    let mut findings = Vec::new();
    for (item, item_findings) in outcomes {
        items.push(item);
        findings.extend(item_findings);
    }
    StageResult::from_items(stage, items, findings)
}
