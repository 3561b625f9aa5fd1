// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Background executor for task flows.
//!
//! Flows run on the tokio runtime with task parallelism capped by a
//! semaphore. When any task fails and no decider or task-level handling
//! absorbed it, every task that completed before the failure is reverted
//! in reverse completion order before the failure is surfaced.

use super::{DeciderDepth, Flow, Task, TaskContext, FLOW_ERROR_KEY};
use common::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_WORKERS: usize = 25;

#[derive(Clone)]
pub struct TaskFlowRunner {
    semaphore: Arc<Semaphore>,
}

impl Default for TaskFlowRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl TaskFlowRunner {
    pub fn new(max_workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Run the flow to completion, reverting completed tasks on failure.
    pub async fn run_flow(&self, flow: Flow, ctx: Arc<TaskContext>) -> Result<()> {
        let name = flow.name().to_string();
        info!("Running flow '{}' ({} task(s))", name, flow.task_count());
        let (result, completed) = execute_flow(flow, ctx.clone(), self.semaphore.clone()).await;
        match result {
            Ok(()) => {
                debug!("Flow '{}' completed successfully.", name);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Flow '{}' failed: {}. Reverting {} completed task(s).",
                    name,
                    err,
                    completed.len()
                );
                ctx.insert(FLOW_ERROR_KEY, json!(err.to_string()));
                for task in completed.iter().rev() {
                    debug!("Reverting task '{}'", task.name());
                    task.revert(&ctx).await;
                }
                Err(err)
            }
        }
    }

    /// Hand the flow to the runtime and return immediately.
    pub fn run_flow_in_background(&self, flow: Flow, ctx: Arc<TaskContext>) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = runner.run_flow(flow, ctx).await {
                warn!("Background flow failed: {}", err);
            }
        })
    }
}

/// Recursive executor. Returns the outcome together with every task that
/// ran to completion below this node, in completion order, so the caller
/// can revert them.
fn execute_flow(
    flow: Flow,
    ctx: Arc<TaskContext>,
    semaphore: Arc<Semaphore>,
) -> BoxFuture<'static, (Result<()>, Vec<Arc<dyn Task>>)> {
    async move {
        match flow {
            Flow::Task(task) => run_task(task, ctx, semaphore).await,
            Flow::Linear { name, children } => {
                let mut completed = Vec::new();
                for child in children {
                    let (result, done) =
                        execute_flow(child, ctx.clone(), semaphore.clone()).await;
                    completed.extend(done);
                    if let Err(err) = result {
                        debug!("Linear flow '{}' aborting remaining children.", name);
                        return (Err(err), completed);
                    }
                }
                (Ok(()), completed)
            }
            Flow::Unordered { name: _, children } => {
                let mut set = JoinSet::new();
                for child in children {
                    let ctx = ctx.clone();
                    let semaphore = semaphore.clone();
                    set.spawn(async move { execute_flow(child, ctx, semaphore).await });
                }
                let mut completed = Vec::new();
                let mut first_err = None;
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok((result, done)) => {
                            completed.extend(done);
                            if let Err(err) = result {
                                if first_err.is_none() {
                                    first_err = Some(err);
                                }
                            }
                        }
                        Err(join_err) => {
                            if first_err.is_none() {
                                first_err = Some(Error::WorkerOperationFailed(format!(
                                    "flow task panicked: {}",
                                    join_err
                                )));
                            }
                        }
                    }
                }
                match first_err {
                    Some(err) => (Err(err), completed),
                    None => (Ok(()), completed),
                }
            }
            Flow::Graph { name, nodes, edges } => {
                let node_count = nodes.len();
                let mut indegree = vec![0usize; node_count];
                for edge in &edges {
                    indegree[edge.to] += 1;
                }
                let mut slots: Vec<Option<Flow>> = nodes.into_iter().map(Some).collect();
                let mut skipped = vec![false; node_count];
                let mut finished = vec![false; node_count];
                let mut launched = vec![false; node_count];
                let mut finished_count = 0usize;
                let mut completed: Vec<Arc<dyn Task>> = Vec::new();
                let mut first_err: Option<Error> = None;

                while finished_count < node_count {
                    let ready: Vec<usize> = (0..node_count)
                        .filter(|&i| !finished[i] && !launched[i] && indegree[i] == 0)
                        .collect();
                    if ready.is_empty() {
                        // malformed graph; nothing left that can run
                        break;
                    }

                    let mut to_run = Vec::new();
                    for i in ready {
                        launched[i] = true;
                        if skipped[i] || first_err.is_some() {
                            if skipped[i] {
                                debug!(
                                    "Graph flow '{}': node {} skipped by decider.",
                                    name, i
                                );
                            }
                            finished[i] = true;
                            finished_count += 1;
                            for edge in edges.iter().filter(|e| e.from == i) {
                                indegree[edge.to] -= 1;
                                if skipped[i] && edge.depth == DeciderDepth::All {
                                    skipped[edge.to] = true;
                                }
                            }
                        } else {
                            to_run.push(i);
                        }
                    }
                    if to_run.is_empty() {
                        continue;
                    }

                    let mut set = JoinSet::new();
                    for i in to_run {
                        if let Some(child) = slots[i].take() {
                            let ctx = ctx.clone();
                            let semaphore = semaphore.clone();
                            set.spawn(async move {
                                (i, execute_flow(child, ctx, semaphore).await)
                            });
                        }
                    }
                    while let Some(joined) = set.join_next().await {
                        match joined {
                            Ok((i, (result, done))) => {
                                finished[i] = true;
                                finished_count += 1;
                                completed.extend(done);
                                match result {
                                    Ok(()) => {
                                        for edge in edges.iter().filter(|e| e.from == i) {
                                            indegree[edge.to] -= 1;
                                            if let Some(decider) = &edge.decider {
                                                if !decider.decide(&ctx) {
                                                    skipped[edge.to] = true;
                                                }
                                            }
                                        }
                                    }
                                    Err(err) => {
                                        if first_err.is_none() {
                                            first_err = Some(err);
                                        }
                                        for edge in edges.iter().filter(|e| e.from == i) {
                                            indegree[edge.to] -= 1;
                                            skipped[edge.to] = true;
                                        }
                                    }
                                }
                            }
                            Err(join_err) => {
                                if first_err.is_none() {
                                    first_err = Some(Error::WorkerOperationFailed(format!(
                                        "flow task panicked: {}",
                                        join_err
                                    )));
                                }
                            }
                        }
                    }
                }

                match first_err {
                    Some(err) => (Err(err), completed),
                    None => (Ok(()), completed),
                }
            }
        }
    }
    .boxed()
}

async fn run_task(
    task: Arc<dyn Task>,
    ctx: Arc<TaskContext>,
    semaphore: Arc<Semaphore>,
) -> (Result<()>, Vec<Arc<dyn Task>>) {
    let permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return (
                Err(Error::WorkerOperationFailed(
                    "taskflow runner semaphore closed".to_string(),
                )),
                Vec::new(),
            )
        }
    };
    let name = task.name();
    debug!("Executing task '{}'", name);
    let outcome = tokio::time::timeout(task.timeout(), task.execute(&ctx)).await;
    drop(permit);
    match outcome {
        Ok(Ok(())) => (Ok(()), vec![task]),
        Ok(Err(err)) => {
            warn!("Task '{}' failed: {}", name, err);
            (Err(err), Vec::new())
        }
        Err(_) => {
            warn!("Task '{}' timed out.", name);
            (
                Err(Error::WorkerOperationFailed(format!(
                    "task '{}' timed out",
                    name
                ))),
                Vec::new(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::NullClientFactory;
    use crate::store::MemoryStore;
    use crate::taskflow::Decider;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_ctx() -> Arc<TaskContext> {
        Arc::new(TaskContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NullClientFactory),
        ))
    }

    type Trace = Arc<Mutex<Vec<String>>>;

    struct TraceTask {
        label: String,
        fail: bool,
        delay_ms: u64,
        trace: Trace,
    }

    impl TraceTask {
        fn new(label: &str, trace: &Trace) -> Self {
            Self {
                label: label.to_string(),
                fail: false,
                delay_ms: 0,
                trace: trace.clone(),
            }
        }

        fn failing(label: &str, trace: &Trace) -> Self {
            Self {
                fail: true,
                ..Self::new(label, trace)
            }
        }
    }

    #[async_trait]
    impl Task for TraceTask {
        fn name(&self) -> String {
            self.label.clone()
        }

        async fn execute(&self, _ctx: &TaskContext) -> Result<()> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.trace
                .lock()
                .unwrap()
                .push(format!("exec:{}", self.label));
            if self.fail {
                return Err(Error::WorkerOperationFailed(format!(
                    "{} exploded",
                    self.label
                )));
            }
            Ok(())
        }

        async fn revert(&self, _ctx: &TaskContext) {
            self.trace
                .lock()
                .unwrap()
                .push(format!("revert:{}", self.label));
        }
    }

    struct KeyDecider {
        key: String,
    }

    impl Decider for KeyDecider {
        fn decide(&self, ctx: &TaskContext) -> bool {
            ctx.get(&self.key) == Some(serde_json::json!(true))
        }
    }

    struct SetKeyTask {
        key: String,
        value: bool,
    }

    #[async_trait]
    impl Task for SetKeyTask {
        fn name(&self) -> String {
            format!("set-{}", self.key)
        }

        async fn execute(&self, ctx: &TaskContext) -> Result<()> {
            ctx.insert(self.key.clone(), serde_json::json!(self.value));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_linear_flow_runs_in_order() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut flow = Flow::linear("ordered");
        for label in ["a", "b", "c"] {
            flow.add(Flow::task(TraceTask::new(label, &trace)));
        }
        let runner = TaskFlowRunner::new(4);
        runner.run_flow(flow, test_ctx()).await.unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["exec:a", "exec:b", "exec:c"]
        );
    }

    #[tokio::test]
    async fn test_linear_failure_reverts_in_reverse_order() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut flow = Flow::linear("failing");
        flow.add(Flow::task(TraceTask::new("a", &trace)));
        flow.add(Flow::task(TraceTask::new("b", &trace)));
        flow.add(Flow::task(TraceTask::failing("boom", &trace)));
        flow.add(Flow::task(TraceTask::new("never", &trace)));

        let runner = TaskFlowRunner::new(4);
        let result = runner.run_flow(flow, test_ctx()).await;
        assert!(result.is_err());
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["exec:a", "exec:b", "exec:boom", "revert:b", "revert:a"]
        );
    }

    #[tokio::test]
    async fn test_unordered_children_all_run() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut flow = Flow::unordered("parallel");
        for label in ["a", "b", "c", "d"] {
            flow.add(Flow::task(TraceTask::new(label, &trace)));
        }
        let runner = TaskFlowRunner::new(4);
        runner.run_flow(flow, test_ctx()).await.unwrap();
        let mut seen = trace.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["exec:a", "exec:b", "exec:c", "exec:d"]);
    }

    #[tokio::test]
    async fn test_unordered_siblings_finish_despite_failure() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut flow = Flow::unordered("parallel");
        flow.add(Flow::task(TraceTask::failing("boom", &trace)));
        let mut slow = TraceTask::new("slow", &trace);
        slow.delay_ms = 30;
        flow.add(Flow::task(slow));

        let runner = TaskFlowRunner::new(4);
        let result = runner.run_flow(flow, test_ctx()).await;
        assert!(result.is_err());
        let seen = trace.lock().unwrap().clone();
        assert!(seen.contains(&"exec:slow".to_string()));
        // the surviving sibling is compensated afterwards
        assert!(seen.contains(&"revert:slow".to_string()));
    }

    #[tokio::test]
    async fn test_graph_decider_skips_target_only() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut graph = Flow::graph("gated");
        graph.add(Flow::task(SetKeyTask {
            key: "go".to_string(),
            value: false,
        }));
        let mut gated = Flow::linear("gated-branch");
        gated.add(Flow::task(TraceTask::new("gated", &trace)));
        graph.add(gated);
        graph.add(Flow::task(TraceTask::new("sibling", &trace)));
        graph.link(
            0,
            1,
            Some(Arc::new(KeyDecider {
                key: "go".to_string(),
            })),
            DeciderDepth::Flow,
        );

        let runner = TaskFlowRunner::new(4);
        runner.run_flow(graph, test_ctx()).await.unwrap();
        let seen = trace.lock().unwrap().clone();
        assert!(!seen.contains(&"exec:gated".to_string()));
        assert!(seen.contains(&"exec:sibling".to_string()));
    }

    #[tokio::test]
    async fn test_graph_decider_allows_target_when_true() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let mut graph = Flow::graph("gated");
        graph.add(Flow::task(SetKeyTask {
            key: "go".to_string(),
            value: true,
        }));
        graph.add(Flow::task(TraceTask::new("gated", &trace)));
        graph.link(
            0,
            1,
            Some(Arc::new(KeyDecider {
                key: "go".to_string(),
            })),
            DeciderDepth::Flow,
        );

        let runner = TaskFlowRunner::new(4);
        runner.run_flow(graph, test_ctx()).await.unwrap();
        assert!(trace
            .lock()
            .unwrap()
            .contains(&"exec:gated".to_string()));
    }

    #[tokio::test]
    async fn test_empty_flow_detection() {
        let flow = Flow::unordered("empty");
        assert!(flow.is_empty());
        let mut nonempty = Flow::linear("one");
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        nonempty.add(Flow::task(TraceTask::new("a", &trace)));
        assert!(!nonempty.is_empty());
        assert_eq!(nonempty.task_count(), 1);
    }
}
