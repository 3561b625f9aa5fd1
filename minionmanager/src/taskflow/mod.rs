// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Task graph model for background pool and machine workflows.
//!
//! A flow is a tree of tasks composed of three node kinds: linear flows
//! run children in declared order, unordered flows run them concurrently,
//! and graph flows run nodes along explicit edges that may carry a decider
//! gating the edge target.

pub mod runner;

pub use runner::TaskFlowRunner;

use crate::rpc::ClientFactory;
use crate::store::Store;
use async_trait::async_trait;
use common::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared state of one running flow: the store, the peer client factory
/// and a key/value scratch area tasks use to hand results to deciders and
/// downstream tasks.
pub struct TaskContext {
    pub store: Arc<dyn Store>,
    pub clients: Arc<dyn ClientFactory>,
    data: Mutex<HashMap<String, Value>>,
}

impl TaskContext {
    pub fn new(store: Arc<dyn Store>, clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            store,
            clients,
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(key).cloned()
    }
}

/// Key under which the runner records the message of the failure currently
/// being compensated for. Terminal reporting tasks read it on revert.
pub const FLOW_ERROR_KEY: &str = "flow:error";

/// One atomic unit of work inside a flow.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> String;

    /// Upper bound on a single execution; on expiry the task fails and
    /// compensation runs.
    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<()>;

    /// Compensation hook, called in reverse completion order when the
    /// enclosing flow fails. Must not fail; problems are logged.
    async fn revert(&self, _ctx: &TaskContext) {}
}

/// Gate evaluated after an edge's source node completes. Returning `false`
/// skips the edge target.
pub trait Decider: Send + Sync {
    fn decide(&self, ctx: &TaskContext) -> bool;
}

/// How far a decider's rejection propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeciderDepth {
    /// Only the edge target subflow is skipped; siblings in the enclosing
    /// graph keep running.
    Flow,
    /// The target and its transitive successors are skipped.
    All,
}

#[derive(Clone)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub decider: Option<Arc<dyn Decider>>,
    pub depth: DeciderDepth,
}

#[derive(Clone)]
pub enum Flow {
    Task(Arc<dyn Task>),
    Linear {
        name: String,
        children: Vec<Flow>,
    },
    Unordered {
        name: String,
        children: Vec<Flow>,
    },
    Graph {
        name: String,
        nodes: Vec<Flow>,
        edges: Vec<Edge>,
    },
}

impl Flow {
    pub fn task(task: impl Task + 'static) -> Self {
        Flow::Task(Arc::new(task))
    }

    pub fn linear(name: impl Into<String>) -> Self {
        Flow::Linear {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn unordered(name: impl Into<String>) -> Self {
        Flow::Unordered {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn graph(name: impl Into<String>) -> Self {
        Flow::Graph {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            // task leaves carry their own computed names, logged by the
            // runner when they execute
            Flow::Task(_) => "task",
            Flow::Linear { name, .. } => name,
            Flow::Unordered { name, .. } => name,
            Flow::Graph { name, .. } => name,
        }
    }

    /// Append a child (linear/unordered) or node (graph). No-op on task
    /// leaves.
    pub fn add(&mut self, child: Flow) {
        match self {
            Flow::Linear { children, .. } | Flow::Unordered { children, .. } => {
                children.push(child)
            }
            Flow::Graph { nodes, .. } => nodes.push(child),
            Flow::Task(_) => {}
        }
    }

    /// Add a decider-gated edge between two graph node indices.
    pub fn link(
        &mut self,
        from: usize,
        to: usize,
        decider: Option<Arc<dyn Decider>>,
        depth: DeciderDepth,
    ) {
        if let Flow::Graph { edges, .. } = self {
            edges.push(Edge {
                from,
                to,
                decider,
                depth,
            });
        }
    }

    /// A flow with no tasks anywhere below it.
    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }

    pub fn task_count(&self) -> usize {
        match self {
            Flow::Task(_) => 1,
            Flow::Linear { children, .. } | Flow::Unordered { children, .. } => {
                children.iter().map(Flow::task_count).sum()
            }
            Flow::Graph { nodes, .. } => nodes.iter().map(Flow::task_count).sum(),
        }
    }
}
