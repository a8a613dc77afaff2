//! Small dependency-graph executor.
//!
//! Nodes start as soon as all of their dependencies succeeded and run
//! concurrently on the current task. A failed node marks every node that
//! depends on it (directly or transitively) as skipped; those never start.
//! [`TaskGraph::run`] returns only once nothing is left running.

use std::collections::HashMap;

use common::error::AppError;
use futures::{
    future::BoxFuture,
    stream::{FuturesUnordered, StreamExt},
    FutureExt,
};
use tracing::debug;

pub type NodeFuture = BoxFuture<'static, Result<(), AppError>>;

type NodeTask = Box<dyn FnOnce() -> NodeFuture + Send>;

struct Node {
    name: &'static str,
    deps: Vec<&'static str>,
    task: Option<NodeTask>,
}

#[derive(Debug)]
pub enum NodeOutcome {
    Succeeded,
    Failed(AppError),
    Skipped,
}

#[derive(Default)]
pub struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Dependencies must already be in the graph, which also rules out cycles.
    pub fn add_node<F>(
        &mut self,
        name: &'static str,
        deps: &[&'static str],
        task: F,
    ) -> Result<&mut Self, AppError>
    where
        F: FnOnce() -> NodeFuture + Send + 'static,
    {
        if self.nodes.iter().any(|n| n.name == name) {
            return Err(AppError::Validation(format!("duplicate graph node {name}")));
        }
        if let Some(missing) = deps
            .iter()
            .find(|dep| !self.nodes.iter().any(|n| n.name == **dep))
        {
            return Err(AppError::Validation(format!(
                "graph node {name} depends on unknown node {missing}"
            )));
        }

        self.nodes.push(Node {
            name,
            deps: deps.to_vec(),
            task: Some(Box::new(task)),
        });
        Ok(self)
    }

    pub async fn run(mut self) -> GraphReport {
        let mut outcomes: HashMap<&'static str, NodeOutcome> = HashMap::new();
        let mut running = FuturesUnordered::new();

        loop {
            // Schedule and skip until nothing changes, so skips cascade.
            loop {
                let mut changed = false;
                for node in &mut self.nodes {
                    if node.task.is_none() {
                        continue;
                    }
                    let blocked = node.deps.iter().any(|dep| {
                        matches!(
                            outcomes.get(dep),
                            Some(NodeOutcome::Failed(_) | NodeOutcome::Skipped)
                        )
                    });
                    let ready = node
                        .deps
                        .iter()
                        .all(|dep| matches!(outcomes.get(dep), Some(NodeOutcome::Succeeded)));

                    if blocked {
                        node.task = None;
                        debug!(node = node.name, "dependency failed; node skipped");
                        outcomes.insert(node.name, NodeOutcome::Skipped);
                        changed = true;
                    } else if ready {
                        if let Some(task) = node.task.take() {
                            let name = node.name;
                            running.push(task().map(move |result| (name, result)).boxed());
                            changed = true;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }

            let Some((name, result)) = running.next().await else {
                break;
            };
            let outcome = match result {
                Ok(()) => NodeOutcome::Succeeded,
                Err(err) => NodeOutcome::Failed(err),
            };
            outcomes.insert(name, outcome);
        }

        let outcomes = self
            .nodes
            .iter()
            .map(|node| {
                let outcome = outcomes.remove(node.name).unwrap_or(NodeOutcome::Skipped);
                (node.name, outcome)
            })
            .collect();
        GraphReport { outcomes }
    }
}

/// Per-node outcomes in insertion order.
#[derive(Debug)]
pub struct GraphReport {
    outcomes: Vec<(&'static str, NodeOutcome)>,
}

impl GraphReport {
    /// The error of the first failed node in insertion order.
    pub fn into_first_error(self) -> Option<AppError> {
        self.outcomes.into_iter().find_map(|(_, outcome)| match outcome {
            NodeOutcome::Failed(err) => Some(err),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    impl GraphReport {
        fn outcome(&self, name: &str) -> Option<&NodeOutcome> {
            self.outcomes
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, outcome)| outcome)
        }

        fn all_succeeded(&self) -> bool {
            self.outcomes
                .iter()
                .all(|(_, outcome)| matches!(outcome, NodeOutcome::Succeeded))
        }
    }

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn task(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        delay_ms: u64,
        fail: bool,
    ) -> impl FnOnce() -> NodeFuture + Send + 'static {
        let log = Arc::clone(log);
        move || {
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                log.lock().expect("log").push(name);
                if fail {
                    Err(AppError::Processing(format!("{name} failed")))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_dependencies_run_in_order_and_siblings_concurrently() {
        let log = recorder();
        let mut graph = TaskGraph::new();
        graph
            .add_node("root", &[], task(&log, "root", 0, false))
            .and_then(|g| g.add_node("slow", &["root"], task(&log, "slow", 40, false)))
            .and_then(|g| g.add_node("fast", &["root"], task(&log, "fast", 0, false)))
            .and_then(|g| g.add_node("after_slow", &["slow"], task(&log, "after_slow", 0, false)))
            .expect("graph");

        let report = graph.run().await;
        assert!(report.all_succeeded());
        let order = log.lock().expect("log").clone();
        assert_eq!(order, vec!["root", "fast", "slow", "after_slow"]);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_siblings() {
        let log = recorder();
        let mut graph = TaskGraph::new();
        graph
            .add_node("root", &[], task(&log, "root", 0, false))
            .and_then(|g| g.add_node("chunk", &["root"], task(&log, "chunk", 0, true)))
            .and_then(|g| g.add_node("embed", &["chunk"], task(&log, "embed", 0, false)))
            .and_then(|g| g.add_node("classify", &["root"], task(&log, "classify", 10, false)))
            .expect("graph");

        let report = graph.run().await;
        assert!(!report.all_succeeded());
        assert!(matches!(report.outcome("chunk"), Some(NodeOutcome::Failed(_))));
        assert!(matches!(report.outcome("embed"), Some(NodeOutcome::Skipped)));
        assert!(matches!(report.outcome("classify"), Some(NodeOutcome::Succeeded)));

        let ran = log.lock().expect("log").clone();
        assert!(!ran.contains(&"embed"));
        assert!(ran.contains(&"classify"));

        let err = report.into_first_error().expect("error");
        assert!(err.to_string().contains("chunk failed"));
    }

    #[tokio::test]
    async fn test_root_failure_skips_everything() {
        let log = recorder();
        let mut graph = TaskGraph::new();
        graph
            .add_node("extract", &[], task(&log, "extract", 0, true))
            .and_then(|g| g.add_node("a", &["extract"], task(&log, "a", 0, false)))
            .and_then(|g| g.add_node("b", &["a"], task(&log, "b", 0, false)))
            .expect("graph");

        let report = graph.run().await;
        assert!(matches!(report.outcome("a"), Some(NodeOutcome::Skipped)));
        assert!(matches!(report.outcome("b"), Some(NodeOutcome::Skipped)));
        assert_eq!(log.lock().expect("log").clone(), vec!["extract"]);
    }

    #[tokio::test]
    async fn test_invalid_nodes_are_rejected() {
        let log = recorder();
        let mut graph = TaskGraph::new();
        assert!(matches!(
            graph.add_node("a", &["missing"], task(&log, "a", 0, false)),
            Err(AppError::Validation(_))
        ));
        graph
            .add_node("a", &[], task(&log, "a", 0, false))
            .expect("first");
        assert!(matches!(
            graph.add_node("a", &[], task(&log, "a", 0, false)),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_graph_succeeds() {
        let report = TaskGraph::new().run().await;
        assert!(report.all_succeeded());
        assert!(report.into_first_error().is_none());
    }
}
