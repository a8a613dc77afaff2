use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::error::AppError;
use tokio::sync::{Mutex, Notify};

use super::{Delivery, MessageSource};

#[derive(Default)]
struct TopicLog {
    messages: Vec<Bytes>,
    /// Next position to hand out.
    cursor: usize,
    committed: BTreeSet<usize>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    commit_log: Vec<(String, String)>,
}

/// In-process queue with one partition per topic.
///
/// Offsets are message positions. `rebalance` rewinds every topic so
/// uncommitted messages are handed out again.
pub struct MemorySource {
    state: Mutex<State>,
    published: Notify,
    idle_wait: Duration,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_idle_wait(Duration::from_millis(20))
    }

    /// `idle_wait` bounds how long an empty fetch waits for new messages.
    pub fn with_idle_wait(idle_wait: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            published: Notify::new(),
            idle_wait,
        }
    }

    /// Append a message and return its offset.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> String {
        let offset = {
            let mut state = self.state.lock().await;
            let log = state.topics.entry(topic.to_string()).or_default();
            log.messages.push(payload.into());
            log.messages.len().saturating_sub(1)
        };
        self.published.notify_waiters();
        offset.to_string()
    }

    pub async fn rebalance(&self) {
        let mut state = self.state.lock().await;
        for log in state.topics.values_mut() {
            log.cursor = 0;
        }
    }

    pub async fn committed(&self, topic: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|log| log.committed.iter().map(ToString::to_string).collect())
            .unwrap_or_default()
    }

    /// Every commit call in order, including repeats.
    pub async fn commit_log(&self) -> Vec<(String, String)> {
        self.state.lock().await.commit_log.clone()
    }

    pub async fn uncommitted(&self, topic: &str) -> usize {
        let state = self.state.lock().await;
        state.topics.get(topic).map_or(0, |log| {
            log.messages.len().saturating_sub(log.committed.len())
        })
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn fetch(&self, topics: &[String], max: usize) -> Result<Vec<Delivery>, AppError> {
        let waiter = self.published.notified();
        {
            let mut state = self.state.lock().await;
            let mut batch = Vec::new();
            for topic in topics {
                let Some(log) = state.topics.get_mut(topic) else {
                    continue;
                };
                while batch.len() < max && log.cursor < log.messages.len() {
                    let position = log.cursor;
                    log.cursor = log.cursor.saturating_add(1);
                    if log.committed.contains(&position) {
                        continue;
                    }
                    if let Some(payload) = log.messages.get(position) {
                        batch.push(Delivery {
                            topic: topic.clone(),
                            partition: topic.clone(),
                            offset: position.to_string(),
                            payload: payload.clone(),
                        });
                    }
                }
            }
            if !batch.is_empty() {
                return Ok(batch);
            }
        }

        let _ = tokio::time::timeout(self.idle_wait, waiter).await;
        Ok(Vec::new())
    }

    async fn commit(&self, delivery: &Delivery) -> Result<(), AppError> {
        let position: usize = delivery.offset.parse().map_err(|_| {
            AppError::Validation(format!("invalid offset {:?}", delivery.offset))
        })?;

        let mut state = self.state.lock().await;
        let log = state
            .topics
            .get_mut(&delivery.topic)
            .filter(|log| position < log.messages.len())
            .ok_or_else(|| {
                AppError::Queue(format!(
                    "unknown message {}@{}",
                    delivery.topic, delivery.offset
                ))
            })?;
        log.committed.insert(position);
        state
            .commit_log
            .push((delivery.topic.clone(), delivery.offset.clone()));
        Ok(())
    }
}
