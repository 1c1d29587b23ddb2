//! Per-user interaction history with relevance-ranked retrieval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{ProviderError, StorageError};
use crate::intent::Intent;
use crate::persistence::Persistence;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub user_id: String,
    pub intent: Intent,
    pub response: Value,
    pub timestamp: DateTime<Utc>,
}

impl ContextEntry {
    /// Text used for similarity ranking: the request followed by the reply.
    pub fn searchable_text(&self) -> String {
        let request = self
            .intent
            .context()
            .get("original_text")
            .and_then(Value::as_str)
            .unwrap_or(self.intent.kind());
        match self.response.get("message").and_then(Value::as_str) {
            Some(reply) => format!("{request} {reply}"),
            None => request.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserContext {
    pub user_id: String,
    /// Oldest first.
    pub history: Vec<ContextEntry>,
    pub last_intent: Option<Intent>,
}

/// Scores candidate texts against a query. Returned indices refer to
/// `candidates`; higher scores are more relevant.
#[async_trait]
pub trait SimilarityRanker: Send + Sync {
    async fn rank(
        &self,
        query: &str,
        candidates: &[String],
    ) -> Result<Vec<(usize, f32)>, ProviderError>;
}

pub struct ContextStore {
    users: DashMap<String, Arc<Mutex<VecDeque<ContextEntry>>>>,
    max_history: usize,
    relevant_limit: usize,
    ranker: Arc<dyn SimilarityRanker>,
    persistence: Option<Arc<Persistence>>,
}

impl ContextStore {
    pub fn new(max_history: usize, relevant_limit: usize, ranker: Arc<dyn SimilarityRanker>) -> Self {
        Self {
            users: DashMap::new(),
            max_history: max_history.max(1),
            relevant_limit: relevant_limit.max(1),
            ranker,
            persistence: None,
        }
    }

    /// Attach write-through persistence and load previously stored histories.
    pub fn with_persistence(mut self, persistence: Arc<Persistence>) -> Result<Self, StorageError> {
        let histories = persistence.load_histories()?;
        for (user, history) in histories {
            let mut q: VecDeque<ContextEntry> = history.into();
            while q.len() > self.max_history {
                q.pop_front();
            }
            self.users.insert(user, Arc::new(Mutex::new(q)));
        }
        info!("Loaded context for {} user(s)", self.users.len());
        self.persistence = Some(persistence);
        Ok(self)
    }

    fn slot(&self, user_id: &str) -> Arc<Mutex<VecDeque<ContextEntry>>> {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    pub async fn get_context(&self, user_id: &str) -> UserContext {
        let slot = self.users.get(user_id).map(|s| s.clone());
        let history: Vec<ContextEntry> = match slot {
            Some(slot) => slot.lock().await.iter().cloned().collect(),
            None => Vec::new(),
        };
        UserContext {
            user_id: user_id.to_string(),
            last_intent: history.last().map(|e| e.intent.clone()),
            history,
        }
    }

    /// Append an interaction, evicting the oldest entries past the window.
    #[instrument(skip(self, intent, response))]
    pub async fn update_context(
        &self,
        user_id: &str,
        intent: Intent,
        response: Value,
    ) -> Result<(), StorageError> {
        let slot = self.slot(user_id);
        let mut history = slot.lock().await;
        history.push_back(ContextEntry {
            user_id: user_id.to_string(),
            intent,
            response,
            timestamp: Utc::now(),
        });
        while history.len() > self.max_history {
            history.pop_front();
        }
        if let Some(p) = &self.persistence {
            let snapshot: Vec<ContextEntry> = history.iter().cloned().collect();
            p.put_history(user_id, &snapshot)?;
        }
        debug!(entries = history.len(), "Context updated");
        Ok(())
    }

    /// Returns whether the user had any history. The slot stays in the map
    /// and is emptied under its lock, so an append waiting on that lock lands
    /// after the clear in memory and on disk alike.
    #[instrument(skip(self))]
    pub async fn clear_context(&self, user_id: &str) -> Result<bool, StorageError> {
        let Some(slot) = self.users.get(user_id).map(|s| s.clone()) else {
            if let Some(p) = &self.persistence {
                p.remove_history(user_id)?;
            }
            return Ok(false);
        };
        let mut history = slot.lock().await;
        let had = !history.is_empty();
        history.clear();
        if let Some(p) = &self.persistence {
            p.remove_history(user_id)?;
        }
        debug!("Context cleared");
        Ok(had)
    }

    /// Retained entries ordered by ranker score (descending), ties broken by
    /// recency. Indices the ranker returns outside the window are ignored.
    #[instrument(skip(self, query))]
    pub async fn get_relevant(
        &self,
        user_id: &str,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ContextEntry>, ProviderError> {
        let history = self.get_context(user_id).await.history;
        if history.is_empty() {
            return Ok(Vec::new());
        }
        let candidates: Vec<String> = history.iter().map(ContextEntry::searchable_text).collect();
        let mut scored = self.ranker.rank(query, &candidates).await?;

        scored.retain(|(i, _)| *i < history.len());
        scored.sort_by(|(ia, sa), (ib, sb)| sb.total_cmp(sa).then(ib.cmp(ia)));
        let mut seen = HashSet::new();
        scored.retain(|(i, _)| seen.insert(*i));

        let limit = limit.unwrap_or(self.relevant_limit);
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(i, _)| history[i].clone())
            .collect())
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Ranker returning fixed scores, including an out-of-range index.
    struct FixedRanker(Vec<(usize, f32)>);

    #[async_trait]
    impl SimilarityRanker for FixedRanker {
        async fn rank(&self, _q: &str, _c: &[String]) -> Result<Vec<(usize, f32)>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    fn intent(text: &str) -> Intent {
        Intent::new("greeting", 0.9).with_context("original_text", text)
    }

    #[tokio::test]
    async fn test_history_is_bounded_fifo() {
        let store = ContextStore::new(3, 5, Arc::new(FixedRanker(vec![])));
        for i in 0..5 {
            store
                .update_context("u", intent(&format!("msg {i}")), json!({ "n": i }))
                .await
                .unwrap();
        }
        let ctx = store.get_context("u").await;
        let ns: Vec<i64> = ctx.history.iter().map(|e| e.response["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3, 4]);
        assert_eq!(
            ctx.last_intent.unwrap().context()["original_text"],
            json!("msg 4")
        );
    }

    #[tokio::test]
    async fn test_relevance_order_ties_by_recency_and_ignores_out_of_range() {
        let ranker = FixedRanker(vec![(0, 0.5), (1, 0.9), (2, 0.5), (42, 1.0)]);
        let store = ContextStore::new(10, 10, Arc::new(ranker));
        for i in 0..3 {
            store
                .update_context("u", intent(&format!("msg {i}")), json!({ "n": i }))
                .await
                .unwrap();
        }
        let relevant = store.get_relevant("u", "anything", None).await.unwrap();
        let ns: Vec<i64> = relevant.iter().map(|e| e.response["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 0]);

        let top = store.get_relevant("u", "anything", Some(1)).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_unknown_users() {
        let store = ContextStore::new(3, 3, Arc::new(FixedRanker(vec![(0, 1.0)])));
        assert!(store.get_context("nobody").await.history.is_empty());
        assert!(store.get_relevant("nobody", "q", None).await.unwrap().is_empty());

        store.update_context("u", intent("hi"), json!({})).await.unwrap();
        assert!(store.clear_context("u").await.unwrap());
        assert!(!store.clear_context("u").await.unwrap());
        assert!(store.get_context("u").await.last_intent.is_none());
    }

    #[tokio::test]
    async fn test_history_survives_restart_with_persistence() {
        let persistence = Arc::new(Persistence::temporary().unwrap());
        {
            let store = ContextStore::new(2, 2, Arc::new(FixedRanker(vec![])))
                .with_persistence(persistence.clone())
                .unwrap();
            store.update_context("u", intent("one"), json!({ "n": 1 })).await.unwrap();
            store.update_context("u", intent("two"), json!({ "n": 2 })).await.unwrap();
        }
        let store = ContextStore::new(2, 2, Arc::new(FixedRanker(vec![])))
            .with_persistence(persistence)
            .unwrap();
        assert_eq!(store.get_context("u").await.history.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_racing_appends_keeps_disk_in_step() {
        let persistence = Arc::new(Persistence::temporary().unwrap());
        let store = Arc::new(
            ContextStore::new(50, 5, Arc::new(FixedRanker(vec![])))
                .with_persistence(persistence.clone())
                .unwrap(),
        );

        for round in 0..50 {
            let appender = {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update_context("u", intent(&format!("msg {round}")), json!({ "n": round }))
                        .await
                })
            };
            let clearer = {
                let store = store.clone();
                tokio::spawn(async move { store.clear_context("u").await })
            };
            appender.await.unwrap().unwrap();
            clearer.await.unwrap().unwrap();

            let in_memory = store.get_context("u").await.history.len();
            let reloaded = ContextStore::new(50, 5, Arc::new(FixedRanker(vec![])))
                .with_persistence(persistence.clone())
                .unwrap();
            assert_eq!(reloaded.get_context("u").await.history.len(), in_memory);
        }
    }

    #[test]
    fn test_searchable_text_includes_reply() {
        let entry = ContextEntry {
            user_id: "u".into(),
            intent: intent("hello there"),
            response: json!({ "message": "Hi!" }),
            timestamp: Utc::now(),
        };
        assert_eq!(entry.searchable_text(), "hello there Hi!");
    }
}
