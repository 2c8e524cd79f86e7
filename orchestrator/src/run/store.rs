//! Persistence seam for runs and crews.
//!
//! The driver and the HTTP layer only see the [`RunStore`] trait. The
//! in-memory implementation backs tests and the default binary; see
//! `sqlite_store` for the durable one.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::state::Run;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instructions {
    Steps(Vec<String>),
    Text(String),
}

/// How a crew approaches its missions. Read-only to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrewRecipe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<Instructions>,
    /// Tool name to description
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crew {
    pub id: Uuid,
    #[serde(default)]
    pub org_id: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub recipe: CrewRecipe,
}

#[derive(Debug, thiserror::Error)]
pub enum RunStoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<(), RunStoreError>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, RunStoreError>;
    async fn save_run(&self, run: &Run) -> Result<(), RunStoreError>;
    async fn get_crew(&self, crew_id: Uuid) -> Result<Option<Crew>, RunStoreError>;
    async fn put_crew(&self, crew: &Crew) -> Result<(), RunStoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<DashMap<Uuid, Run>>,
    crews: Arc<DashMap<Uuid, Crew>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored runs, in no particular order
    pub fn runs(&self) -> Vec<Run> {
        self.runs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drop a run row; used to exercise the missing-run path.
    pub fn remove_run(&self, run_id: Uuid) -> Option<Run> {
        self.runs.remove(&run_id).map(|(_, run)| run)
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: &Run) -> Result<(), RunStoreError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, RunStoreError> {
        Ok(self.runs.get(&run_id).map(|run| run.value().clone()))
    }

    async fn save_run(&self, run: &Run) -> Result<(), RunStoreError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_crew(&self, crew_id: Uuid) -> Result<Option<Crew>, RunStoreError> {
        Ok(self.crews.get(&crew_id).map(|crew| crew.value().clone()))
    }

    async fn put_crew(&self, crew: &Crew) -> Result<(), RunStoreError> {
        self.crews.insert(crew.id, crew.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_saves_latest_run_state() {
        let store = InMemoryRunStore::new();
        let mut run = Run::new_queued(Uuid::new_v4(), "hello");
        store.create_run(&run).await.unwrap();

        run.mark_running(chrono::Utc::now()).unwrap();
        store.save_run(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert!(store.get_run(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn test_crew_recipe_accepts_text_or_step_instructions() {
        let steps: Crew = serde_json::from_value(serde_json::json!({
            "id": Uuid::nil(),
            "name": "Research",
            "instructions": ["plan", "search"],
        }))
        .unwrap();
        assert_eq!(
            steps.recipe.instructions,
            Some(Instructions::Steps(vec![
                "plan".to_string(),
                "search".to_string()
            ]))
        );
        assert_eq!(steps.org_id, None);

        let text: CrewRecipe =
            serde_json::from_value(serde_json::json!({"instructions": "be brief"})).unwrap();
        assert_eq!(
            text.instructions,
            Some(Instructions::Text("be brief".to_string()))
        );
    }
}
