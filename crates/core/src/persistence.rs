//! Persistence of recipes, cooking sessions and the logs a session produces.
//!
//! [`RecipeStore`] is the boundary; [`SupabaseStore`] talks to a hosted
//! PostgREST endpoint and [`MemoryStore`] keeps everything in process.

use crate::types::{
    Confidence, Ingredient, RecipeDetails, RecipeStep, RecipeSummary, SourceStep,
    ValidationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(String),
    #[error("store response invalid: {0}")]
    InvalidResponse(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("unauthorized")]
    Unauthorized,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    InProgress,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewSession {
    pub recipe_id: String,
    pub steps: Vec<RecipeStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub recipe_id: String,
    #[serde(rename = "session_status", default, deserialize_with = "default_if_null")]
    pub status: SessionStatus,
    #[serde(rename = "current_steps", default)]
    pub steps: Vec<RecipeStep>,
    pub original_steps_count: u32,
    #[serde(default, deserialize_with = "default_if_null")]
    pub total_steps: u32,
    #[serde(default, deserialize_with = "default_if_null")]
    pub current_step: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "default_if_null")]
    pub ai_validations_count: u32,
    #[serde(default, deserialize_with = "default_if_null")]
    pub ai_validations_passed: u32,
    #[serde(default, deserialize_with = "default_if_null")]
    pub ai_validations_failed: u32,
    #[serde(default, deserialize_with = "default_if_null")]
    pub corrective_steps_added: u32,
    #[serde(default, deserialize_with = "default_if_null")]
    pub steps_modified: u32,
    #[serde(default)]
    pub total_duration_minutes: Option<i64>,
}

/// PostgREST sends `null` for unset columns; read those as the type's default.
fn default_if_null<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Partial session update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SessionUpdate {
    #[serde(rename = "session_status", skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(rename = "current_steps", skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<RecipeStep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_modified: Option<u32>,
}

impl SessionUpdate {
    pub fn completed(at: DateTime<Utc>, total_steps: u32) -> Self {
        Self {
            status: Some(SessionStatus::Completed),
            completed_at: Some(at),
            current_step: Some(total_steps),
            total_steps: Some(total_steps),
            ..Self::default()
        }
    }

    pub fn abandoned() -> Self {
        Self {
            status: Some(SessionStatus::Abandoned),
            ..Self::default()
        }
    }

    fn completes(&self) -> bool {
        self.status == Some(SessionStatus::Completed) && self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepTimeRecord {
    pub session_id: String,
    pub recipe_id: String,
    pub step_label: String,
    pub instruction: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub needed_retry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationRecord {
    pub session_id: String,
    pub recipe_id: String,
    pub step_label: String,
    pub instruction: String,
    pub result_text: String,
    pub status: ValidationStatus,
    pub confidence: Confidence,
    pub corrective_steps_added: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Viewed,
    Saved,
    CookStarted,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    pub recipe_id: String,
    pub kind: InteractionKind,
    pub source: String,
}

impl InteractionRecord {
    pub fn new(recipe_id: &str, kind: InteractionKind, source: &str) -> Self {
        Self {
            recipe_id: recipe_id.to_string(),
            kind,
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchLog {
    pub query: String,
    pub diet: Option<String>,
    pub results: usize,
    pub generated: bool,
    pub response_time_ms: u64,
}

pub const DEFAULT_COLLECTION_EMOJI: &str = "📖";
const COLLECTION_SOURCE: &str = "collection";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewCollection {
    pub name: String,
    pub description: Option<String>,
    pub emoji: Option<String>,
    pub is_default: bool,
}

/// A named list of saved recipes owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "default_if_null")]
    pub emoji: String,
    #[serde(default, deserialize_with = "default_if_null")]
    pub is_default: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        alias = "recipe_collection_items",
        default,
        deserialize_with = "default_if_null"
    )]
    pub items: Vec<CollectionItem>,
}

impl Collection {
    pub fn contains(&self, recipe_id: &str) -> bool {
        self.items.iter().any(|item| item.recipe_id == recipe_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionItem {
    #[serde(default, deserialize_with = "default_if_null")]
    pub recipe_id: String,
    #[serde(alias = "user_notes", default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub added_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserStats {
    pub recent_sessions: Vec<SessionRecord>,
    pub collection_count: usize,
}

/// Hosted-database boundary. Every cooking-flow call is best-effort from the
/// controller's point of view; failures never roll back session state.
#[async_trait]
pub trait RecipeStore: Send + Sync {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError>;
    async fn update_session(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError>;
    async fn log_step_time(&self, record: StepTimeRecord) -> Result<(), StoreError>;
    async fn log_validation(&self, record: ValidationRecord) -> Result<(), StoreError>;
    async fn log_interaction(&self, record: InteractionRecord) -> Result<(), StoreError>;

    /// Stored recipes whose title contains `query`, most viewed first.
    async fn find_recipes(
        &self,
        query: &str,
        diet: &str,
        limit: usize,
    ) -> Result<Vec<RecipeSummary>, StoreError>;
    async fn get_recipe(&self, id: &str) -> Result<Option<RecipeDetails>, StoreError>;
    async fn upsert_summary(&self, recipe: &RecipeSummary, diet: &str) -> Result<(), StoreError>;
    async fn upsert_details(&self, recipe: &RecipeDetails) -> Result<(), StoreError>;
    async fn log_search(&self, entry: SearchLog) -> Result<(), StoreError>;

    /// The current user's collections with their items, newest first.
    async fn list_collections(&self) -> Result<Vec<Collection>, StoreError>;
    async fn create_collection(&self, new: NewCollection) -> Result<Collection, StoreError>;
    async fn delete_collection(&self, id: &str) -> Result<(), StoreError>;
    /// Saves a recipe into one of the user's collections and logs a `saved`
    /// interaction. A recipe can be in a collection only once.
    async fn add_to_collection(
        &self,
        collection_id: &str,
        recipe_id: &str,
        notes: Option<String>,
    ) -> Result<CollectionItem, StoreError>;
    /// Removing a recipe that is not in the collection is not an error.
    async fn remove_from_collection(
        &self,
        collection_id: &str,
        recipe_id: &str,
    ) -> Result<(), StoreError>;
    /// Most recent cooking sessions and the number of collections.
    async fn user_stats(&self, recent: usize) -> Result<UserStats, StoreError>;
}

macro_rules! forward_store {
    ($wrapper:ident) => {
        #[async_trait]
        impl<T> RecipeStore for $wrapper<T>
        where
            T: RecipeStore + ?Sized,
        {
            async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError> {
                (**self).create_session(new).await
            }
            async fn update_session(
                &self,
                id: &str,
                update: SessionUpdate,
            ) -> Result<SessionRecord, StoreError> {
                (**self).update_session(id, update).await
            }
            async fn log_step_time(&self, record: StepTimeRecord) -> Result<(), StoreError> {
                (**self).log_step_time(record).await
            }
            async fn log_validation(&self, record: ValidationRecord) -> Result<(), StoreError> {
                (**self).log_validation(record).await
            }
            async fn log_interaction(&self, record: InteractionRecord) -> Result<(), StoreError> {
                (**self).log_interaction(record).await
            }
            async fn find_recipes(
                &self,
                query: &str,
                diet: &str,
                limit: usize,
            ) -> Result<Vec<RecipeSummary>, StoreError> {
                (**self).find_recipes(query, diet, limit).await
            }
            async fn get_recipe(&self, id: &str) -> Result<Option<RecipeDetails>, StoreError> {
                (**self).get_recipe(id).await
            }
            async fn upsert_summary(
                &self,
                recipe: &RecipeSummary,
                diet: &str,
            ) -> Result<(), StoreError> {
                (**self).upsert_summary(recipe, diet).await
            }
            async fn upsert_details(&self, recipe: &RecipeDetails) -> Result<(), StoreError> {
                (**self).upsert_details(recipe).await
            }
            async fn log_search(&self, entry: SearchLog) -> Result<(), StoreError> {
                (**self).log_search(entry).await
            }
            async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
                (**self).list_collections().await
            }
            async fn create_collection(
                &self,
                new: NewCollection,
            ) -> Result<Collection, StoreError> {
                (**self).create_collection(new).await
            }
            async fn delete_collection(&self, id: &str) -> Result<(), StoreError> {
                (**self).delete_collection(id).await
            }
            async fn add_to_collection(
                &self,
                collection_id: &str,
                recipe_id: &str,
                notes: Option<String>,
            ) -> Result<CollectionItem, StoreError> {
                (**self)
                    .add_to_collection(collection_id, recipe_id, notes)
                    .await
            }
            async fn remove_from_collection(
                &self,
                collection_id: &str,
                recipe_id: &str,
            ) -> Result<(), StoreError> {
                (**self)
                    .remove_from_collection(collection_id, recipe_id)
                    .await
            }
            async fn user_stats(&self, recent: usize) -> Result<UserStats, StoreError> {
                (**self).user_stats(recent).await
            }
        }
    };
}

forward_store!(Box);
forward_store!(Arc);

/// Whole minutes between start and completion, never negative.
pub fn duration_minutes(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> i64 {
    (completed_at - started_at).num_minutes().max(0)
}

/// Concatenated digits of a free-text quantity, e.g. `"450 kcal"` -> 450.
pub fn digits_of(raw: &str) -> Option<u32> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[derive(Debug, Clone)]
struct StoredRecipe {
    summary: RecipeSummary,
    diet: String,
    details: Option<RecipeDetails>,
    view_count: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: BTreeMap<String, SessionRecord>,
    step_times: Vec<StepTimeRecord>,
    validations: Vec<ValidationRecord>,
    interactions: Vec<InteractionRecord>,
    recipes: BTreeMap<String, StoredRecipe>,
    searches: Vec<SearchLog>,
    collections: Vec<Collection>,
}

/// In-process store used for offline runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    user_id: Option<String>,
    unavailable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// A store whose every call fails, as if the network were down.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub async fn sessions(&self) -> Vec<SessionRecord> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    pub async fn step_times(&self) -> Vec<StepTimeRecord> {
        self.state.lock().await.step_times.clone()
    }

    pub async fn validations(&self) -> Vec<ValidationRecord> {
        self.state.lock().await.validations.clone()
    }

    pub async fn interactions(&self) -> Vec<InteractionRecord> {
        self.state.lock().await.interactions.clone()
    }

    pub async fn searches(&self) -> Vec<SearchLog> {
        self.state.lock().await.searches.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Request("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecipeStore for MemoryStore {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError> {
        self.check()?;
        let count = new.steps.len() as u32;
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            recipe_id: new.recipe_id,
            status: SessionStatus::InProgress,
            steps: new.steps,
            original_steps_count: count,
            total_steps: count,
            current_step: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            ai_validations_count: 0,
            ai_validations_passed: 0,
            ai_validations_failed: 0,
            corrective_steps_added: 0,
            steps_modified: 0,
            total_duration_minutes: None,
        };
        let mut state = self.state.lock().await;
        state.sessions.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_session(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("cooking session {id}")))?;
        if update.completes() {
            if let (Some(start), Some(done)) = (session.started_at, update.completed_at) {
                session.total_duration_minutes = Some(duration_minutes(start, done));
            }
        }
        if let Some(status) = update.status {
            session.status = status;
        }
        if let Some(at) = update.completed_at {
            session.completed_at = Some(at);
        }
        if let Some(n) = update.current_step {
            session.current_step = n;
        }
        if let Some(n) = update.total_steps {
            session.total_steps = n;
        }
        if let Some(steps) = update.steps {
            session.steps = steps;
        }
        if let Some(n) = update.steps_modified {
            session.steps_modified = n;
        }
        let record = session.clone();
        if update.status == Some(SessionStatus::Completed) {
            state.interactions.push(InteractionRecord::new(
                &record.recipe_id,
                InteractionKind::Completed,
                "cooking_page",
            ));
        }
        Ok(record)
    }

    async fn log_step_time(&self, record: StepTimeRecord) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().await.step_times.push(record);
        Ok(())
    }

    async fn log_validation(&self, record: ValidationRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(&record.session_id) {
            session.ai_validations_count += 1;
            match record.status {
                ValidationStatus::Pass => session.ai_validations_passed += 1,
                ValidationStatus::Fail => session.ai_validations_failed += 1,
                ValidationStatus::Uncertain => {}
            }
            session.corrective_steps_added += record.corrective_steps_added;
        }
        state.validations.push(record);
        Ok(())
    }

    async fn log_interaction(&self, record: InteractionRecord) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().await.interactions.push(record);
        Ok(())
    }

    async fn find_recipes(
        &self,
        query: &str,
        diet: &str,
        limit: usize,
    ) -> Result<Vec<RecipeSummary>, StoreError> {
        self.check()?;
        let needle = query.to_lowercase();
        let state = self.state.lock().await;
        let mut matches: Vec<&StoredRecipe> = state
            .recipes
            .values()
            .filter(|r| r.diet == diet && r.summary.title.to_lowercase().contains(&needle))
            .collect();
        matches.sort_by(|a, b| b.view_count.cmp(&a.view_count));
        Ok(matches
            .into_iter()
            .take(limit)
            .map(|r| r.summary.clone())
            .collect())
    }

    async fn get_recipe(&self, id: &str) -> Result<Option<RecipeDetails>, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        Ok(state.recipes.get_mut(id).and_then(|r| {
            r.view_count += 1;
            r.details.clone()
        }))
    }

    async fn upsert_summary(&self, recipe: &RecipeSummary, diet: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let entry = state
            .recipes
            .entry(recipe.id.clone())
            .or_insert_with(|| StoredRecipe {
                summary: recipe.clone(),
                diet: diet.to_string(),
                details: None,
                view_count: 0,
            });
        entry.summary = recipe.clone();
        entry.diet = diet.to_string();
        Ok(())
    }

    async fn upsert_details(&self, recipe: &RecipeDetails) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let summary = RecipeSummary {
            id: recipe.id.clone(),
            title: recipe.title.clone(),
            description: recipe.description.clone(),
            time: recipe.time.clone(),
            calories: String::new(),
            image_prompt: recipe.image_prompt.clone(),
        };
        let entry = state
            .recipes
            .entry(recipe.id.clone())
            .or_insert_with(|| StoredRecipe {
                summary: summary.clone(),
                diet: crate::catalog::DEFAULT_DIET.to_string(),
                details: None,
                view_count: 0,
            });
        entry.details = Some(recipe.clone());
        Ok(())
    }

    async fn log_search(&self, entry: SearchLog) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().await.searches.push(entry);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .collections
            .iter()
            .rev()
            .filter(|c| c.user_id == self.user_id)
            .cloned()
            .collect())
    }

    async fn create_collection(&self, new: NewCollection) -> Result<Collection, StoreError> {
        self.check()?;
        let collection = Collection {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: self.user_id.clone(),
            name: new.name,
            description: new.description,
            emoji: new
                .emoji
                .unwrap_or_else(|| DEFAULT_COLLECTION_EMOJI.to_string()),
            is_default: new.is_default,
            created_at: Some(Utc::now()),
            items: Vec::new(),
        };
        self.state.lock().await.collections.push(collection.clone());
        Ok(collection)
    }

    async fn delete_collection(&self, id: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let before = state.collections.len();
        state
            .collections
            .retain(|c| !(c.id == id && c.user_id == self.user_id));
        if state.collections.len() == before {
            return Err(StoreError::NotFound(format!("collection {id}")));
        }
        Ok(())
    }

    async fn add_to_collection(
        &self,
        collection_id: &str,
        recipe_id: &str,
        notes: Option<String>,
    ) -> Result<CollectionItem, StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        let collection = state
            .collections
            .iter_mut()
            .find(|c| c.id == collection_id && c.user_id == self.user_id)
            .ok_or_else(|| StoreError::NotFound(format!("collection {collection_id}")))?;
        if collection.contains(recipe_id) {
            return Err(StoreError::Conflict(format!(
                "recipe {recipe_id} is already in collection {collection_id}"
            )));
        }
        let item = CollectionItem {
            recipe_id: recipe_id.to_string(),
            notes,
            added_at: Some(Utc::now()),
        };
        collection.items.push(item.clone());
        state.interactions.push(InteractionRecord::new(
            recipe_id,
            InteractionKind::Saved,
            COLLECTION_SOURCE,
        ));
        Ok(item)
    }

    async fn remove_from_collection(
        &self,
        collection_id: &str,
        recipe_id: &str,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(collection) = state.collections.iter_mut().find(|c| c.id == collection_id) {
            collection.items.retain(|item| item.recipe_id != recipe_id);
        }
        Ok(())
    }

    async fn user_stats(&self, recent: usize) -> Result<UserStats, StoreError> {
        self.check()?;
        let state = self.state.lock().await;
        let mut sessions: Vec<SessionRecord> = state
            .sessions
            .values()
            .filter(|s| s.user_id == self.user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(recent);
        Ok(UserStats {
            recent_sessions: sessions,
            collection_count: state
                .collections
                .iter()
                .filter(|c| c.user_id == self.user_id)
                .count(),
        })
    }
}

/// PostgREST client for a Supabase project.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base: Url,
    api_key: String,
    access_token: Option<String>,
    user_id: Option<String>,
    client: Client,
}

impl SupabaseStore {
    pub fn new(
        project_url: &str,
        api_key: String,
        access_token: Option<String>,
        user_id: Option<String>,
    ) -> Result<Self, StoreError> {
        let base = Url::parse(&format!("{}/rest/v1/", project_url.trim_end_matches('/')))
            .map_err(|e| StoreError::Request(format!("invalid project url: {e}")))?;
        Ok(Self {
            base,
            api_key,
            access_token,
            user_id,
            client: Client::new(),
        })
    }

    fn table_url(&self, table: &str, query: &[(&str, String)]) -> Result<Url, StoreError> {
        let mut url = self
            .base
            .join(table)
            .map_err(|e| StoreError::Request(e.to_string()))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    async fn insert(&self, table: &str, body: Value) -> Result<Value, StoreError> {
        let url = self.table_url(table, &[])?;
        let request = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(&body);
        first_row(send_rows(request).await?)
    }

    async fn upsert(&self, table: &str, body: Value) -> Result<(), StoreError> {
        let url = self.table_url(table, &[("on_conflict", "id".to_string())])?;
        let request = self
            .request(Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&body);
        send_rows(request).await.map(|_| ())
    }

    async fn patch(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: Value,
    ) -> Result<Value, StoreError> {
        let url = self.table_url(table, filters)?;
        let request = self
            .request(Method::PATCH, url)
            .header("Prefer", "return=representation")
            .json(&body);
        first_row(send_rows(request).await?)
    }

    async fn delete(&self, table: &str, filters: &[(&str, String)]) -> Result<Vec<Value>, StoreError> {
        let url = self.table_url(table, filters)?;
        let request = self
            .request(Method::DELETE, url)
            .header("Prefer", "return=representation");
        send_rows(request).await
    }

    async fn select(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<Value>, StoreError> {
        let url = self.table_url(table, query)?;
        send_rows(self.request(Method::GET, url)).await
    }

    async fn session(&self, id: &str) -> Result<SessionRecord, StoreError> {
        let rows = self
            .select(
                "cooking_sessions",
                &[("select", "*".to_string()), ("id", format!("eq.{id}"))],
            )
            .await?;
        decode(first_row(rows)?)
    }

    /// Collections are per user; without one the request is refused.
    fn require_user(&self) -> Result<&str, StoreError> {
        self.user_id.as_deref().ok_or(StoreError::Unauthorized)
    }

    fn user_filter(&self) -> Vec<(&'static str, String)> {
        self.user_id
            .iter()
            .map(|u| ("user_id", format!("eq.{u}")))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RecipeRow {
    id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    time_minutes: Option<u32>,
    #[serde(default)]
    calories: Option<u32>,
    #[serde(default)]
    servings: Option<u32>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    image_prompt: Option<String>,
    #[serde(default)]
    ingredients: Option<Vec<Ingredient>>,
    #[serde(default)]
    steps: Option<Vec<SourceStep>>,
}

impl RecipeRow {
    fn summary(&self) -> RecipeSummary {
        RecipeSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone().unwrap_or_default(),
            time: self
                .time_minutes
                .map(|m| format!("{m} mins"))
                .unwrap_or_default(),
            calories: self
                .calories
                .map(|c| format!("{c} kcal"))
                .unwrap_or_default(),
            image_prompt: self.image_prompt.clone().unwrap_or_default(),
        }
    }

    fn details(self) -> Option<RecipeDetails> {
        let steps = self.steps.filter(|s| !s.is_empty())?;
        Some(RecipeDetails {
            id: self.id,
            title: self.title,
            description: self.description.unwrap_or_default(),
            time: self
                .time_minutes
                .map(|m| format!("{m} mins"))
                .unwrap_or_default(),
            servings: self
                .servings
                .map(|s| format!("{s} servings"))
                .unwrap_or_default(),
            difficulty: self.difficulty.unwrap_or_default(),
            ingredients: self.ingredients.unwrap_or_default(),
            steps,
            image_prompt: self.image_prompt.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RecipeStore for SupabaseStore {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError> {
        let count = new.steps.len();
        let row = self
            .insert(
                "cooking_sessions",
                json!({
                    "user_id": self.user_id,
                    "recipe_id": new.recipe_id,
                    "session_status": SessionStatus::InProgress,
                    "original_steps_count": count,
                    "current_steps": new.steps,
                    "total_steps": count,
                    "current_step": 0,
                    "started_at": Utc::now(),
                }),
            )
            .await?;
        decode(row)
    }

    async fn update_session(
        &self,
        id: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        let mut body = serde_json::to_value(&update)
            .map_err(|e| StoreError::InvalidResponse(e.to_string()))?;
        if update.completes() {
            let started = self.session(id).await.ok().and_then(|s| s.started_at);
            if let (Some(start), Some(done)) = (started, update.completed_at) {
                body["total_duration_minutes"] = json!(duration_minutes(start, done));
            }
        }
        let mut filters = vec![("id", format!("eq.{id}"))];
        filters.extend(self.user_filter());
        let record: SessionRecord = decode(self.patch("cooking_sessions", &filters, body).await?)?;

        if update.status == Some(SessionStatus::Completed) {
            if let Err(e) = self
                .log_interaction(InteractionRecord::new(
                    &record.recipe_id,
                    InteractionKind::Completed,
                    "cooking_page",
                ))
                .await
            {
                tracing::warn!(error = %e, "failed to log completion interaction");
            }
        }
        Ok(record)
    }

    async fn log_step_time(&self, record: StepTimeRecord) -> Result<(), StoreError> {
        self.insert(
            "cooking_step_times",
            json!({
                "cooking_session_id": record.session_id,
                "recipe_id": record.recipe_id,
                "user_id": self.user_id,
                "step_number": record.step_label,
                "step_instruction": record.instruction,
                "started_at": record.started_at,
                "completed_at": record.completed_at,
                "needed_retry": record.needed_retry,
                "completed_successfully": true,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn log_validation(&self, record: ValidationRecord) -> Result<(), StoreError> {
        self.insert(
            "step_validations",
            json!({
                "cooking_session_id": record.session_id,
                "recipe_id": record.recipe_id,
                "step_number": record.step_label,
                "step_instruction": record.instruction,
                "validation_result": record.result_text,
                "validation_status": record.status,
                "confidence_level": record.confidence,
                "corrective_action_needed": record.status == ValidationStatus::Fail,
                "corrective_steps_added": record.corrective_steps_added,
            }),
        )
        .await?;

        let session = self.session(&record.session_id).await?;
        let passed = u32::from(record.status == ValidationStatus::Pass);
        let failed = u32::from(record.status == ValidationStatus::Fail);
        self.patch(
            "cooking_sessions",
            &[("id", format!("eq.{}", record.session_id))],
            json!({
                "ai_validations_count": session.ai_validations_count + 1,
                "ai_validations_passed": session.ai_validations_passed + passed,
                "ai_validations_failed": session.ai_validations_failed + failed,
                "corrective_steps_added": session.corrective_steps_added + record.corrective_steps_added,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn log_interaction(&self, record: InteractionRecord) -> Result<(), StoreError> {
        if self.user_id.is_none() {
            return Err(StoreError::Unauthorized);
        }
        self.insert(
            "user_recipe_interactions",
            json!({
                "user_id": self.user_id,
                "recipe_id": record.recipe_id,
                "interaction_type": record.kind,
                "source": record.source,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn find_recipes(
        &self,
        query: &str,
        diet: &str,
        limit: usize,
    ) -> Result<Vec<RecipeSummary>, StoreError> {
        let rows = self
            .select(
                "recipes",
                &[
                    ("select", "*".to_string()),
                    ("title", format!("ilike.*{query}*")),
                    ("diet_type", format!("eq.{diet}")),
                    ("order", "view_count.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        rows.into_iter()
            .map(|row| decode::<RecipeRow>(row).map(|r| r.summary()))
            .collect()
    }

    async fn get_recipe(&self, id: &str) -> Result<Option<RecipeDetails>, StoreError> {
        let rows = self
            .select(
                "recipes",
                &[("select", "*".to_string()), ("id", format!("eq.{id}"))],
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(decode::<RecipeRow>(row)?.details()),
            None => Ok(None),
        }
    }

    async fn upsert_summary(&self, recipe: &RecipeSummary, diet: &str) -> Result<(), StoreError> {
        self.upsert(
            "recipes",
            json!({
                "id": recipe.id,
                "title": recipe.title,
                "description": recipe.description,
                "time_minutes": digits_of(&recipe.time),
                "calories": digits_of(&recipe.calories),
                "diet_type": diet,
                "image_prompt": recipe.image_prompt,
            }),
        )
        .await
    }

    async fn upsert_details(&self, recipe: &RecipeDetails) -> Result<(), StoreError> {
        self.upsert(
            "recipes",
            json!({
                "id": recipe.id,
                "title": recipe.title,
                "description": recipe.description,
                "time_minutes": digits_of(&recipe.time),
                "servings": digits_of(&recipe.servings),
                "difficulty": recipe.difficulty.to_lowercase(),
                "ingredients": recipe.ingredients,
                "steps": recipe.steps,
                "image_prompt": recipe.image_prompt,
            }),
        )
        .await
    }

    async fn log_search(&self, entry: SearchLog) -> Result<(), StoreError> {
        if self.user_id.is_none() {
            return Ok(());
        }
        self.insert(
            "search_queries",
            json!({
                "user_id": self.user_id,
                "query_text": entry.query,
                "diet_filter": entry.diet,
                "recipes_count": entry.results,
                "response_time_ms": entry.response_time_ms,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        let user = self.require_user()?;
        let rows = self
            .select(
                "recipe_collections",
                &[
                    (
                        "select",
                        "*,recipe_collection_items(recipe_id,user_notes,added_at)".to_string(),
                    ),
                    ("user_id", format!("eq.{user}")),
                    ("order", "created_at.desc".to_string()),
                ],
            )
            .await?;
        rows.into_iter().map(decode::<Collection>).collect()
    }

    async fn create_collection(&self, new: NewCollection) -> Result<Collection, StoreError> {
        let user = self.require_user()?;
        let row = self
            .insert(
                "recipe_collections",
                json!({
                    "user_id": user,
                    "name": new.name,
                    "description": new.description,
                    "emoji": new.emoji.as_deref().unwrap_or(DEFAULT_COLLECTION_EMOJI),
                    "is_default": new.is_default,
                }),
            )
            .await?;
        decode(row)
    }

    async fn delete_collection(&self, id: &str) -> Result<(), StoreError> {
        let user = self.require_user()?;
        let deleted = self
            .delete(
                "recipe_collections",
                &[("id", format!("eq.{id}")), ("user_id", format!("eq.{user}"))],
            )
            .await?;
        if deleted.is_empty() {
            return Err(StoreError::NotFound(format!("collection {id}")));
        }
        Ok(())
    }

    async fn add_to_collection(
        &self,
        collection_id: &str,
        recipe_id: &str,
        notes: Option<String>,
    ) -> Result<CollectionItem, StoreError> {
        let user = self.require_user()?;
        let owned = self
            .select(
                "recipe_collections",
                &[
                    ("select", "id".to_string()),
                    ("id", format!("eq.{collection_id}")),
                    ("user_id", format!("eq.{user}")),
                ],
            )
            .await?;
        if owned.is_empty() {
            return Err(StoreError::NotFound(format!("collection {collection_id}")));
        }

        let row = self
            .insert(
                "recipe_collection_items",
                json!({
                    "collection_id": collection_id,
                    "recipe_id": recipe_id,
                    "user_notes": notes,
                }),
            )
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => StoreError::Conflict(format!(
                    "recipe {recipe_id} is already in collection {collection_id}"
                )),
                other => other,
            })?;
        let item: CollectionItem = decode(row)?;

        if let Err(e) = self
            .log_interaction(InteractionRecord::new(
                recipe_id,
                InteractionKind::Saved,
                COLLECTION_SOURCE,
            ))
            .await
        {
            tracing::warn!(error = %e, "failed to log saved interaction");
        }
        Ok(item)
    }

    async fn remove_from_collection(
        &self,
        collection_id: &str,
        recipe_id: &str,
    ) -> Result<(), StoreError> {
        self.require_user()?;
        self.delete(
            "recipe_collection_items",
            &[
                ("collection_id", format!("eq.{collection_id}")),
                ("recipe_id", format!("eq.{recipe_id}")),
            ],
        )
        .await
        .map(|_| ())
    }

    async fn user_stats(&self, recent: usize) -> Result<UserStats, StoreError> {
        let user = self.require_user()?;
        let sessions = self
            .select(
                "cooking_sessions",
                &[
                    ("select", "*".to_string()),
                    ("user_id", format!("eq.{user}")),
                    ("order", "started_at.desc".to_string()),
                    ("limit", recent.to_string()),
                ],
            )
            .await?;
        let collections = self
            .select(
                "recipe_collections",
                &[("select", "id".to_string()), ("user_id", format!("eq.{user}"))],
            )
            .await?;
        Ok(UserStats {
            recent_sessions: sessions
                .into_iter()
                .map(decode::<SessionRecord>)
                .collect::<Result<_, _>>()?,
            collection_count: collections.len(),
        })
    }
}

async fn send_rows(request: RequestBuilder) -> Result<Vec<Value>, StoreError> {
    let response = request
        .send()
        .await
        .map_err(|e| StoreError::Request(e.to_string()))?;
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(StoreError::Unauthorized);
    }
    if status == reqwest::StatusCode::CONFLICT {
        return Err(StoreError::Conflict("unique constraint violated".to_string()));
    }
    if !status.is_success() {
        return Err(StoreError::Request(format!(
            "http status {} from store",
            status
        )));
    }
    match response
        .json::<Value>()
        .await
        .map_err(|e| StoreError::InvalidResponse(e.to_string()))?
    {
        Value::Array(rows) => Ok(rows),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}

fn first_row(rows: Vec<Value>) -> Result<Value, StoreError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound("no row returned".to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(row: Value) -> Result<T, StoreError> {
    serde_json::from_value(row).map_err(|e| StoreError::InvalidResponse(e.to_string()))
}
