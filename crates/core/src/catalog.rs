//! Recipe search and detail lookups across cache, store and AI.

use crate::cache::RecipeCache;
use crate::persistence::{InteractionKind, InteractionRecord, RecipeStore, SearchLog};
use crate::providers::{ProviderError, RecipeAi};
use crate::types::{RecipeDetails, RecipeSummary};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use thiserror::Error;

/// Diet recorded for recipes when the search did not name one.
pub const DEFAULT_DIET: &str = "veg";
/// Stored matches needed before the AI is skipped.
pub const MIN_STORED_MATCHES: usize = 3;
pub const SEARCH_BATCH: usize = 6;
pub const LOAD_MORE_BATCH: usize = 5;

const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("search query is empty")]
    EmptyQuery,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeSource {
    Cache,
    Database,
    Ai,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub recipes: Vec<RecipeSummary>,
    pub source: RecipeSource,
    pub page: u32,
}

pub struct RecipeCatalog<A, S>
where
    A: RecipeAi,
    S: RecipeStore,
{
    ai: A,
    store: S,
    cache: RecipeCache,
}

impl<A, S> RecipeCatalog<A, S>
where
    A: RecipeAi,
    S: RecipeStore,
{
    pub fn new(ai: A, store: S, cache: RecipeCache) -> Self {
        Self { ai, store, cache }
    }

    pub fn ai(&self) -> &A {
        &self.ai
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cache_mut(&mut self) -> &mut RecipeCache {
        &mut self.cache
    }

    /// Finds recipes for `query`, preferring cached and stored results over the AI.
    pub async fn search(
        &mut self,
        query: &str,
        diet: Option<&str>,
        language: Option<&str>,
    ) -> Result<SearchResults, CatalogError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CatalogError::EmptyQuery);
        }
        let language = language.unwrap_or(DEFAULT_LANGUAGE);
        let started = Instant::now();

        let cached = self
            .cache
            .get_recipes(query, diet, Some(language))
            .filter(|recipes| !recipes.is_empty());
        if let Some(recipes) = cached {
            tracing::debug!(query, count = recipes.len(), "search served from cache");
            return Ok(SearchResults {
                page: self.cache.recipes_page(query, diet, Some(language)),
                recipes,
                source: RecipeSource::Cache,
            });
        }

        let stored_diet = diet.unwrap_or(DEFAULT_DIET);
        match self
            .store
            .find_recipes(query, stored_diet, SEARCH_BATCH)
            .await
        {
            Ok(stored) if stored.len() >= MIN_STORED_MATCHES => {
                tracing::debug!(query, count = stored.len(), "search served from store");
                self.log_search(query, diet, stored.len(), false, started)
                    .await;
                self.cache
                    .set_recipes(query, diet, Some(language), stored.clone(), 1);
                return Ok(SearchResults {
                    recipes: stored,
                    source: RecipeSource::Database,
                    page: 1,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "stored recipe lookup failed; asking the AI"),
        }

        let recipes = self
            .ai
            .search_recipes(query, diet, SEARCH_BATCH, language)
            .await?;
        for recipe in &recipes {
            if let Err(e) = self.store.upsert_summary(recipe, stored_diet).await {
                tracing::warn!(error = %e, recipe = %recipe.id, "failed to save recipe");
            }
        }
        self.log_search(query, diet, recipes.len(), true, started)
            .await;
        // An empty reply may be a swallowed provider failure; ask again next time.
        if !recipes.is_empty() {
            self.cache
                .set_recipes(query, diet, Some(language), recipes.clone(), 1);
        }
        Ok(SearchResults {
            recipes,
            source: RecipeSource::Ai,
            page: 1,
        })
    }

    /// Generates more recipes for a search already made; returns only the new ones.
    ///
    /// An empty result means there is nothing more to show.
    pub async fn load_more(
        &mut self,
        query: &str,
        diet: Option<&str>,
        language: Option<&str>,
    ) -> Result<Vec<RecipeSummary>, CatalogError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CatalogError::EmptyQuery);
        }
        let language = language.unwrap_or(DEFAULT_LANGUAGE);
        let mut existing = self
            .cache
            .get_recipes(query, diet, Some(language))
            .unwrap_or_default();
        let page = self.cache.recipes_page(query, diet, Some(language));

        let generated = self
            .ai
            .search_recipes(query, diet, LOAD_MORE_BATCH, language)
            .await?;
        let mut seen: HashSet<String> = existing.iter().map(|r| r.title.to_lowercase()).collect();
        let fresh: Vec<RecipeSummary> = generated
            .into_iter()
            .filter(|r| seen.insert(r.title.to_lowercase()))
            .collect();
        tracing::debug!(query, page, fresh = fresh.len(), "loaded more recipes");

        let stored_diet = diet.unwrap_or(DEFAULT_DIET);
        for recipe in &fresh {
            if let Err(e) = self.store.upsert_summary(recipe, stored_diet).await {
                tracing::warn!(error = %e, recipe = %recipe.id, "failed to save recipe");
            }
        }
        if !fresh.is_empty() {
            existing.extend(fresh.iter().cloned());
            self.cache
                .set_recipes(query, diet, Some(language), existing, page + 1);
        }
        Ok(fresh)
    }

    /// Full recipe by id: cache, then store, then the AI.
    pub async fn details(
        &mut self,
        id: &str,
        language: Option<&str>,
    ) -> Result<RecipeDetails, CatalogError> {
        if let Some(recipe) = self.cache.get_recipe_details(id) {
            tracing::debug!(recipe = id, "details served from cache");
            return Ok(recipe);
        }

        match self.store.get_recipe(id).await {
            Ok(Some(recipe)) => {
                tracing::debug!(recipe = id, "details served from store");
                self.viewed(id).await;
                self.cache.set_recipe_details(id, recipe.clone());
                return Ok(recipe);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, recipe = id, "stored details lookup failed"),
        }

        let title = title_from_id(id);
        let recipe = self
            .ai
            .get_recipe_details(id, &title, language.unwrap_or(DEFAULT_LANGUAGE))
            .await?;
        if let Err(e) = self.store.upsert_details(&recipe).await {
            tracing::warn!(error = %e, recipe = id, "failed to save recipe details");
        }
        self.viewed(id).await;
        self.cache.set_recipe_details(id, recipe.clone());
        Ok(recipe)
    }

    async fn viewed(&self, id: &str) {
        let record = InteractionRecord::new(id, InteractionKind::Viewed, "recipe_page");
        if let Err(e) = self.store.log_interaction(record).await {
            tracing::debug!(error = %e, recipe = id, "view not recorded");
        }
    }

    async fn log_search(
        &self,
        query: &str,
        diet: Option<&str>,
        results: usize,
        generated: bool,
        started: Instant,
    ) {
        let entry = SearchLog {
            query: query.to_string(),
            diet: diet.map(str::to_string),
            results,
            generated,
            response_time_ms: started.elapsed().as_millis() as u64,
        };
        if let Err(e) = self.store.log_search(entry).await {
            tracing::warn!(error = %e, "failed to log search");
        }
    }
}

/// Human title from a kebab-case recipe id.
///
/// ```
/// use chefquest_core::catalog::title_from_id;
///
/// assert_eq!(title_from_id("paneer-butter-masala"), "Paneer Butter Masala");
/// ```
pub fn title_from_id(id: &str) -> String {
    id.split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
