//! Short-lived memoization of search results and recipe details.
//!
//! Entries expire a fixed time after they were written; expired entries are
//! dropped on read. A miss always means "fetch live".

use crate::types::{RecipeDetails, RecipeSummary};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct SearchEntry {
    recipes: Vec<RecipeSummary>,
    page: u32,
    stored_at: Instant,
}

#[derive(Debug, Clone)]
struct DetailsEntry {
    recipe: RecipeDetails,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct RecipeCache {
    ttl: Duration,
    searches: HashMap<String, SearchEntry>,
    details: HashMap<String, DetailsEntry>,
}

impl Default for RecipeCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl RecipeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            searches: HashMap::new(),
            details: HashMap::new(),
        }
    }

    /// Normalized search key: lowercased query, diet or `all`, language or `en`.
    ///
    /// ```
    /// use chefquest_core::cache::RecipeCache;
    ///
    /// assert_eq!(RecipeCache::search_key("Pasta", None, None), "pasta_all_en");
    /// assert_eq!(RecipeCache::search_key("Pasta", Some("veg"), Some("hi")), "pasta_veg_hi");
    /// ```
    pub fn search_key(query: &str, diet: Option<&str>, language: Option<&str>) -> String {
        format!(
            "{}_{}_{}",
            query.to_lowercase(),
            diet.filter(|d| !d.is_empty()).unwrap_or("all"),
            language.filter(|l| !l.is_empty()).unwrap_or("en")
        )
    }

    pub fn get_recipes(
        &mut self,
        query: &str,
        diet: Option<&str>,
        language: Option<&str>,
    ) -> Option<Vec<RecipeSummary>> {
        let key = Self::search_key(query, diet, language);
        let stored_at = self.searches.get(&key)?.stored_at;
        if self.expired(stored_at) {
            self.searches.remove(&key);
            return None;
        }
        self.searches.get(&key).map(|e| e.recipes.clone())
    }

    pub fn set_recipes(
        &mut self,
        query: &str,
        diet: Option<&str>,
        language: Option<&str>,
        recipes: Vec<RecipeSummary>,
        page: u32,
    ) {
        self.searches.insert(
            Self::search_key(query, diet, language),
            SearchEntry {
                recipes,
                page,
                stored_at: Instant::now(),
            },
        );
    }

    /// Page counter of a cached search, `1` when nothing is cached.
    pub fn recipes_page(&self, query: &str, diet: Option<&str>, language: Option<&str>) -> u32 {
        self.searches
            .get(&Self::search_key(query, diet, language))
            .filter(|e| !self.expired(e.stored_at))
            .map(|e| e.page)
            .unwrap_or(1)
    }

    pub fn get_recipe_details(&mut self, id: &str) -> Option<RecipeDetails> {
        let stored_at = self.details.get(id)?.stored_at;
        if self.expired(stored_at) {
            self.details.remove(id);
            return None;
        }
        self.details.get(id).map(|e| e.recipe.clone())
    }

    pub fn set_recipe_details(&mut self, id: &str, recipe: RecipeDetails) {
        self.details.insert(
            id.to_string(),
            DetailsEntry {
                recipe,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear_all(&mut self) {
        self.searches.clear();
        self.details.clear();
    }

    fn expired(&self, stored_at: Instant) -> bool {
        stored_at.elapsed() > self.ttl
    }
}
