#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

//! Core library for the ChefQuest CLI.
//!
//! `chefquest_core` provides:
//! - the guided cooking session controller via [`session`]
//! - AI recipe client adapters via [`providers`]
//! - persistence of recipes and session logs via [`persistence`]
//! - recipe search and detail lookups via [`catalog`] and [`cache`]
//! - kitchen tool checklists via [`prepare`]
//! - scoped capture-device access via [`camera`]
//! - the interactive cooking shell via [`repl`]
//! - shared configuration and record types via [`types`]
//!
//! # Quick Start
//!
//! ```no_run
//! use chefquest_core::cache::RecipeCache;
//! use chefquest_core::catalog::RecipeCatalog;
//! use chefquest_core::persistence::MemoryStore;
//! use chefquest_core::providers::MockProvider;
//! use chefquest_core::session::CookingSession;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let ai = Arc::new(MockProvider::new());
//! let store = Arc::new(MemoryStore::new());
//! let mut catalog = RecipeCatalog::new(ai.clone(), store.clone(), RecipeCache::default());
//! let recipe = catalog.details("masala-omelette", None).await?;
//!
//! let mut session = CookingSession::start(&recipe, ai, store).await;
//! let first = session.steps()[0].id;
//! session.toggle_completion(first).await?;
//! assert!(session.is_unlocked(1));
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod camera;
pub mod catalog;
pub mod persistence;
pub mod prepare;
pub mod providers;
pub mod repl;
pub mod session;
pub mod types;
