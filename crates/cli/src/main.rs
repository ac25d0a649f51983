mod logging;

use chefquest_core::cache::RecipeCache;
use chefquest_core::camera::{CameraGuard, FileCamera};
use chefquest_core::catalog::{CatalogError, RecipeCatalog};
use chefquest_core::persistence::{
    Collection, MemoryStore, NewCollection, RecipeStore, StoreError,
};
#[cfg(feature = "store-supabase")]
use chefquest_core::persistence::SupabaseStore;
#[cfg(feature = "provider-gemini")]
use chefquest_core::providers::{GeminiProvider, DEFAULT_GEMINI_ENDPOINT};
use chefquest_core::providers::{MockProvider, RecipeAi};
use chefquest_core::prepare::{find_tool, identify_into, ToolChecklist};
use chefquest_core::repl::run_cooking_repl;
use chefquest_core::session::CookingSession;
use chefquest_core::types::{AppConfig, JsonEnvelope, RecipeDetails, RecipeSummary};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use toml::Value;

const CONFIG_FILE: &str = ".chefquest.toml";

#[derive(Debug, Parser)]
#[command(
    name = "chefquest",
    version,
    about = "Find recipes and cook them step by step with AI photo checks"
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    /// Use the built-in mock AI and an in-memory store.
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    InitConfig {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Search {
        query: String,
        #[arg(long)]
        diet: Option<String>,
        #[arg(long)]
        lang: Option<String>,
        /// Ask for more recipes after the first page.
        #[arg(long, default_value_t = false)]
        more: bool,
    },
    Details {
        id: String,
        #[arg(long)]
        lang: Option<String>,
    },
    Tools {
        recipe_id: String,
        /// Photo of your kitchen counter to detect tools from.
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long)]
        lang: Option<String>,
    },
    Cook {
        recipe_id: String,
        #[arg(long)]
        lang: Option<String>,
    },
    /// Manage saved recipe collections.
    Collections {
        #[command(subcommand)]
        action: CollectionAction,
    },
    /// Recent cooking sessions and how many collections you have.
    Stats {
        #[arg(long, default_value_t = 5)]
        recent: usize,
    },
}

#[derive(Debug, Subcommand)]
enum CollectionAction {
    List,
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        emoji: Option<String>,
        /// Mark as the collection new saves go to.
        #[arg(long, default_value_t = false)]
        default: bool,
    },
    Delete {
        id: String,
    },
    Add {
        collection_id: String,
        recipe_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    Remove {
        collection_id: String,
        recipe_id: String,
    },
}

type Catalog = RecipeCatalog<Arc<dyn RecipeAi>, Arc<dyn RecipeStore>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { force } = cli.cmd {
        init_config_file(Path::new(CONFIG_FILE), force)?;
        println!("initialized {CONFIG_FILE}");
        return Ok(());
    }

    let mut cfg = load_config()?;
    if cli.offline {
        apply_offline(&mut cfg);
    }
    logging::init_logging(&cfg.logging);

    let ai = build_ai(&cfg, |k| std::env::var(k).ok());
    let store = build_store(&cfg, |k| std::env::var(k).ok());
    let mut catalog: Catalog = RecipeCatalog::new(
        ai.clone(),
        store.clone(),
        RecipeCache::new(Duration::from_secs(cfg.cache.ttl_secs)),
    );

    match cli.cmd {
        Commands::InitConfig { .. } => {}
        Commands::Search {
            query,
            diet,
            lang,
            more,
        } => {
            let lang = lang.unwrap_or_else(|| cfg.cooking.language.clone());
            run_search(&mut catalog, &query, diet.as_deref(), &lang, more, cli.json).await?;
        }
        Commands::Details { id, lang } => {
            let lang = lang.unwrap_or_else(|| cfg.cooking.language.clone());
            let recipe = catalog
                .details(&id, Some(&lang))
                .await
                .map_err(render_catalog_error)?;
            if cli.json {
                print_envelope("details", "recipe loaded", json!(recipe))?;
            } else {
                print_recipe(&recipe);
            }
        }
        Commands::Tools {
            recipe_id,
            image,
            lang,
        } => {
            let lang = lang.unwrap_or_else(|| cfg.cooking.language.clone());
            let recipe = catalog
                .details(&recipe_id, Some(&lang))
                .await
                .map_err(render_catalog_error)?;
            run_tools(ai.as_ref(), &recipe, image, cli.json).await?;
        }
        Commands::Cook { recipe_id, lang } => {
            let lang = lang.unwrap_or_else(|| cfg.cooking.language.clone());
            let recipe = catalog
                .details(&recipe_id, Some(&lang))
                .await
                .map_err(render_catalog_error)?;
            println!("{}", recipe.title);
            let mut session = CookingSession::start(&recipe, ai, store)
                .await
                .with_notice_ttl(Duration::from_secs(cfg.cooking.notice_secs));
            if session.session_id().is_none() {
                eprintln!("warning: progress will not be saved for this session");
            }
            run_cooking_repl(&mut session).await?;
            if cli.json {
                let progress = session.progress();
                print_envelope(
                    "cook",
                    if session.is_complete() {
                        "session completed"
                    } else {
                        "session left unfinished"
                    },
                    json!({
                        "recipe_id": recipe.id,
                        "session_id": session.session_id(),
                        "progress": progress,
                    }),
                )?;
            }
        }
        Commands::Collections { action } => {
            run_collections(store.as_ref(), action, cli.json).await?;
        }
        Commands::Stats { recent } => {
            let stats = store.user_stats(recent).await.map_err(render_store_error)?;
            if cli.json {
                print_envelope("stats", "stats loaded", json!(stats))?;
            } else {
                println!("collections: {}", stats.collection_count);
                println!("recent sessions:");
                for session in &stats.recent_sessions {
                    println!(
                        "  {}  {:?}  {}/{} steps",
                        session.recipe_id, session.status, session.current_step, session.total_steps
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_collections(
    store: &dyn RecipeStore,
    action: CollectionAction,
    json_output: bool,
) -> anyhow::Result<()> {
    match action {
        CollectionAction::List => {
            let collections = store.list_collections().await.map_err(render_store_error)?;
            if json_output {
                return print_envelope(
                    "collections",
                    &format!("{} collections", collections.len()),
                    json!({ "collections": collections }),
                );
            }
            if collections.is_empty() {
                println!("no collections yet; create one with `chefquest collections create <name>`");
            }
            for collection in &collections {
                print_collection(collection);
            }
        }
        CollectionAction::Create {
            name,
            description,
            emoji,
            default,
        } => {
            if name.trim().is_empty() {
                anyhow::bail!("collection name is empty");
            }
            let collection = store
                .create_collection(NewCollection {
                    name,
                    description,
                    emoji,
                    is_default: default,
                })
                .await
                .map_err(render_store_error)?;
            if json_output {
                return print_envelope("collections", "collection created", json!(collection));
            }
            println!("created {} {} ({})", collection.emoji, collection.name, collection.id);
        }
        CollectionAction::Delete { id } => {
            store.delete_collection(&id).await.map_err(render_store_error)?;
            if json_output {
                return print_envelope("collections", "collection deleted", json!({ "id": id }));
            }
            println!("deleted collection {id}");
        }
        CollectionAction::Add {
            collection_id,
            recipe_id,
            notes,
        } => {
            let item = store
                .add_to_collection(&collection_id, &recipe_id, notes)
                .await
                .map_err(render_store_error)?;
            if json_output {
                return print_envelope("collections", "recipe saved", json!(item));
            }
            println!("saved {recipe_id} to {collection_id}");
        }
        CollectionAction::Remove {
            collection_id,
            recipe_id,
        } => {
            store
                .remove_from_collection(&collection_id, &recipe_id)
                .await
                .map_err(render_store_error)?;
            if json_output {
                return print_envelope(
                    "collections",
                    "recipe removed",
                    json!({ "collection_id": collection_id, "recipe_id": recipe_id }),
                );
            }
            println!("removed {recipe_id} from {collection_id}");
        }
    }
    Ok(())
}

fn print_collection(collection: &Collection) {
    let marker = if collection.is_default { " (default)" } else { "" };
    println!(
        "{}  {} {}{}  [{} recipes]",
        collection.id,
        collection.emoji,
        collection.name,
        marker,
        collection.items.len()
    );
    if let Some(description) = collection.description.as_deref().filter(|d| !d.is_empty()) {
        println!("    {description}");
    }
    for item in &collection.items {
        match item.notes.as_deref() {
            Some(notes) => println!("    - {} ({notes})", item.recipe_id),
            None => println!("    - {}", item.recipe_id),
        }
    }
}

async fn run_search(
    catalog: &mut Catalog,
    query: &str,
    diet: Option<&str>,
    lang: &str,
    more: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    let results = catalog
        .search(query, diet, Some(lang))
        .await
        .map_err(render_catalog_error)?;
    let extra = if more {
        catalog
            .load_more(query, diet, Some(lang))
            .await
            .map_err(render_catalog_error)?
    } else {
        Vec::new()
    };

    if json_output {
        return print_envelope(
            "search",
            &format!("{} recipes found", results.recipes.len() + extra.len()),
            json!({
                "source": results.source,
                "page": results.page,
                "recipes": results.recipes,
                "more": extra,
            }),
        );
    }

    if results.recipes.is_empty() {
        println!("no recipes found for \"{query}\"");
        return Ok(());
    }
    for recipe in &results.recipes {
        print_summary(recipe);
    }
    if more {
        if extra.is_empty() {
            println!("no more recipes");
        }
        for recipe in &extra {
            print_summary(recipe);
        }
    }
    Ok(())
}

async fn run_tools(
    ai: &dyn RecipeAi,
    recipe: &RecipeDetails,
    image: Option<PathBuf>,
    json_output: bool,
) -> anyhow::Result<()> {
    let mut checklist = ToolChecklist::for_recipe(recipe);
    let mut identified = 0;
    if let Some(path) = image {
        let camera = FileCamera::new(path);
        let mut guard = CameraGuard::acquire(&camera).await?;
        let frame = guard.capture().await;
        guard.release();
        identified = identify_into(ai, &frame?, &mut checklist).await?;
    }

    let selected = checklist.selected();
    if json_output {
        return print_envelope(
            "tools",
            &format!("{} tools ready", selected.len()),
            json!({ "tools": selected, "identified": identified }),
        );
    }
    println!("Tools for {}:", recipe.title);
    for id in selected {
        let tool = find_tool(id);
        let name = tool.map(|t| t.name).unwrap_or(id);
        let optional = if tool.is_some_and(|t| t.optional) {
            " (optional)"
        } else {
            ""
        };
        println!("  - {name}{optional}");
    }
    if identified > 0 {
        println!("{identified} spotted in your photo");
    }
    Ok(())
}

fn print_summary(recipe: &RecipeSummary) {
    println!("{}  {}", recipe.id, recipe.title);
    println!("    {} | {}", recipe.time, recipe.calories);
    if !recipe.description.is_empty() {
        println!("    {}", recipe.description);
    }
}

fn print_recipe(recipe: &RecipeDetails) {
    println!("{}", recipe.title);
    println!("{}", recipe.description);
    println!(
        "{} | {} | {}",
        recipe.time, recipe.servings, recipe.difficulty
    );
    println!();
    println!("Ingredients:");
    for ingredient in &recipe.ingredients {
        println!("  - {} {}", ingredient.quantity, ingredient.item);
    }
    println!();
    println!("Steps:");
    for step in &recipe.steps {
        println!("  {}. {}", step.step_number, step.instruction);
    }
}

fn print_envelope(phase: &str, message: &str, details: serde_json::Value) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&JsonEnvelope {
            status: "ok".to_string(),
            phase: phase.to_string(),
            message: message.to_string(),
            details,
        })?
    );
    Ok(())
}

fn apply_offline(cfg: &mut AppConfig) {
    cfg.ai.provider = "mock".to_string();
    cfg.store.backend = "memory".to_string();
}

fn build_ai<F>(cfg: &AppConfig, env_get: F) -> Arc<dyn RecipeAi>
where
    F: Fn(&str) -> Option<String>,
{
    let provider = cfg.ai.provider.to_ascii_lowercase();
    match provider.as_str() {
        "mock" => Arc::new(MockProvider::new()),
        #[cfg(feature = "provider-gemini")]
        _ => {
            let api_key = env_get(&cfg.ai.api_key_env_var).filter(|k| !k.trim().is_empty());
            if api_key.is_none() {
                tracing::warn!(
                    var = %cfg.ai.api_key_env_var,
                    "no Gemini API key set; AI requests will be rejected"
                );
            }
            Arc::new(GeminiProvider::new(
                resolve_ai_endpoint(cfg),
                api_key,
                cfg.ai.model.clone(),
                cfg.ai.temperature,
                Duration::from_millis(cfg.ai.timeout_ms),
            ))
        }
        #[cfg(not(feature = "provider-gemini"))]
        _ => {
            let _ = env_get;
            Arc::new(MockProvider::new())
        }
    }
}

#[cfg(feature = "provider-gemini")]
fn resolve_ai_endpoint(cfg: &AppConfig) -> String {
    cfg.ai
        .endpoint
        .clone()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GEMINI_ENDPOINT.to_string())
}

fn build_store<F>(cfg: &AppConfig, env_get: F) -> Arc<dyn RecipeStore>
where
    F: Fn(&str) -> Option<String> + Copy,
{
    let backend = cfg.store.backend.to_ascii_lowercase();
    let user_id = cfg.store.user_id.clone().filter(|u| !u.trim().is_empty());
    match backend.as_str() {
        #[cfg(feature = "store-supabase")]
        "supabase" => {
            let url = resolve_store_url(cfg, env_get);
            let key = env_get(&cfg.store.key_env_var).filter(|k| !k.trim().is_empty());
            let (Some(url), Some(key)) = (url, key) else {
                tracing::warn!("store url or key missing; keeping data in memory only");
                return Arc::new(memory_store(user_id));
            };
            let token = env_get(&cfg.store.access_token_env_var).filter(|t| !t.trim().is_empty());
            match SupabaseStore::new(&url, key, token, user_id.clone()) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    tracing::warn!(error = %e, "store unavailable; keeping data in memory only");
                    Arc::new(memory_store(user_id))
                }
            }
        }
        _ => Arc::new(memory_store(user_id)),
    }
}

fn memory_store(user_id: Option<String>) -> MemoryStore {
    match user_id {
        Some(user) => MemoryStore::with_user(user),
        None => MemoryStore::new(),
    }
}

fn resolve_store_url<F>(cfg: &AppConfig, env_get: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    cfg.store
        .url
        .clone()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| env_get(&cfg.store.url_env_var))
        .filter(|v| !v.trim().is_empty())
}

fn load_config() -> anyhow::Result<AppConfig> {
    let local_path = PathBuf::from(CONFIG_FILE);
    let home_path = std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(CONFIG_FILE));

    let home = match &home_path {
        Some(path) => read_config_value(path)?,
        None => None,
    };
    let local = read_config_value(&local_path)?;

    resolve_config(home, local, |k| std::env::var(k).ok())
}

fn resolve_config<F>(
    home: Option<Value>,
    local: Option<Value>,
    env_get: F,
) -> anyhow::Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = Value::try_from(AppConfig::default())?;
    if let Some(home_value) = home {
        merge_toml(&mut merged, home_value);
    }
    if let Some(local_value) = local {
        merge_toml(&mut merged, local_value);
    }

    let mut cfg: AppConfig = merged.try_into()?;
    apply_env_overrides(&mut cfg, env_get);
    Ok(cfg)
}

fn read_config_value(path: &Path) -> anyhow::Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    let parsed = raw.parse::<Value>()?;
    Ok(Some(parsed))
}

fn merge_toml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_map), Value::Table(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(&key) {
                    merge_toml(base_value, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value;
        }
    }
}

fn apply_env_overrides<F>(cfg: &mut AppConfig, env_get: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = env_get("CHEFQUEST_AI_PROVIDER") {
        cfg.ai.provider = v;
    }
    if let Some(v) = env_get("CHEFQUEST_MODEL") {
        cfg.ai.model = v;
    }
    if let Some(v) = env_get("CHEFQUEST_ENDPOINT") {
        cfg.ai.endpoint = Some(v);
    }
    if let Some(v) = env_get("CHEFQUEST_TEMPERATURE").and_then(|v| v.parse::<f32>().ok()) {
        cfg.ai.temperature = v;
    }
    if let Some(v) = env_get("CHEFQUEST_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.ai.timeout_ms = v;
    }
    if let Some(v) = env_get("CHEFQUEST_API_KEY_ENV_VAR") {
        cfg.ai.api_key_env_var = v;
    }

    if let Some(v) = env_get("CHEFQUEST_STORE_BACKEND") {
        cfg.store.backend = v;
    }
    if let Some(v) = env_get("CHEFQUEST_STORE_URL") {
        cfg.store.url = Some(v);
    }
    if let Some(v) = env_get("CHEFQUEST_USER_ID") {
        cfg.store.user_id = Some(v);
    }

    if let Some(v) = env_get("CHEFQUEST_CACHE_TTL_SECS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.cache.ttl_secs = v;
    }

    if let Some(v) = env_get("CHEFQUEST_LANGUAGE") {
        cfg.cooking.language = v;
    }
    if let Some(v) = env_get("CHEFQUEST_NOTICE_SECS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.cooking.notice_secs = v;
    }

    if let Some(v) = env_get("CHEFQUEST_LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env_get("CHEFQUEST_LOG_JSON").and_then(|v| parse_bool(&v)) {
        cfg.logging.json = v;
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn init_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; re-run with --force to overwrite",
            path.display()
        );
    }
    fs::write(path, config_template())?;
    Ok(())
}

fn config_template() -> &'static str {
    r#"# chefquest configuration
# precedence: CLI > env > local .chefquest.toml > home ~/.chefquest.toml > defaults

[ai]
# provider options: gemini, mock
provider = "gemini"
# optional endpoint override for Gemini-compatible gateways
# endpoint = "https://generativelanguage.googleapis.com/v1beta"
model = "gemini-2.5-flash"
temperature = 0.4
api_key_env_var = "GEMINI_API_KEY"
timeout_ms = 60000

[store]
# backend options: supabase, memory
backend = "supabase"
# url = "https://your-project.supabase.co"
url_env_var = "SUPABASE_URL"
key_env_var = "SUPABASE_ANON_KEY"
access_token_env_var = "SUPABASE_ACCESS_TOKEN"
# user_id = ""

[cache]
ttl_secs = 1800

[cooking]
language = "en"
notice_secs = 10

[logging]
# trace, debug, info, warn, error; RUST_LOG overrides
level = "warn"
json = false
"#
}

fn render_catalog_error(err: CatalogError) -> anyhow::Error {
    match err {
        CatalogError::EmptyQuery => anyhow::anyhow!("search query is empty; try `chefquest search \"paneer\"`"),
        CatalogError::Provider(e) => {
            anyhow::anyhow!("recipe service unavailable: {e}; retry later or use --offline")
        }
    }
}

fn render_store_error(err: StoreError) -> anyhow::Error {
    match err {
        StoreError::Unauthorized => anyhow::anyhow!(
            "not signed in; set store.user_id in {CONFIG_FILE} or CHEFQUEST_USER_ID"
        ),
        StoreError::NotFound(what) => {
            anyhow::anyhow!("{what} not found; run `chefquest collections list` to see yours")
        }
        StoreError::Conflict(what) => anyhow::anyhow!("{what}"),
        other => anyhow::anyhow!("{other}; retry later or use --offline"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn config_precedence_cli_env_local_home_defaults() {
        let home = Some(
            r#"
            [ai]
            model = "home-model"

            [cache]
            ttl_secs = 99
            "#
            .parse::<Value>()
            .expect("home parse"),
        );

        let local = Some(
            r#"
            [ai]
            model = "local-model"

            [logging]
            json = true
            "#
            .parse::<Value>()
            .expect("local parse"),
        );

        let env = HashMap::from([
            ("CHEFQUEST_MODEL".to_string(), "env-model".to_string()),
            ("CHEFQUEST_AI_PROVIDER".to_string(), "mock".to_string()),
            ("CHEFQUEST_NOTICE_SECS".to_string(), "15".to_string()),
        ]);

        let cfg = resolve_config(home, local, |k| env.get(k).cloned()).expect("resolve config");

        assert_eq!(cfg.ai.model, "env-model");
        assert_eq!(cfg.ai.provider, "mock");
        assert!(cfg.logging.json);
        assert_eq!(cfg.cache.ttl_secs, 99);
        assert_eq!(cfg.cooking.notice_secs, 15);
        assert_eq!(cfg.store.backend, "supabase");
    }

    #[test]
    fn template_parses_into_defaults() {
        let value = config_template().parse::<Value>().expect("template parse");
        let cfg = resolve_config(None, Some(value), |_| None).expect("resolve config");
        assert_eq!(cfg.ai.model, AppConfig::default().ai.model);
        assert_eq!(cfg.cooking.notice_secs, 10);
        assert_eq!(cfg.store.url, None);
    }

    #[test]
    fn init_config_requires_force_to_overwrite() {
        let base = std::env::temp_dir().join(format!(
            "chefquest-cli-test-{}-{}",
            std::process::id(),
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        fs::create_dir_all(&base).expect("create temp dir");
        let cfg_path = base.join(CONFIG_FILE);

        init_config_file(&cfg_path, false).expect("must create first config");
        let err = init_config_file(&cfg_path, false).expect_err("must reject overwrite");
        assert!(err.to_string().contains("--force"));

        init_config_file(&cfg_path, true).expect("force overwrite should succeed");
        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert!(content.contains("[cooking]"));

        fs::remove_dir_all(&base).expect("cleanup temp dir");
    }

    #[test]
    fn store_url_prefers_config_then_env() {
        let mut cfg = AppConfig::default();
        cfg.store.url = Some("https://config.supabase.co".to_string());
        cfg.store.url_env_var = "CUSTOM_URL".to_string();

        let env = HashMap::from([(
            "CUSTOM_URL".to_string(),
            "https://env.supabase.co".to_string(),
        )]);

        let url = resolve_store_url(&cfg, |k| env.get(k).cloned());
        assert_eq!(url.as_deref(), Some("https://config.supabase.co"));

        cfg.store.url = Some("".to_string());
        let url = resolve_store_url(&cfg, |k| env.get(k).cloned());
        assert_eq!(url.as_deref(), Some("https://env.supabase.co"));
    }

    #[test]
    fn offline_switches_to_mock_and_memory() {
        let mut cfg = AppConfig::default();
        apply_offline(&mut cfg);
        assert_eq!(cfg.ai.provider, "mock");
        assert_eq!(cfg.store.backend, "memory");
    }

    #[test]
    fn bool_env_values_parse_loosely() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn search_command_parses_flags() {
        let cli = Cli::try_parse_from([
            "chefquest", "--offline", "search", "paneer tikka", "--diet", "veg", "--more",
        ])
        .expect("cli parse");

        assert!(cli.offline);
        match cli.cmd {
            Commands::Search {
                query, diet, more, lang,
            } => {
                assert_eq!(query, "paneer tikka");
                assert_eq!(diet.as_deref(), Some("veg"));
                assert!(more);
                assert_eq!(lang, None);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn tools_command_takes_image_path() {
        let cli = Cli::try_parse_from(["chefquest", "tools", "omelet", "--image", "counter.jpg", "--json"])
            .expect("cli parse");
        assert!(cli.json);
        match cli.cmd {
            Commands::Tools { recipe_id, image, .. } => {
                assert_eq!(recipe_id, "omelet");
                assert_eq!(image, Some(PathBuf::from("counter.jpg")));
            }
            _ => panic!("expected tools command"),
        }
    }

    #[tokio::test]
    async fn offline_catalog_serves_mock_details() {
        let mut cfg = AppConfig::default();
        apply_offline(&mut cfg);
        let ai = build_ai(&cfg, |_| None);
        let store = build_store(&cfg, |_| None);
        let mut catalog: Catalog = RecipeCatalog::new(ai, store, RecipeCache::default());
        let recipe = catalog.details("egg-bhurji", None).await.expect("details");
        assert_eq!(recipe.title, "Egg Bhurji");
        assert_eq!(recipe.steps.len(), 3);
    }

    #[tokio::test]
    async fn supabase_without_credentials_falls_back_to_memory() {
        let cfg = AppConfig::default();
        let store = build_store(&cfg, |_| None);
        assert!(store.find_recipes("soup", "veg", 3).await.expect("memory store").is_empty());
    }

    #[test]
    fn collections_add_parses_notes() {
        let cli = Cli::try_parse_from([
            "chefquest", "collections", "add", "c1", "omelet", "--notes", "extra cheese",
        ])
        .expect("cli parse");
        match cli.cmd {
            Commands::Collections {
                action:
                    CollectionAction::Add {
                        collection_id,
                        recipe_id,
                        notes,
                    },
            } => {
                assert_eq!(collection_id, "c1");
                assert_eq!(recipe_id, "omelet");
                assert_eq!(notes.as_deref(), Some("extra cheese"));
            }
            _ => panic!("expected collections add"),
        }
    }

    #[tokio::test]
    async fn collection_commands_drive_the_store() {
        let store: Arc<dyn RecipeStore> = Arc::new(MemoryStore::with_user("u1"));
        run_collections(
            store.as_ref(),
            CollectionAction::Create {
                name: "Weeknight".to_string(),
                description: None,
                emoji: None,
                default: true,
            },
            true,
        )
        .await
        .expect("create");
        let id = store.list_collections().await.expect("list")[0].id.clone();

        let add = || CollectionAction::Add {
            collection_id: id.clone(),
            recipe_id: "omelet".to_string(),
            notes: None,
        };
        run_collections(store.as_ref(), add(), true).await.expect("add");
        let err = run_collections(store.as_ref(), add(), true)
            .await
            .expect_err("duplicate save");
        assert!(err.to_string().contains("already in collection"));

        let blank = CollectionAction::Create {
            name: "  ".to_string(),
            description: None,
            emoji: None,
            default: false,
        };
        assert!(run_collections(store.as_ref(), blank, true).await.is_err());

        let collections = store.list_collections().await.expect("list");
        assert_eq!(collections.len(), 1);
        assert!(collections[0].contains("omelet"));
    }

    #[test]
    fn unauthorized_store_errors_point_at_user_id() {
        let err = render_store_error(StoreError::Unauthorized);
        assert!(err.to_string().contains("CHEFQUEST_USER_ID"));
    }
}
