use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Search result entry as returned by the AI recipe client or the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub time: String,
    pub calories: String,
    pub image_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ingredient {
    pub item: String,
    pub quantity: String,
}

/// A numbered instruction as it appears in a fetched recipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceStep {
    #[serde(deserialize_with = "step_number_from_any")]
    pub step_number: u32,
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeDetails {
    pub id: String,
    pub title: String,
    pub description: String,
    pub time: String,
    pub servings: String,
    pub difficulty: String,
    pub ingredients: Vec<Ingredient>,
    pub steps: Vec<SourceStep>,
    pub image_prompt: String,
}

/// Opaque, session-unique step identity. Never reused, independent of position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub u64);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Original,
    Corrective,
    Modified,
}

/// One entry of the working step list of a cooking session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeStep {
    pub id: StepId,
    /// Display label: the recipe's step number, or an AI-supplied label like `3a`.
    pub label: String,
    pub instruction: String,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_reason: Option<String>,
}

impl RecipeStep {
    pub fn is_modified(&self) -> bool {
        self.kind == StepKind::Modified
    }

    /// Leading integer of the label, `3` for both `"3"` and `"3a"`.
    pub fn number(&self) -> u32 {
        leading_number(&self.label).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepStatus {
    pub completed: bool,
    pub validated: bool,
    pub validation_result: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pass,
    Fail,
    Uncertain,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Uncertain => "uncertain",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Step payload sent to the AI when asking for adjustments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemainingStep {
    pub step_number: u32,
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrectiveStep {
    #[serde(deserialize_with = "label_from_any")]
    pub step_number: String,
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifiedStep {
    #[serde(deserialize_with = "label_from_any")]
    pub step_number: String,
    #[serde(default)]
    pub original_instruction: String,
    pub new_instruction: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAdjustment {
    pub needs_adjustment: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub corrective_steps: Vec<CorrectiveStep>,
    #[serde(default)]
    pub modified_steps: Vec<ModifiedStep>,
}

impl Default for TaskAdjustment {
    fn default() -> Self {
        Self {
            needs_adjustment: false,
            message: "Continue with the next steps.".to_string(),
            corrective_steps: Vec::new(),
            modified_steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonEnvelope {
    pub status: String,
    pub phase: String,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub api_key_env_var: String,
    pub timeout_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            endpoint: None,
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.4,
            api_key_env_var: "GEMINI_API_KEY".to_string(),
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub url_env_var: String,
    pub key_env_var: String,
    pub access_token_env_var: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "supabase".to_string(),
            url: None,
            url_env_var: "SUPABASE_URL".to_string(),
            key_env_var: "SUPABASE_ANON_KEY".to_string(),
            access_token_env_var: "SUPABASE_ACCESS_TOKEN".to_string(),
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 * 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookingConfig {
    pub language: String,
    pub notice_secs: u64,
}

impl Default for CookingConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            notice_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub ai: AiConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub cooking: CookingConfig,
    pub logging: LoggingConfig,
}

/// Parses the leading run of ASCII digits, so `"3a"` yields `3`.
pub fn leading_number(raw: &str) -> Option<u32> {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn label_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(number_label(&n)),
        other => Err(de::Error::custom(format!(
            "expected string or number step label, got {other}"
        ))),
    }
}

fn step_number_from_any<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => leading_number(s),
        _ => None,
    };
    parsed.ok_or_else(|| de::Error::custom(format!("invalid step number {value}")))
}

fn number_label(n: &serde_json::Number) -> String {
    if let Some(v) = n.as_i64() {
        return v.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}
