use crate::camera::CapturedImage;
use crate::prepare::KNOWN_TOOLS;
use crate::types::{RecipeDetails, RecipeSummary, RemainingStep, SourceStep, TaskAdjustment};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    InvalidResponse(String),
}

/// Generative AI operations used by the catalog, preparation and cooking flows.
///
/// Implementations decide their own fallbacks; the Gemini client returns empty
/// lists for search and tool identification instead of failing.
#[async_trait]
pub trait RecipeAi: Send + Sync {
    async fn search_recipes(
        &self,
        query: &str,
        diet: Option<&str>,
        count: usize,
        language: &str,
    ) -> Result<Vec<RecipeSummary>, ProviderError>;

    async fn get_recipe_details(
        &self,
        id: &str,
        title: &str,
        language: &str,
    ) -> Result<RecipeDetails, ProviderError>;

    /// Returns the AI's free-text verdict on whether `image` shows `instruction` done.
    async fn validate_step(
        &self,
        image: &CapturedImage,
        instruction: &str,
    ) -> Result<String, ProviderError>;

    async fn identify_tools(&self, image: &CapturedImage) -> Result<Vec<String>, ProviderError>;

    async fn suggest_adjustments(
        &self,
        failed_instruction: &str,
        validation_text: &str,
        remaining: &[RemainingStep],
    ) -> Result<TaskAdjustment, ProviderError>;
}

#[async_trait]
impl<T> RecipeAi for Box<T>
where
    T: RecipeAi + ?Sized,
{
    async fn search_recipes(
        &self,
        query: &str,
        diet: Option<&str>,
        count: usize,
        language: &str,
    ) -> Result<Vec<RecipeSummary>, ProviderError> {
        (**self).search_recipes(query, diet, count, language).await
    }

    async fn get_recipe_details(
        &self,
        id: &str,
        title: &str,
        language: &str,
    ) -> Result<RecipeDetails, ProviderError> {
        (**self).get_recipe_details(id, title, language).await
    }

    async fn validate_step(
        &self,
        image: &CapturedImage,
        instruction: &str,
    ) -> Result<String, ProviderError> {
        (**self).validate_step(image, instruction).await
    }

    async fn identify_tools(&self, image: &CapturedImage) -> Result<Vec<String>, ProviderError> {
        (**self).identify_tools(image).await
    }

    async fn suggest_adjustments(
        &self,
        failed_instruction: &str,
        validation_text: &str,
        remaining: &[RemainingStep],
    ) -> Result<TaskAdjustment, ProviderError> {
        (**self)
            .suggest_adjustments(failed_instruction, validation_text, remaining)
            .await
    }
}

#[async_trait]
impl<T> RecipeAi for Arc<T>
where
    T: RecipeAi + ?Sized,
{
    async fn search_recipes(
        &self,
        query: &str,
        diet: Option<&str>,
        count: usize,
        language: &str,
    ) -> Result<Vec<RecipeSummary>, ProviderError> {
        (**self).search_recipes(query, diet, count, language).await
    }

    async fn get_recipe_details(
        &self,
        id: &str,
        title: &str,
        language: &str,
    ) -> Result<RecipeDetails, ProviderError> {
        (**self).get_recipe_details(id, title, language).await
    }

    async fn validate_step(
        &self,
        image: &CapturedImage,
        instruction: &str,
    ) -> Result<String, ProviderError> {
        (**self).validate_step(image, instruction).await
    }

    async fn identify_tools(&self, image: &CapturedImage) -> Result<Vec<String>, ProviderError> {
        (**self).identify_tools(image).await
    }

    async fn suggest_adjustments(
        &self,
        failed_instruction: &str,
        validation_text: &str,
        remaining: &[RemainingStep],
    ) -> Result<TaskAdjustment, ProviderError> {
        (**self)
            .suggest_adjustments(failed_instruction, validation_text, remaining)
            .await
    }
}

pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Client for the Gemini `generateContent` REST endpoint.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    client: Client,
}

impl GeminiProvider {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            api_key,
            model,
            temperature,
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn generate_url(&self) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        ))
        .map_err(|e| ProviderError::Request(format!("invalid endpoint: {e}")))?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }
        Ok(url)
    }

    async fn generate(
        &self,
        prompt: String,
        image: Option<&CapturedImage>,
        config: GenerationConfig,
    ) -> Result<String, ProviderError> {
        let mut parts = vec![Part {
            text: Some(prompt),
            inline_data: None,
        }];
        if let Some(image) = image {
            parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: image.mime_type().to_string(),
                    data: image.base64_payload(),
                }),
            });
        }
        let payload = GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts,
            }],
            generation_config: config,
        };

        tracing::debug!(model = %self.model, "gemini generateContent");
        let request = self.client.post(self.generate_url()?).json(&payload);
        let value = send_json(request).await?;
        response_text(&value)
    }

    async fn generate_json<T: DeserializeOwned>(
        &self,
        prompt: String,
        image: Option<&CapturedImage>,
        config: GenerationConfig,
    ) -> Result<T, ProviderError> {
        let text = self.generate(prompt, image, config).await?;
        serde_json::from_str(&strip_code_fences(&text))
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }

    fn json_config(&self, temperature: f32, schema: Option<Value>) -> GenerationConfig {
        GenerationConfig {
            temperature,
            response_mime_type: Some("application/json".to_string()),
            response_schema: schema,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, serde::Deserialize)]
struct DetailsBody {
    title: String,
    description: String,
    time: String,
    servings: String,
    difficulty: String,
    ingredients: Vec<crate::types::Ingredient>,
    steps: Vec<SourceStep>,
    image_prompt: String,
}

#[async_trait]
impl RecipeAi for GeminiProvider {
    async fn search_recipes(
        &self,
        query: &str,
        diet: Option<&str>,
        count: usize,
        language: &str,
    ) -> Result<Vec<RecipeSummary>, ProviderError> {
        let config = self.json_config(self.temperature, Some(summary_schema()));
        match self
            .generate_json::<Vec<RecipeSummary>>(
                search_prompt(query, diet, count, language),
                None,
                config,
            )
            .await
        {
            Ok(recipes) => Ok(recipes),
            Err(e) => {
                tracing::warn!(error = %e, query, "recipe search failed; returning no results");
                Ok(Vec::new())
            }
        }
    }

    async fn get_recipe_details(
        &self,
        id: &str,
        title: &str,
        language: &str,
    ) -> Result<RecipeDetails, ProviderError> {
        let config = self.json_config(self.temperature, Some(details_schema()));
        let body: DetailsBody = self
            .generate_json(details_prompt(title, language), None, config)
            .await?;
        Ok(RecipeDetails {
            id: id.to_string(),
            title: body.title,
            description: body.description,
            time: body.time,
            servings: body.servings,
            difficulty: body.difficulty,
            ingredients: body.ingredients,
            steps: body.steps,
            image_prompt: body.image_prompt,
        })
    }

    async fn validate_step(
        &self,
        image: &CapturedImage,
        instruction: &str,
    ) -> Result<String, ProviderError> {
        let config = GenerationConfig {
            temperature: self.temperature,
            response_mime_type: None,
            response_schema: None,
        };
        self.generate(validation_prompt(instruction), Some(image), config)
            .await
    }

    async fn identify_tools(&self, image: &CapturedImage) -> Result<Vec<String>, ProviderError> {
        let config = self.json_config(0.3, None);
        match self
            .generate_json::<Vec<String>>(tools_prompt(), Some(image), config)
            .await
        {
            Ok(tools) => Ok(tools),
            Err(e) => {
                tracing::warn!(error = %e, "tool identification failed; returning no tools");
                Ok(Vec::new())
            }
        }
    }

    async fn suggest_adjustments(
        &self,
        failed_instruction: &str,
        validation_text: &str,
        remaining: &[RemainingStep],
    ) -> Result<TaskAdjustment, ProviderError> {
        let config = self.json_config(0.3, None);
        match self
            .generate_json::<TaskAdjustment>(
                adjustment_prompt(failed_instruction, validation_text, remaining),
                None,
                config,
            )
            .await
        {
            Ok(adjustment) => Ok(adjustment),
            Err(ProviderError::InvalidResponse(reason)) => {
                tracing::debug!(%reason, "unparseable adjustment reply; continuing unchanged");
                Ok(TaskAdjustment::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Deterministic offline provider. Replies can be scripted per call; unscripted
/// calls fall back to canned answers derived from the input.
#[derive(Debug, Default)]
pub struct MockProvider {
    validations: Mutex<VecDeque<Result<String, String>>>,
    adjustments: Mutex<VecDeque<Result<TaskAdjustment, String>>>,
    details: Mutex<Option<RecipeDetails>>,
    searches: Mutex<VecDeque<Vec<RecipeSummary>>>,
    tools: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validation(self, reply: impl Into<String>) -> Self {
        lock(&self.validations).push_back(Ok(reply.into()));
        self
    }

    pub fn with_validation_error(self, reason: impl Into<String>) -> Self {
        lock(&self.validations).push_back(Err(reason.into()));
        self
    }

    pub fn with_adjustment(self, adjustment: TaskAdjustment) -> Self {
        lock(&self.adjustments).push_back(Ok(adjustment));
        self
    }

    pub fn with_adjustment_error(self, reason: impl Into<String>) -> Self {
        lock(&self.adjustments).push_back(Err(reason.into()));
        self
    }

    pub fn with_details(self, details: RecipeDetails) -> Self {
        *lock(&self.details) = Some(details);
        self
    }

    pub fn with_search(self, recipes: Vec<RecipeSummary>) -> Self {
        lock(&self.searches).push_back(recipes);
        self
    }

    pub fn with_tools(self, tools: Vec<String>) -> Self {
        *lock(&self.tools) = tools;
        self
    }

    /// Names of the operations invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: &str) {
        lock(&self.calls).push(call.to_string());
    }
}

#[async_trait]
impl RecipeAi for MockProvider {
    async fn search_recipes(
        &self,
        query: &str,
        _diet: Option<&str>,
        count: usize,
        _language: &str,
    ) -> Result<Vec<RecipeSummary>, ProviderError> {
        self.record("search_recipes");
        if let Some(scripted) = lock(&self.searches).pop_front() {
            return Ok(scripted);
        }
        Ok((1..=count)
            .map(|n| RecipeSummary {
                id: format!("{}-{n}", slugify(query)),
                title: format!("{} #{n}", title_case(query)),
                description: format!("mock recipe for {query}"),
                time: "30 mins".to_string(),
                calories: "450 kcal".to_string(),
                image_prompt: format!("a plate of {query}"),
            })
            .collect())
    }

    async fn get_recipe_details(
        &self,
        id: &str,
        title: &str,
        _language: &str,
    ) -> Result<RecipeDetails, ProviderError> {
        self.record("get_recipe_details");
        if let Some(details) = lock(&self.details).clone() {
            return Ok(details);
        }
        Ok(RecipeDetails {
            id: id.to_string(),
            title: title.to_string(),
            description: format!("mock details for {title}"),
            time: "20 mins".to_string(),
            servings: "2 servings".to_string(),
            difficulty: "Easy".to_string(),
            ingredients: vec![crate::types::Ingredient {
                item: "eggs".to_string(),
                quantity: "2".to_string(),
            }],
            steps: ["Crack the eggs into a bowl", "Heat the pan", "Cook the eggs"]
                .iter()
                .enumerate()
                .map(|(i, s)| SourceStep {
                    step_number: i as u32 + 1,
                    instruction: s.to_string(),
                })
                .collect(),
            image_prompt: format!("a plate of {title}"),
        })
    }

    async fn validate_step(
        &self,
        _image: &CapturedImage,
        _instruction: &str,
    ) -> Result<String, ProviderError> {
        self.record("validate_step");
        match lock(&self.validations).pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(reason)) => Err(ProviderError::Request(reason)),
            None => Ok("Validation Result: PASS\nConfidence Level: High".to_string()),
        }
    }

    async fn identify_tools(&self, _image: &CapturedImage) -> Result<Vec<String>, ProviderError> {
        self.record("identify_tools");
        Ok(lock(&self.tools).clone())
    }

    async fn suggest_adjustments(
        &self,
        _failed_instruction: &str,
        _validation_text: &str,
        _remaining: &[RemainingStep],
    ) -> Result<TaskAdjustment, ProviderError> {
        self.record("suggest_adjustments");
        match lock(&self.adjustments).pop_front() {
            Some(Ok(adjustment)) => Ok(adjustment),
            Some(Err(reason)) => Err(ProviderError::Request(reason)),
            None => Ok(TaskAdjustment::default()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn slugify(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

async fn send_json(request: RequestBuilder) -> Result<Value, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::Request(format!(
            "http status {} from provider",
            status
        )));
    }
    response
        .json()
        .await
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

fn response_text(value: &Value) -> Result<String, ProviderError> {
    let parts = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|first| first.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ProviderError::InvalidResponse(
                "missing candidates[0].content.parts in Gemini response".to_string(),
            )
        })?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        return Err(ProviderError::InvalidResponse(
            "Gemini response contained no text".to_string(),
        ));
    }
    Ok(text)
}

fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.starts_with("```") {
        let mut lines = trimmed.lines();
        let _ = lines.next();
        let mut body: Vec<&str> = lines.collect();
        if matches!(body.last(), Some(last) if last.trim() == "```") {
            body.pop();
        }
        body.join("\n").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn diet_label(diet: &str) -> &str {
    match diet {
        "veg" => "vegetarian",
        "non-veg" => "non-vegetarian",
        other => other,
    }
}

fn search_prompt(query: &str, diet: Option<&str>, count: usize, language: &str) -> String {
    let diet_rule = diet
        .map(|d| format!("All recipes must strictly follow a {} diet.\n", diet_label(d)))
        .unwrap_or_default();
    format!(
        "Suggest {count} diverse recipes for the query \"{query}\".\n{diet_rule}\
         Vary cooking methods, cuisines and difficulty. Respond in language \"{language}\".\n\
         Return a JSON array of objects with id (unique kebab-case), title, description, \
         time (e.g. \"30 mins\"), calories (e.g. \"450 kcal\") and image_prompt."
    )
}

fn details_prompt(title: &str, language: &str) -> String {
    format!(
        "Provide a complete recipe for \"{title}\" in language \"{language}\".\n\
         Return JSON with title, description, time, servings, difficulty (Easy, Medium or Hard), \
         ingredients [{{item, quantity}}], steps [{{step_number, instruction}}] with 5-12 clear \
         steps including temperatures and visual cues, and image_prompt."
    )
}

fn validation_prompt(instruction: &str) -> String {
    format!(
        "You are a culinary instructor checking a photo of a cooking step.\n\
         Task: \"{instruction}\"\n\
         Decide whether the image shows this task completed correctly.\n\
         Answer in this format:\n\
         Validation Result: PASS, FAIL or UNCERTAIN\n\
         Confidence Level: High, Medium or Low\n\
         Reasoning: short explanation\n\
         Suggestions: concrete corrective actions when the result is FAIL"
    )
}

fn tools_prompt() -> String {
    let ids: Vec<&str> = KNOWN_TOOLS.iter().map(|t| t.id).collect();
    format!(
        "Identify the kitchen tools visible in the image. Return a JSON array containing only \
         ids from this list: {}",
        ids.join(", ")
    )
}

fn adjustment_prompt(
    failed_instruction: &str,
    validation_text: &str,
    remaining: &[RemainingStep],
) -> String {
    let remaining = serde_json::to_string(remaining).unwrap_or_else(|_| "[]".to_string());
    format!(
        "A cook failed this step: \"{failed_instruction}\".\n\
         Validation feedback: {validation_text}\n\
         Remaining steps: {remaining}\n\
         Decide whether the remaining plan needs changes. Return JSON: \
         {{\"needs_adjustment\": bool, \"message\": string, \
         \"corrective_steps\": [{{\"step_number\": \"4a\", \"instruction\": string, \"type\": \"corrective\"}}], \
         \"modified_steps\": [{{\"step_number\": number, \"original_instruction\": string, \
         \"new_instruction\": string, \"reason\": string}}]}}"
    )
}

fn summary_schema() -> Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "id": { "type": "STRING" },
                "title": { "type": "STRING" },
                "description": { "type": "STRING" },
                "time": { "type": "STRING" },
                "calories": { "type": "STRING" },
                "image_prompt": { "type": "STRING" }
            },
            "required": ["id", "title", "description", "time", "calories", "image_prompt"]
        }
    })
}

fn details_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "title": { "type": "STRING" },
            "description": { "type": "STRING" },
            "time": { "type": "STRING" },
            "servings": { "type": "STRING" },
            "difficulty": { "type": "STRING" },
            "ingredients": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "item": { "type": "STRING" },
                        "quantity": { "type": "STRING" }
                    },
                    "required": ["item", "quantity"]
                }
            },
            "steps": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "step_number": { "type": "NUMBER" },
                        "instruction": { "type": "STRING" }
                    },
                    "required": ["step_number", "instruction"]
                }
            },
            "image_prompt": { "type": "STRING" }
        },
        "required": ["title", "description", "time", "servings", "difficulty", "ingredients", "steps", "image_prompt"]
    })
}
