//! Guided cooking session controller.
//!
//! A [`CookingSession`] owns the working step list of one recipe attempt. Steps
//! unlock strictly in list order: a step can be toggled or validated only when
//! the step before it is completed. Failed photo validations may splice
//! corrective steps into the list or rewrite later steps in place.
//!
//! Persistence is best-effort throughout. The session keeps working when the
//! store is unreachable; it simply stops logging once no session id exists.

use crate::camera::{Camera, CameraError, CameraGuard, CapturedImage};
use crate::persistence::{
    InteractionKind, InteractionRecord, NewSession, RecipeStore, SessionUpdate, StepTimeRecord,
    ValidationRecord,
};
use crate::providers::{ProviderError, RecipeAi};
use crate::types::{
    Confidence, RecipeDetails, RecipeStep, RemainingStep, StepId, StepKind, StepStatus,
    ValidationStatus,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// How long an adjustment notice stays visible unless replaced or dismissed.
pub const ADJUSTMENT_NOTICE_TTL: Duration = Duration::from_secs(10);

const INTERACTION_SOURCE: &str = "cooking_page";

static CONFIDENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Confidence.*?:\s*(High|Medium|Low)").expect("valid regex")
});

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown step {0}")]
    UnknownStep(StepId),
    #[error("step {label} is locked until the previous step is completed")]
    Locked { label: String },
    #[error("step {label} is already completed and validated")]
    AlreadyValidated { label: String },
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("step validation failed: {0}")]
    Validation(#[source] ProviderError),
}

/// Classified reading of a free-text validation reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub passed: bool,
    pub status: ValidationStatus,
    pub confidence: Confidence,
}

/// Classifies an AI validation reply by substring matching.
///
/// A reply mentioning both words counts as passed and as failed at once.
///
/// ```
/// use chefquest_core::session::classify_validation;
/// use chefquest_core::types::{Confidence, ValidationStatus};
///
/// let v = classify_validation("FAIL: pan not heated, Confidence: High");
/// assert!(!v.passed);
/// assert_eq!(v.status, ValidationStatus::Fail);
/// assert_eq!(v.confidence, Confidence::High);
///
/// let v = classify_validation("looks like onions");
/// assert_eq!(v.status, ValidationStatus::Uncertain);
/// assert_eq!(v.confidence, Confidence::Medium);
/// ```
pub fn classify_validation(text: &str) -> Verdict {
    let lower = text.to_lowercase();
    let passed = lower.contains("pass");
    let status = if lower.contains("fail") {
        ValidationStatus::Fail
    } else if passed {
        ValidationStatus::Pass
    } else {
        ValidationStatus::Uncertain
    };
    let confidence = CONFIDENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| Confidence::parse(m.as_str()))
        .unwrap_or(Confidence::Medium);
    Verdict {
        passed,
        status,
        confidence,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdjustmentSummary {
    pub needs_adjustment: bool,
    pub message: String,
    pub corrective_added: usize,
    pub modified: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub step: StepId,
    pub label: String,
    pub verdict: Verdict,
    pub text: String,
    pub adjustment: Option<AdjustmentSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
struct Notice {
    message: String,
    expires_at: Instant,
}

pub struct CookingSession<A, S>
where
    A: RecipeAi,
    S: RecipeStore,
{
    recipe_id: String,
    ai: A,
    store: S,
    steps: Vec<RecipeStep>,
    statuses: HashMap<StepId, StepStatus>,
    next_id: u64,
    session_id: Option<String>,
    validating: Option<StepId>,
    notice: Option<Notice>,
    notice_ttl: Duration,
    completion_reported: bool,
    unlocked_at: HashMap<StepId, DateTime<Utc>>,
    retried: HashSet<StepId>,
}

impl<A, S> CookingSession<A, S>
where
    A: RecipeAi,
    S: RecipeStore,
{
    /// Builds the working list from the recipe without touching the store.
    pub fn new(recipe: &RecipeDetails, ai: A, store: S) -> Self {
        let mut session = Self {
            recipe_id: recipe.id.clone(),
            ai,
            store,
            steps: Vec::with_capacity(recipe.steps.len()),
            statuses: HashMap::new(),
            next_id: 0,
            session_id: None,
            validating: None,
            notice: None,
            notice_ttl: ADJUSTMENT_NOTICE_TTL,
            completion_reported: false,
            unlocked_at: HashMap::new(),
            retried: HashSet::new(),
        };
        for source in &recipe.steps {
            let id = session.next_step_id();
            session.steps.push(RecipeStep {
                id,
                label: source.step_number.to_string(),
                instruction: source.instruction.clone(),
                kind: StepKind::Original,
                original_instruction: None,
                modification_reason: None,
            });
            session.statuses.insert(id, StepStatus::default());
        }
        session.mark_unlocked();
        session
    }

    /// Creates the session and registers it with the store.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chefquest_core::persistence::MemoryStore;
    /// use chefquest_core::providers::{MockProvider, RecipeAi};
    /// use chefquest_core::session::CookingSession;
    ///
    /// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
    /// let ai = MockProvider::new();
    /// let recipe = ai.get_recipe_details("omelet", "Omelet", "en").await?;
    /// let mut session = CookingSession::start(&recipe, ai, MemoryStore::new()).await;
    /// let first = session.steps()[0].id;
    /// session.toggle_completion(first).await?;
    /// assert_eq!(session.progress().completed, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(recipe: &RecipeDetails, ai: A, store: S) -> Self {
        let mut session = Self::new(recipe, ai, store);
        session.begin().await;
        session
    }

    /// Requests a persisted session record. Failure leaves the session id unset.
    pub async fn begin(&mut self) {
        if self.session_id.is_some() {
            return;
        }
        let request = NewSession {
            recipe_id: self.recipe_id.clone(),
            steps: self.steps.clone(),
        };
        match self.store.create_session(request).await {
            Ok(record) => {
                tracing::info!(session = %record.id, recipe = %self.recipe_id, "cooking session started");
                self.session_id = Some(record.id);
                let interaction = InteractionRecord::new(
                    &self.recipe_id,
                    InteractionKind::CookStarted,
                    INTERACTION_SOURCE,
                );
                if let Err(e) = self.store.log_interaction(interaction).await {
                    tracing::warn!(error = %e, "failed to log cook_started interaction");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, recipe = %self.recipe_id, "failed to create cooking session; continuing without one");
            }
        }
    }

    pub fn with_notice_ttl(mut self, ttl: Duration) -> Self {
        self.notice_ttl = ttl;
        self
    }

    pub fn recipe_id(&self) -> &str {
        &self.recipe_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn steps(&self) -> &[RecipeStep] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&RecipeStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn status(&self, id: StepId) -> Option<&StepStatus> {
        self.statuses.get(&id)
    }

    /// The step currently awaiting an AI verdict, if any.
    pub fn validating(&self) -> Option<StepId> {
        self.validating
    }

    /// Derived from the previous step on every call; never stored.
    pub fn is_unlocked(&self, index: usize) -> bool {
        match index {
            0 => !self.steps.is_empty(),
            i if i < self.steps.len() => self.is_completed(self.steps[i - 1].id),
            _ => false,
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.statuses.values().filter(|s| s.completed).count(),
            total: self.steps.len(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.values().all(|s| s.completed)
    }

    pub fn active_notice(&self) -> Option<&str> {
        self.notice
            .as_ref()
            .filter(|n| Instant::now() < n.expires_at)
            .map(|n| n.message.as_str())
    }

    pub fn dismiss_notice(&mut self) {
        self.notice = None;
    }

    /// Flips a step's completion; returns the new value.
    pub async fn toggle_completion(&mut self, id: StepId) -> Result<bool, SessionError> {
        let index = self.index_of(id)?;
        self.ensure_unlocked(index)?;

        let status = self.statuses.entry(id).or_default();
        status.completed = !status.completed;
        let completed = status.completed;
        tracing::debug!(step = %self.steps[index].label, completed, "step toggled");

        if completed {
            self.log_step_time(index).await;
        }
        self.mark_unlocked();
        self.check_completion().await;
        Ok(completed)
    }

    /// Opens the camera, takes one frame and validates it. The camera is
    /// released before the AI is contacted.
    pub async fn capture_and_validate<C>(
        &mut self,
        id: StepId,
        camera: &C,
    ) -> Result<ValidationOutcome, SessionError>
    where
        C: Camera + ?Sized,
    {
        let index = self.index_of(id)?;
        self.ensure_validatable(index)?;

        let image = {
            let mut guard = CameraGuard::acquire(camera).await?;
            let frame = guard.capture().await;
            guard.release();
            frame?
        };
        self.validate_capture(id, &image).await
    }

    pub async fn validate_capture(
        &mut self,
        id: StepId,
        image: &CapturedImage,
    ) -> Result<ValidationOutcome, SessionError> {
        let index = self.index_of(id)?;
        self.ensure_validatable(index)?;
        let step = self.steps[index].clone();

        self.validating = Some(id);
        let prompt = format!("Step {}: {}", step.label, step.instruction);
        let reply = self.ai.validate_step(image, &prompt).await;
        self.validating = None;
        let text = reply.map_err(SessionError::Validation)?;

        let verdict = classify_validation(&text);
        tracing::info!(
            step = %step.label,
            status = verdict.status.as_str(),
            confidence = verdict.confidence.as_str(),
            "step validated"
        );
        let status = self.statuses.entry(id).or_default();
        let newly_completed = verdict.passed && !status.completed;
        status.completed = verdict.passed;
        status.validated = true;
        status.validation_result = Some(text.clone());

        if verdict.status == ValidationStatus::Fail {
            self.retried.insert(id);
        }
        if newly_completed {
            self.log_step_time(index).await;
        }

        let adjustment = if verdict.status == ValidationStatus::Fail {
            self.adjust_remaining_steps(id, &text).await
        } else {
            None
        };
        let corrective_added = adjustment.as_ref().map_or(0, |a| a.corrective_added);
        self.log_validation(&step, &text, verdict, corrective_added)
            .await;

        self.mark_unlocked();
        self.check_completion().await;
        Ok(ValidationOutcome {
            step: id,
            label: step.label,
            verdict,
            text,
            adjustment,
        })
    }

    /// Asks the AI how the rest of the recipe should change after `id` failed.
    ///
    /// Returns `None` when the step is unknown or the AI call fails; both are
    /// silent for the cook.
    pub async fn adjust_remaining_steps(
        &mut self,
        id: StepId,
        validation_text: &str,
    ) -> Option<AdjustmentSummary> {
        let index = self.steps.iter().position(|s| s.id == id)?;
        let failed = self.steps[index].instruction.clone();
        let remaining: Vec<RemainingStep> = self.steps[index + 1..]
            .iter()
            .map(|s| RemainingStep {
                step_number: s.number(),
                instruction: s.instruction.clone(),
            })
            .collect();

        let adjustment = match self
            .ai
            .suggest_adjustments(&failed, validation_text, &remaining)
            .await
        {
            Ok(adjustment) => adjustment,
            Err(e) => {
                tracing::debug!(error = %e, "adjustment request failed; keeping steps");
                return None;
            }
        };

        if !adjustment.needs_adjustment {
            self.set_notice(adjustment.message.clone());
            return Some(AdjustmentSummary {
                needs_adjustment: false,
                message: adjustment.message,
                corrective_added: 0,
                modified: 0,
            });
        }

        let mut modified = 0;
        for change in &adjustment.modified_steps {
            for step in self
                .steps
                .iter_mut()
                .filter(|s| s.label == change.step_number)
            {
                if step.original_instruction.is_none() {
                    step.original_instruction = Some(step.instruction.clone());
                }
                step.instruction = change.new_instruction.clone();
                step.modification_reason = Some(change.reason.clone());
                step.kind = StepKind::Modified;
                modified += 1;
            }
        }

        let mut inserted = Vec::with_capacity(adjustment.corrective_steps.len());
        for corrective in &adjustment.corrective_steps {
            let step_id = self.next_step_id();
            self.statuses.insert(step_id, StepStatus::default());
            inserted.push(RecipeStep {
                id: step_id,
                label: corrective.step_number.clone(),
                instruction: corrective.instruction.clone(),
                kind: StepKind::Corrective,
                original_instruction: None,
                modification_reason: None,
            });
        }
        let corrective_added = inserted.len();
        self.steps.splice(index + 1..index + 1, inserted);
        tracing::info!(corrective_added, modified, "steps adjusted");

        self.set_notice(adjustment.message.clone());
        self.mark_unlocked();
        self.sync_steps().await;
        Some(AdjustmentSummary {
            needs_adjustment: true,
            message: adjustment.message,
            corrective_added,
            modified,
        })
    }

    /// Marks an unfinished session as abandoned.
    pub async fn abandon(&mut self) {
        if self.is_complete() {
            return;
        }
        let Some(session_id) = self.session_id.clone() else {
            return;
        };
        if let Err(e) = self
            .store
            .update_session(&session_id, SessionUpdate::abandoned())
            .await
        {
            tracing::warn!(error = %e, "failed to mark session abandoned");
            return;
        }
        tracing::info!(session = %session_id, "cooking session abandoned");
        let interaction =
            InteractionRecord::new(&self.recipe_id, InteractionKind::Abandoned, INTERACTION_SOURCE);
        if let Err(e) = self.store.log_interaction(interaction).await {
            tracing::warn!(error = %e, "failed to log abandoned interaction");
        }
    }

    fn next_step_id(&mut self) -> StepId {
        self.next_id += 1;
        StepId(self.next_id)
    }

    fn index_of(&self, id: StepId) -> Result<usize, SessionError> {
        self.steps
            .iter()
            .position(|s| s.id == id)
            .ok_or(SessionError::UnknownStep(id))
    }

    fn is_completed(&self, id: StepId) -> bool {
        self.statuses.get(&id).is_some_and(|s| s.completed)
    }

    fn ensure_unlocked(&self, index: usize) -> Result<(), SessionError> {
        if self.is_unlocked(index) {
            Ok(())
        } else {
            Err(SessionError::Locked {
                label: self.steps[index].label.clone(),
            })
        }
    }

    fn ensure_validatable(&self, index: usize) -> Result<(), SessionError> {
        self.ensure_unlocked(index)?;
        let step = &self.steps[index];
        match self.statuses.get(&step.id) {
            Some(s) if s.completed && s.validated => Err(SessionError::AlreadyValidated {
                label: step.label.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn set_notice(&mut self, message: String) {
        self.notice = Some(Notice {
            message,
            expires_at: Instant::now() + self.notice_ttl,
        });
    }

    fn mark_unlocked(&mut self) {
        let now = Utc::now();
        for index in 0..self.steps.len() {
            if self.is_unlocked(index) {
                self.unlocked_at.entry(self.steps[index].id).or_insert(now);
            }
        }
    }

    async fn check_completion(&mut self) {
        if self.completion_reported || !self.is_complete() {
            return;
        }
        self.completion_reported = true;
        let total = self.steps.len() as u32;
        tracing::info!(recipe = %self.recipe_id, steps = total, "cooking session complete");
        let Some(session_id) = self.session_id.as_deref() else {
            return;
        };
        if let Err(e) = self
            .store
            .update_session(session_id, SessionUpdate::completed(Utc::now(), total))
            .await
        {
            tracing::warn!(error = %e, "failed to record session completion");
        }
    }

    async fn log_step_time(&self, index: usize) {
        let Some(session_id) = self.session_id.as_deref() else {
            return;
        };
        let step = &self.steps[index];
        let record = StepTimeRecord {
            session_id: session_id.to_string(),
            recipe_id: self.recipe_id.clone(),
            step_label: step.label.clone(),
            instruction: step.instruction.clone(),
            started_at: self.unlocked_at.get(&step.id).copied(),
            completed_at: Utc::now(),
            needed_retry: self.retried.contains(&step.id),
        };
        if let Err(e) = self.store.log_step_time(record).await {
            tracing::warn!(error = %e, step = %step.label, "failed to log step time");
        }
    }

    async fn log_validation(
        &self,
        step: &RecipeStep,
        text: &str,
        verdict: Verdict,
        corrective_added: usize,
    ) {
        let Some(session_id) = self.session_id.as_deref() else {
            return;
        };
        let record = ValidationRecord {
            session_id: session_id.to_string(),
            recipe_id: self.recipe_id.clone(),
            step_label: step.label.clone(),
            instruction: step.instruction.clone(),
            result_text: text.to_string(),
            status: verdict.status,
            confidence: verdict.confidence,
            corrective_steps_added: corrective_added as u32,
        };
        if let Err(e) = self.store.log_validation(record).await {
            tracing::warn!(error = %e, step = %step.label, "failed to log validation");
        }
    }

    async fn sync_steps(&self) {
        let Some(session_id) = self.session_id.as_deref() else {
            return;
        };
        let update = SessionUpdate {
            total_steps: Some(self.steps.len() as u32),
            steps_modified: Some(self.steps.iter().filter(|s| s.is_modified()).count() as u32),
            steps: Some(self.steps.clone()),
            ..SessionUpdate::default()
        };
        if let Err(e) = self.store.update_session(session_id, update).await {
            tracing::warn!(error = %e, "failed to sync adjusted steps");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::ScriptedCamera;
    use crate::persistence::{
        Collection, CollectionItem, MemoryStore, NewCollection, SearchLog, SessionRecord,
        SessionStatus, StoreError, UserStats,
    };
    use crate::providers::MockProvider;
    use crate::types::{CorrectiveStep, ModifiedStep, RecipeSummary, SourceStep, TaskAdjustment};
    use std::sync::Arc;

    type TestSession = CookingSession<MockProvider, Arc<MemoryStore>>;

    fn recipe(count: u32) -> RecipeDetails {
        RecipeDetails {
            id: "pan-seared-tofu".to_string(),
            title: "Pan Seared Tofu".to_string(),
            description: String::new(),
            time: "25 mins".to_string(),
            servings: "2 servings".to_string(),
            difficulty: "Easy".to_string(),
            ingredients: vec![],
            steps: (1..=count)
                .map(|n| SourceStep {
                    step_number: n,
                    instruction: format!("instruction {n}"),
                })
                .collect(),
            image_prompt: String::new(),
        }
    }

    async fn session_with(ai: MockProvider, count: u32) -> (TestSession, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let session = CookingSession::start(&recipe(count), ai, store.clone()).await;
        (session, store)
    }

    fn image() -> CapturedImage {
        CapturedImage::new("image/jpeg", vec![0xff, 0xd8])
    }

    fn ids<S: RecipeStore>(session: &CookingSession<MockProvider, S>) -> Vec<StepId> {
        session.steps().iter().map(|s| s.id).collect()
    }

    fn one_corrective(label: &str, text: &str) -> TaskAdjustment {
        TaskAdjustment {
            needs_adjustment: true,
            message: "Heat the pan before adding tofu".to_string(),
            corrective_steps: vec![CorrectiveStep {
                step_number: label.to_string(),
                instruction: text.to_string(),
            }],
            modified_steps: vec![],
        }
    }

    #[tokio::test]
    async fn start_builds_original_steps_and_registers_session() {
        let (session, store) = session_with(MockProvider::new(), 3).await;
        let labels: Vec<&str> = session.steps().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["1", "2", "3"]);
        assert!(session.steps().iter().all(|s| s.kind == StepKind::Original));
        assert!(session
            .steps()
            .iter()
            .all(|s| session.status(s.id) == Some(&StepStatus::default())));

        let sessions = store.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(session.session_id(), Some(sessions[0].id.as_str()));
        assert_eq!(sessions[0].original_steps_count, 3);
        let interactions = store.interactions().await;
        assert_eq!(interactions[0].kind, InteractionKind::CookStarted);
    }

    #[tokio::test]
    async fn later_steps_are_locked_until_previous_completes() {
        let (mut session, _store) = session_with(MockProvider::new(), 3).await;
        let ids = ids(&session);
        assert!(session.is_unlocked(0));
        assert!(!session.is_unlocked(1));
        assert!(!session.is_unlocked(5));

        let err = session.toggle_completion(ids[1]).await.unwrap_err();
        assert!(matches!(err, SessionError::Locked { ref label } if label == "2"));
        assert!(!session.status(ids[1]).expect("status").completed);

        let err = session.validate_capture(ids[2], &image()).await.unwrap_err();
        assert!(matches!(err, SessionError::Locked { .. }));

        session.toggle_completion(ids[0]).await.expect("toggle");
        assert!(session.is_unlocked(1));
        assert!(!session.is_unlocked(2));
    }

    #[tokio::test]
    async fn toggling_twice_restores_completion() {
        let (mut session, _store) = session_with(MockProvider::new(), 2).await;
        let first = ids(&session)[0];
        assert!(session.toggle_completion(first).await.expect("on"));
        assert!(!session.toggle_completion(first).await.expect("off"));
        assert!(!session.status(first).expect("status").completed);
    }

    #[tokio::test]
    async fn unknown_step_is_rejected() {
        let (mut session, _store) = session_with(MockProvider::new(), 1).await;
        let err = session.toggle_completion(StepId(999)).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownStep(StepId(999))));
    }

    #[tokio::test]
    async fn failed_validation_inserts_corrective_step_after_failed_step() {
        let ai = MockProvider::new()
            .with_validation("FAIL: pan not heated, Confidence: High")
            .with_adjustment(one_corrective("4a", "Heat the pan for two minutes"));
        let (mut session, store) = session_with(ai, 5).await;
        let before = ids(&session);
        for id in &before[..3] {
            session.toggle_completion(*id).await.expect("toggle");
        }

        let outcome = session
            .validate_capture(before[3], &image())
            .await
            .expect("validate");
        assert_eq!(outcome.verdict.status, ValidationStatus::Fail);
        assert_eq!(outcome.verdict.confidence, Confidence::High);
        let status = session.status(before[3]).expect("status");
        assert!(!status.completed);
        assert!(status.validated);

        let steps = session.steps();
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[4].kind, StepKind::Corrective);
        assert_eq!(steps[4].label, "4a");
        assert_eq!(
            ids(&session)
                .into_iter()
                .filter(|id| before.contains(id))
                .collect::<Vec<_>>(),
            before
        );
        assert!(!session.is_unlocked(4));
        assert_eq!(
            session.active_notice(),
            Some("Heat the pan before adding tofu")
        );

        let validations = store.validations().await;
        assert_eq!(validations.len(), 1);
        assert_eq!(validations[0].status, ValidationStatus::Fail);
        assert_eq!(validations[0].corrective_steps_added, 1);
        let record = &store.sessions().await[0];
        assert_eq!(record.total_steps, 6);
        assert_eq!(record.ai_validations_failed, 1);
    }

    #[tokio::test]
    async fn correctives_keep_given_order_at_same_position() {
        let ai = MockProvider::new()
            .with_validation("fail")
            .with_adjustment(TaskAdjustment {
                needs_adjustment: true,
                message: "fix it".to_string(),
                corrective_steps: vec![
                    CorrectiveStep {
                        step_number: "1a".to_string(),
                        instruction: "first fix".to_string(),
                    },
                    CorrectiveStep {
                        step_number: "1b".to_string(),
                        instruction: "second fix".to_string(),
                    },
                ],
                modified_steps: vec![],
            });
        let (mut session, _store) = session_with(ai, 2).await;
        let first = ids(&session)[0];
        let outcome = session.validate_capture(first, &image()).await.expect("validate");
        assert_eq!(outcome.adjustment.map(|a| a.corrective_added), Some(2));
        let labels: Vec<&str> = session.steps().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["1", "1a", "1b", "2"]);
        let unique: HashSet<StepId> = ids(&session).into_iter().collect();
        assert_eq!(unique.len(), 4);
    }

    #[tokio::test]
    async fn passing_validation_completes_step() {
        let ai = MockProvider::new().with_validation("Validation Result: PASS\nConfidence Level: low");
        let (mut session, store) = session_with(ai, 2).await;
        let first = ids(&session)[0];
        let outcome = session.validate_capture(first, &image()).await.expect("validate");
        assert!(outcome.verdict.passed);
        assert_eq!(outcome.verdict.confidence, Confidence::Low);
        assert!(outcome.adjustment.is_none());
        let status = session.status(first).expect("status");
        assert!(status.completed && status.validated);
        assert!(session.is_unlocked(1));

        let err = session.validate_capture(first, &image()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyValidated { .. }));
        assert_eq!(store.step_times().await.len(), 1);
    }

    #[tokio::test]
    async fn validation_error_leaves_status_untouched() {
        let ai = MockProvider::new().with_validation_error("timeout");
        let (mut session, store) = session_with(ai, 2).await;
        let first = ids(&session)[0];
        let err = session.validate_capture(first, &image()).await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(session.status(first), Some(&StepStatus::default()));
        assert_eq!(session.validating(), None);
        assert!(store.validations().await.is_empty());
    }

    #[tokio::test]
    async fn adjustment_error_is_silent() {
        let ai = MockProvider::new()
            .with_validation("FAIL")
            .with_adjustment_error("quota");
        let (mut session, _store) = session_with(ai, 3).await;
        let first = ids(&session)[0];
        let outcome = session.validate_capture(first, &image()).await.expect("validate");
        assert!(outcome.adjustment.is_none());
        assert_eq!(session.steps().len(), 3);
        assert_eq!(session.active_notice(), None);
    }

    #[tokio::test]
    async fn no_adjustment_still_shows_message() {
        let ai = MockProvider::new().with_validation("fail").with_adjustment(TaskAdjustment {
            needs_adjustment: false,
            message: "Try again with better light".to_string(),
            ..TaskAdjustment::default()
        });
        let (mut session, _store) = session_with(ai, 2).await;
        let first = ids(&session)[0];
        session.validate_capture(first, &image()).await.expect("validate");
        assert_eq!(session.steps().len(), 2);
        assert_eq!(session.active_notice(), Some("Try again with better light"));
    }

    #[tokio::test]
    async fn modified_steps_keep_original_text() {
        let ai = MockProvider::new().with_validation("fail").with_adjustment(TaskAdjustment {
            needs_adjustment: true,
            message: "Lower the heat".to_string(),
            corrective_steps: vec![],
            modified_steps: vec![ModifiedStep {
                step_number: "3".to_string(),
                original_instruction: "instruction 3".to_string(),
                new_instruction: "Cook on low heat".to_string(),
                reason: "pan is too hot".to_string(),
            }],
        });
        let (mut session, store) = session_with(ai, 3).await;
        let first = ids(&session)[0];
        let outcome = session.validate_capture(first, &image()).await.expect("validate");
        assert_eq!(outcome.adjustment.map(|a| a.modified), Some(1));

        let third = &session.steps()[2];
        assert!(third.is_modified());
        assert_eq!(third.instruction, "Cook on low heat");
        assert_eq!(third.original_instruction.as_deref(), Some("instruction 3"));
        assert_eq!(third.modification_reason.as_deref(), Some("pan is too hot"));
        assert_eq!(store.sessions().await[0].steps_modified, 1);
    }

    #[tokio::test]
    async fn corrective_labels_keep_their_leading_number() {
        let ai = MockProvider::new()
            .with_validation("fail")
            .with_adjustment(one_corrective("1a", "fix"))
            .with_validation("fail")
            .with_adjustment_error("none");
        let (mut session, _store) = session_with(ai, 2).await;
        let first = ids(&session)[0];
        session.validate_capture(first, &image()).await.expect("validate");
        session.validate_capture(first, &image()).await.expect("validate");
        let remaining: Vec<u32> = session.steps()[1..].iter().map(|s| s.number()).collect();
        assert_eq!(remaining, vec![1, 2]);
    }

    #[tokio::test]
    async fn denied_camera_mutates_nothing() {
        let (mut session, store) = session_with(MockProvider::new(), 2).await;
        let first = ids(&session)[0];
        let camera = ScriptedCamera::denied();
        let err = session
            .capture_and_validate(first, &camera)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Camera(CameraError::PermissionDenied)));
        assert_eq!(session.status(first), Some(&StepStatus::default()));
        assert_eq!(camera.opens(), 0);
        assert_eq!(camera.releases(), 0);
        assert!(store.validations().await.is_empty());
    }

    #[tokio::test]
    async fn camera_is_released_once_on_success_and_capture_error() {
        let (mut session, _store) = session_with(MockProvider::new(), 2).await;
        let first = ids(&session)[0];

        let broken = ScriptedCamera {
            fail_capture: true,
            ..ScriptedCamera::default()
        };
        let err = session
            .capture_and_validate(first, &broken)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Camera(CameraError::Capture(_))));
        assert_eq!(broken.releases(), 1);
        assert_eq!(session.status(first), Some(&StepStatus::default()));

        let camera = ScriptedCamera::default();
        let outcome = session
            .capture_and_validate(first, &camera)
            .await
            .expect("validate");
        assert!(outcome.verdict.passed);
        assert_eq!(camera.opens(), 1);
        assert_eq!(camera.releases(), 1);
    }

    /// Store that refuses every call and remembers which ones were made.
    #[derive(Default)]
    struct RefusingStore {
        calls: std::sync::Mutex<Vec<&'static str>>,
    }

    impl RefusingStore {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().expect("calls").clone()
        }

        fn refuse<T>(&self, call: &'static str) -> Result<T, StoreError> {
            self.calls.lock().expect("calls").push(call);
            Err(StoreError::Request("offline".to_string()))
        }
    }

    #[async_trait::async_trait]
    impl RecipeStore for RefusingStore {
        async fn create_session(&self, _: NewSession) -> Result<SessionRecord, StoreError> {
            self.refuse("create_session")
        }
        async fn update_session(&self, _: &str, _: SessionUpdate) -> Result<SessionRecord, StoreError> {
            self.refuse("update_session")
        }
        async fn log_step_time(&self, _: StepTimeRecord) -> Result<(), StoreError> {
            self.refuse("log_step_time")
        }
        async fn log_validation(&self, _: ValidationRecord) -> Result<(), StoreError> {
            self.refuse("log_validation")
        }
        async fn log_interaction(&self, _: InteractionRecord) -> Result<(), StoreError> {
            self.refuse("log_interaction")
        }
        async fn find_recipes(&self, _: &str, _: &str, _: usize) -> Result<Vec<RecipeSummary>, StoreError> {
            self.refuse("find_recipes")
        }
        async fn get_recipe(&self, _: &str) -> Result<Option<RecipeDetails>, StoreError> {
            self.refuse("get_recipe")
        }
        async fn upsert_summary(&self, _: &RecipeSummary, _: &str) -> Result<(), StoreError> {
            self.refuse("upsert_summary")
        }
        async fn upsert_details(&self, _: &RecipeDetails) -> Result<(), StoreError> {
            self.refuse("upsert_details")
        }
        async fn log_search(&self, _: SearchLog) -> Result<(), StoreError> {
            self.refuse("log_search")
        }
        async fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
            self.refuse("list_collections")
        }
        async fn create_collection(&self, _: NewCollection) -> Result<Collection, StoreError> {
            self.refuse("create_collection")
        }
        async fn delete_collection(&self, _: &str) -> Result<(), StoreError> {
            self.refuse("delete_collection")
        }
        async fn add_to_collection(
            &self,
            _: &str,
            _: &str,
            _: Option<String>,
        ) -> Result<CollectionItem, StoreError> {
            self.refuse("add_to_collection")
        }
        async fn remove_from_collection(&self, _: &str, _: &str) -> Result<(), StoreError> {
            self.refuse("remove_from_collection")
        }
        async fn user_stats(&self, _: usize) -> Result<UserStats, StoreError> {
            self.refuse("user_stats")
        }
    }

    #[tokio::test]
    async fn missing_session_id_skips_logging() {
        let store = Arc::new(RefusingStore::default());
        let ai = MockProvider::new().with_validation("FAIL").with_adjustment(one_corrective("1a", "fix"));
        let mut session = CookingSession::start(&recipe(2), ai, store.clone()).await;
        assert_eq!(session.session_id(), None);
        assert_eq!(store.calls(), vec!["create_session"]);

        let first = ids(&session)[0];
        let outcome = session.validate_capture(first, &image()).await.expect("validate");
        assert_eq!(outcome.adjustment.map(|a| a.corrective_added), Some(1));
        session.abandon().await;
        for id in ids(&session) {
            session.toggle_completion(id).await.expect("toggle");
        }
        assert!(session.is_complete());
        assert_eq!(store.calls(), vec!["create_session"]);
    }

    #[tokio::test]
    async fn completion_is_reported_once() {
        let (mut session, store) = session_with(MockProvider::new(), 2).await;
        let ids = ids(&session);
        for id in &ids {
            session.toggle_completion(*id).await.expect("toggle");
        }
        assert!(session.is_complete());
        let record = &store.sessions().await[0];
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.current_step, 2);

        session.toggle_completion(ids[1]).await.expect("off");
        assert!(!session.is_complete());
        session.toggle_completion(ids[1]).await.expect("on");
        assert!(session.is_complete());

        let completed = store
            .interactions()
            .await
            .into_iter()
            .filter(|i| i.kind == InteractionKind::Completed)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn empty_recipe_never_completes() {
        let (session, _store) = session_with(MockProvider::new(), 0).await;
        assert!(!session.is_complete());
        assert!(!session.is_unlocked(0));
        assert_eq!(session.progress(), Progress { completed: 0, total: 0 });
    }

    #[tokio::test]
    async fn step_times_flag_retried_steps() {
        let ai = MockProvider::new()
            .with_validation("FAIL: too pale")
            .with_adjustment_error("skip")
            .with_validation("PASS");
        let (mut session, store) = session_with(ai, 2).await;
        let ids = ids(&session);
        session.validate_capture(ids[0], &image()).await.expect("fail");
        session.validate_capture(ids[0], &image()).await.expect("pass");
        session.toggle_completion(ids[1]).await.expect("toggle");

        let times = store.step_times().await;
        assert_eq!(times.len(), 2);
        assert!(times[0].needed_retry);
        assert!(times[0].started_at.is_some());
        assert!(!times[1].needed_retry);
    }

    #[tokio::test]
    async fn abandon_marks_unfinished_session() {
        let (mut session, store) = session_with(MockProvider::new(), 2).await;
        session.abandon().await;
        assert_eq!(store.sessions().await[0].status, SessionStatus::Abandoned);
        assert!(store
            .interactions()
            .await
            .iter()
            .any(|i| i.kind == InteractionKind::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn notice_expires_and_can_be_dismissed() {
        let ai = MockProvider::new()
            .with_validation("fail")
            .with_adjustment(one_corrective("1a", "fix"))
            .with_validation("fail")
            .with_adjustment(one_corrective("1b", "fix again"));
        let (mut session, _store) = session_with(ai, 2).await;
        let first = ids(&session)[0];

        session.validate_capture(first, &image()).await.expect("validate");
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(session.active_notice().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(session.active_notice(), None);

        session.validate_capture(first, &image()).await.expect("validate");
        assert!(session.active_notice().is_some());
        session.dismiss_notice();
        assert_eq!(session.active_notice(), None);
    }

    #[test]
    fn both_words_count_as_passed_and_failed() {
        let v = classify_validation("Did not fail, it will pass");
        assert!(v.passed);
        assert_eq!(v.status, ValidationStatus::Fail);
    }

    #[test]
    fn confidence_defaults_to_medium() {
        assert_eq!(classify_validation("PASS").confidence, Confidence::Medium);
        assert_eq!(
            classify_validation("confidence level - : high").confidence,
            Confidence::High
        );
    }
}
