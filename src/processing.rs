//! Processing orchestrator: screenshots -> extraction -> solution -> debug

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::db::store_history_entry;
use crate::dispatch::{extract_json_object, query_model, query_model_stream};
use crate::models::{AiModelConfig, AppEvent, ProblemInfo, SolutionResult};
use crate::prompts::{DEFAULT_DEBUG_PROMPT, DEFAULT_EXTRACTION_PROMPT, DEFAULT_SOLUTION_PROMPT};
use crate::screenshot::{load_payload_base64, ScreenshotQueue};

// Event names mirrored by every front-end subscriber
pub const EVT_INITIAL_START: &str = "initial-start";
pub const EVT_NO_SCREENSHOTS: &str = "no-screenshots";
pub const EVT_PROBLEM_EXTRACTED: &str = "problem-extracted";
pub const EVT_SOLUTION_SUCCESS: &str = "solution-success";
pub const EVT_SOLUTION_ERROR: &str = "solution-error";
pub const EVT_DEBUG_START: &str = "debug-start";
pub const EVT_DEBUG_SUCCESS: &str = "debug-success";
pub const EVT_DEBUG_ERROR: &str = "debug-error";
pub const EVT_STREAM_CHUNK: &str = "stream-chunk";

/// Fan-out channel the orchestrator publishes progress events on
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<AppEvent>,
}

impl EventEmitter {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event; a send with no subscribers is not an error
    pub fn emit(&self, name: &str, payload: Value) {
        let _ = self.tx.send(AppEvent {
            name: name.to_string(),
            payload,
        });
    }
}

/// Sequences the capture -> extract -> solve -> debug pipeline and owns the
/// cancellation flag for in-flight operations
pub struct ProcessingOrchestrator {
    emitter: EventEmitter,
    cancel: Arc<AtomicBool>,
}

impl Default for ProcessingOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingOrchestrator {
    pub fn new() -> Self {
        Self {
            emitter: EventEmitter::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Flags every in-flight request for cancellation
    pub fn cancel_ongoing_requests(&self) {
        info!("cancelling in-flight AI requests");
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn begin(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Emits a solution-error event unless the run was cancelled, then
    /// passes the error through
    fn solution_failure(&self, error: String) -> String {
        if !self.cancelled() {
            self.emitter
                .emit(EVT_SOLUTION_ERROR, json!({ "error": error.as_str() }));
        }
        error
    }

    fn debug_failure(&self, error: String) -> String {
        if !self.cancelled() {
            self.emitter
                .emit(EVT_DEBUG_ERROR, json!({ "error": error.as_str() }));
        }
        error
    }

    /// Full pipeline over the main queue: extract the problem from queued
    /// screenshots, then generate a solution in the requested language
    pub async fn process_screenshots(
        &self,
        config: &AiModelConfig,
        queue: &ScreenshotQueue,
        language: &str,
        stream: bool,
    ) -> Result<(ProblemInfo, SolutionResult), String> {
        self.begin();

        let shots = queue.list()?;
        if shots.is_empty() {
            self.emitter
                .emit(EVT_NO_SCREENSHOTS, json!({ "queue": "main" }));
            return Err("No screenshots queued".to_string());
        }
        if !config.multimodal {
            return Err(format!(
                "Model '{}' is not multimodal and cannot read screenshots",
                config.name
            ));
        }

        self.emitter
            .emit(EVT_INITIAL_START, json!({ "screenshots": shots.len() }));

        let mut images = Vec::with_capacity(shots.len());
        for path in &shots {
            images.push(load_payload_base64(path).await?);
        }

        // Stage 1: what is this problem?
        let extraction_request = format!(
            "Extract the programming problem shown in the attached screenshot(s). \
             The solution will be written in {}.",
            language
        );
        let raw = query_model(
            config,
            DEFAULT_EXTRACTION_PROMPT,
            &extraction_request,
            &images,
            &self.cancel,
        )
        .await
        .map_err(|e| self.solution_failure(e))?;

        let problem = parse_problem_info(&raw).map_err(|e| self.solution_failure(e))?;
        info!("extracted problem: {:.80}", problem.problem_statement);
        self.emitter.emit(
            EVT_PROBLEM_EXTRACTED,
            serde_json::to_value(&problem).unwrap_or(Value::Null),
        );

        // Stage 2: solve it
        let solution_request = build_solution_request(&problem, language);
        let raw = if stream {
            let emitter = self.emitter.clone();
            query_model_stream(
                config,
                DEFAULT_SOLUTION_PROMPT,
                &solution_request,
                &[],
                &self.cancel,
                |chunk| emitter.emit(EVT_STREAM_CHUNK, json!({ "chunk": chunk })),
            )
            .await
            .map_err(|e| self.solution_failure(e))?
        } else {
            query_model(
                config,
                DEFAULT_SOLUTION_PROMPT,
                &solution_request,
                &[],
                &self.cancel,
            )
            .await
            .map_err(|e| self.solution_failure(e))?
        };

        if self.cancelled() {
            return Err("Request cancelled".to_string());
        }

        let solution = parse_solution_result(&raw).map_err(|e| self.solution_failure(e))?;
        self.emitter.emit(
            EVT_SOLUTION_SUCCESS,
            serde_json::to_value(&solution).unwrap_or(Value::Null),
        );

        self.record_run("solve", language, &problem, &solution);
        Ok((problem, solution))
    }

    /// Debug pipeline over the debug queue: feed the prior problem and
    /// solution plus new error screenshots back to the model
    pub async fn process_extra_screenshots(
        &self,
        config: &AiModelConfig,
        debug_queue: &ScreenshotQueue,
        problem: &ProblemInfo,
        prior_solution: &SolutionResult,
        language: &str,
    ) -> Result<SolutionResult, String> {
        self.begin();

        let shots = debug_queue.list()?;
        if shots.is_empty() {
            self.emitter
                .emit(EVT_NO_SCREENSHOTS, json!({ "queue": "debug" }));
            return Err("No debug screenshots queued".to_string());
        }
        if !config.multimodal {
            return Err(format!(
                "Model '{}' is not multimodal and cannot read screenshots",
                config.name
            ));
        }

        self.emitter
            .emit(EVT_DEBUG_START, json!({ "screenshots": shots.len() }));

        let mut images = Vec::with_capacity(shots.len());
        for path in &shots {
            images.push(load_payload_base64(path).await?);
        }

        let debug_request = build_debug_request(problem, prior_solution, language);
        let raw = query_model(
            config,
            DEFAULT_DEBUG_PROMPT,
            &debug_request,
            &images,
            &self.cancel,
        )
        .await
        .map_err(|e| self.debug_failure(e))?;

        if self.cancelled() {
            return Err("Request cancelled".to_string());
        }

        let solution = parse_solution_result(&raw).map_err(|e| self.debug_failure(e))?;
        self.emitter.emit(
            EVT_DEBUG_SUCCESS,
            serde_json::to_value(&solution).unwrap_or(Value::Null),
        );

        self.record_run("debug", language, problem, &solution);
        Ok(solution)
    }

    /// Persists a completed run; history is best-effort and never fails the
    /// pipeline that produced the result
    fn record_run(
        &self,
        kind: &str,
        language: &str,
        problem: &ProblemInfo,
        solution: &SolutionResult,
    ) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let solution_json =
            serde_json::to_string(solution).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = store_history_entry(
            &timestamp,
            kind,
            language,
            &problem.problem_statement,
            &solution_json,
        ) {
            warn!("failed to record {} run in history: {}", kind, e);
        }
    }
}

/// Parses the extraction answer into a [`ProblemInfo`]
pub fn parse_problem_info(raw: &str) -> Result<ProblemInfo, String> {
    let json_str = extract_json_object(raw)
        .ok_or_else(|| "Extraction response did not contain valid JSON".to_string())?;
    serde_json::from_str(&json_str).map_err(|e| format!("Failed to parse problem info: {}", e))
}

/// Parses a solve/debug answer into a [`SolutionResult`]
pub fn parse_solution_result(raw: &str) -> Result<SolutionResult, String> {
    let json_str = extract_json_object(raw)
        .ok_or_else(|| "Solution response did not contain valid JSON".to_string())?;
    serde_json::from_str(&json_str).map_err(|e| format!("Failed to parse solution: {}", e))
}

/// Builds the user message for the solution stage
pub fn build_solution_request(problem: &ProblemInfo, language: &str) -> String {
    let mut text = format!(
        "Solve this problem in {}.\n\nProblem:\n{}",
        language, problem.problem_statement
    );
    if let Some(constraints) = problem.constraints.as_deref() {
        text.push_str(&format!("\n\nConstraints:\n{}", constraints));
    }
    if let Some(input) = problem.example_input.as_deref() {
        text.push_str(&format!("\n\nExample input:\n{}", input));
    }
    if let Some(output) = problem.example_output.as_deref() {
        text.push_str(&format!("\n\nExample output:\n{}", output));
    }
    text
}

/// Builds the user message for the debug stage
pub fn build_debug_request(
    problem: &ProblemInfo,
    prior_solution: &SolutionResult,
    language: &str,
) -> String {
    format!(
        "The attached screenshots show errors or failing tests for the solution below. \
         Fix it in {}.\n\nProblem:\n{}\n\nCurrent solution:\n{}",
        language, problem.problem_statement, prior_solution.code
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_problem() -> ProblemInfo {
        ProblemInfo {
            problem_statement: "Sum two numbers".to_string(),
            constraints: Some("0 <= a, b <= 10^9".to_string()),
            example_input: Some("1 2".to_string()),
            example_output: None,
        }
    }

    #[test]
    fn parses_problem_info_with_surrounding_prose() {
        let raw = "Here is the extraction:\n{\"problem_statement\": \"Sum two numbers\", \"constraints\": null}";
        let problem = parse_problem_info(raw).unwrap();
        assert_eq!(problem.problem_statement, "Sum two numbers");
        assert!(problem.constraints.is_none());
    }

    #[test]
    fn parses_solution_with_missing_optional_fields() {
        let raw = "{\"code\": \"print(1+2)\"}";
        let solution = parse_solution_result(raw).unwrap();
        assert_eq!(solution.code, "print(1+2)");
        assert!(solution.thoughts.is_empty());
        assert!(solution.time_complexity.is_none());
    }

    #[test]
    fn rejects_answers_without_a_json_object() {
        assert!(parse_problem_info("sorry, no idea").is_err());
        assert!(parse_solution_result("").is_err());
    }

    #[test]
    fn solution_request_includes_optional_sections_when_present() {
        let text = build_solution_request(&sample_problem(), "rust");
        assert!(text.contains("Solve this problem in rust"));
        assert!(text.contains("Constraints:\n0 <= a, b <= 10^9"));
        assert!(text.contains("Example input:\n1 2"));
        assert!(!text.contains("Example output:"));
    }

    #[test]
    fn debug_request_carries_prior_code() {
        let solution = SolutionResult {
            code: "print(1)".to_string(),
            thoughts: vec![],
            time_complexity: None,
            space_complexity: None,
        };
        let text = build_debug_request(&sample_problem(), &solution, "python");
        assert!(text.contains("Fix it in python"));
        assert!(text.contains("print(1)"));
    }

    #[tokio::test]
    async fn emitter_delivers_events_to_subscribers() {
        let orchestrator = ProcessingOrchestrator::new();
        let mut rx = orchestrator.emitter().subscribe();
        orchestrator
            .emitter()
            .emit(EVT_INITIAL_START, json!({ "screenshots": 2 }));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, EVT_INITIAL_START);
        assert_eq!(event.payload["screenshots"], 2);
    }

    #[tokio::test]
    async fn cancelled_failures_do_not_emit_error_events() {
        let orchestrator = ProcessingOrchestrator::new();
        let mut rx = orchestrator.emitter().subscribe();

        orchestrator.cancel_ongoing_requests();
        let passthrough = orchestrator.solution_failure("Request cancelled".to_string());
        assert_eq!(passthrough, "Request cancelled");
        assert!(rx.try_recv().is_err());

        orchestrator.begin();
        orchestrator.solution_failure("boom".to_string());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, EVT_SOLUTION_ERROR);
        assert_eq!(event.payload["error"], "boom");
    }
}
