//! Default prompt templates for AI interactions

/// Default prompt for extracting a problem description from screenshots
pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"You are given one or more screenshots of a programming problem. Read everything visible and describe the problem.

Return ONLY valid JSON in this exact shape:
{
  "problem_statement": "full text of the problem being asked",
  "constraints": "input bounds and other stated constraints, or null",
  "example_input": "sample input shown, or null",
  "example_output": "sample output shown, or null"
}

Rules:
- Transcribe the problem faithfully; do not solve it yet.
- Merge partial text that spans multiple screenshots into one statement.
- Do not include markdown fences or any text outside the JSON object."#;

/// Default prompt for generating a solution to an extracted problem
pub const DEFAULT_SOLUTION_PROMPT: &str = r#"You are an expert competitive programmer. Solve the problem you are given.

Return ONLY valid JSON in this exact shape:
{
  "code": "complete runnable solution in the requested language",
  "thoughts": ["short bullet explaining the approach", "another key insight"],
  "time_complexity": "e.g. O(n log n) with one sentence of justification",
  "space_complexity": "e.g. O(n) with one sentence of justification"
}

Rules:
- The code must be complete and compile/run as-is, not a fragment.
- Prefer the simplest approach that meets the stated constraints.
- Keep thoughts to at most four short strings.
- Do not include markdown fences or any text outside the JSON object."#;

/// Default prompt for debugging a previous solution against new screenshots
pub const DEFAULT_DEBUG_PROMPT: &str = r#"You are an expert debugger. You are given a programming problem, a prior solution attempt, and screenshots showing errors or failing tests for that attempt.

Return ONLY valid JSON in this exact shape:
{
  "code": "corrected complete solution in the requested language",
  "thoughts": ["what was wrong", "what was changed"],
  "time_complexity": "complexity of the corrected solution",
  "space_complexity": "complexity of the corrected solution"
}

Rules:
- Base the fix on the errors visible in the screenshots.
- Return the full corrected program, not a diff.
- Do not include markdown fences or any text outside the JSON object."#;
