use std::fmt::Write;

use crate::analyzer::truncate;
use crate::brain::DecisionContext;
use crate::types::{ActionHistory, ElementDescriptor};

pub const SYSTEM_PROMPT: &str = r#"You are a web automation agent. You operate a real browser on behalf of a user who gave you an objective.

Each turn you receive:
- the objective,
- optional background knowledge,
- the current view: one line per interactive element, formatted as [index, tag, text],
- the history of what has been done so far,
- optionally the user's answer to your last question, feedback about a mistake in your previous proposal, and a screenshot.

Available actions:
- {"type":"CLICK","target_element_index":3,"explanation":"..."}
- {"type":"TYPE","target_element_index":5,"type_value":"text to enter","explanation":"..."}
- {"type":"ASK_USER","user_question":"...","explanation":"..."}
- {"type":"FINISH","status_message":"what was achieved","explanation":"..."}
- {"type":"FAIL","status_message":"why it cannot be done","explanation":"..."}

Rules:
1. Only use indices that appear in the current view. Indices change every turn.
2. You may bundle several CLICK/TYPE actions that belong together (e.g. filling a form). They run in order and stop at the first failure.
3. ASK_USER, FINISH and FAIL must be the only action in the bundle.
4. Ask the user for anything you cannot know (credentials, personal data, choices).
5. Read the history carefully. Do not repeat an action that already failed the same way.

Answer format (exactly these tagged sections, nothing else):
<thinking>your reasoning</thinking>
<page_summary>only when asked for one</page_summary>
<json_response>{"actions":[...],"overall_explanation_of_bundle":"..."}</json_response>"#;

/// One line per element: `[index, tag, text]`.
pub fn render_elements(elements: &[ElementDescriptor], max_text: usize) -> String {
    if elements.is_empty() {
        return "(no interactive elements are visible)".to_string();
    }
    let mut out = String::new();
    for el in elements {
        let _ = writeln!(out, "[{}, {}, {}]", el.index, el.tag, truncate(&el.text, max_text));
    }
    out.trim_end().to_string()
}

pub fn render_history(history: &ActionHistory) -> String {
    if history.is_empty() {
        return "(nothing yet)".to_string();
    }
    let mut out = String::new();
    for (i, outcome) in history.entries().iter().enumerate() {
        let _ = writeln!(out, "{}. [{}] {}", i + 1, outcome.action_type, outcome.description);
    }
    out.trim_end().to_string()
}

fn summary_instruction(page_changed: bool) -> &'static str {
    if page_changed {
        "The page changed since the last turn. Include a <page_summary> block of 2-4 sentences describing the page."
    } else {
        "The page has not meaningfully changed since the last turn. Do NOT include a <page_summary> block."
    }
}

/// The user prompt for one decision. `error_feedback` is set on re-decisions.
pub fn compose(ctx: &DecisionContext<'_>, error_feedback: Option<&str>, max_text: usize) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "**Objective:**\n{}\n", ctx.objective);

    if let Some(knowledge) = ctx.knowledge.filter(|k| !k.trim().is_empty()) {
        let _ = writeln!(prompt, "**Relevant Knowledge:**\n{}\n", knowledge.trim());
    }

    let _ = writeln!(
        prompt,
        "**Current Webpage View (Interactive Elements):**\n{}\n",
        render_elements(ctx.elements, max_text)
    );
    let _ = writeln!(prompt, "**History of Previous Actions:**\n{}\n", render_history(ctx.history));

    if let Some(answer) = ctx.user_response {
        let _ = writeln!(prompt, "**User's Answer to Your Previous Question:**\n{answer}\n");
    }
    if let Some(feedback) = error_feedback {
        let _ = writeln!(
            prompt,
            "**Your Previous Proposal Was Rejected:**\n{feedback}\nPropose again using only valid indices.\n"
        );
    }
    if ctx.screenshot_base64.is_some() {
        let _ = writeln!(prompt, "A screenshot of the current page is attached.\n");
    }

    prompt.push_str(summary_instruction(ctx.page_changed));
    prompt
}
