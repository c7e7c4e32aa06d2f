use dppm_core::{ExecutionResult, MergedPlan};

use crate::context::PromptContext;
use crate::headers;
use crate::markers;

/// Longest slice of a subtask's output included in the reflection prompt.
const OUTPUT_EXCERPT: usize = 400;

/// Assemble the post-execution reflection prompt.
pub fn build(ctx: &PromptContext, plan: &MergedPlan, result: &ExecutionResult) -> String {
    let mut prompt = String::new();
    ctx.append_preamble(&mut prompt);

    prompt.push_str("## Outcomes\n\n");
    for subtask in &plan.subtasks {
        let expected = plan
            .mini_plan(&subtask.id)
            .and_then(|p| p.expected_outcome())
            .unwrap_or("(none)");
        prompt.push_str(&format!("### {}: {}\n\n", subtask.id, subtask.title));
        prompt.push_str(&format!("Expected: {expected}\n"));
        match result.result(&subtask.id) {
            Some(r) => {
                prompt.push_str(&format!("Status: {}", r.status));
                if r.used_fallback {
                    prompt.push_str(" (via alternative)");
                }
                prompt.push('\n');
                if !r.output.is_empty() {
                    prompt.push_str(&format!("Output: {}\n", excerpt(&r.output)));
                }
                if let Some(ref err) = r.error {
                    prompt.push_str(&format!("Error: {err}\n"));
                }
            }
            None => prompt.push_str("Status: not run\n"),
        }
        prompt.push('\n');
    }

    prompt.push_str(headers::REFLECT);
    prompt.push_str("\n\n");
    prompt.push_str(
        "Compare each subtask's expected outcome with what actually happened. Write \
         one short note per subtask, then the lessons worth remembering for similar \
         goals. Lessons must be general, not specific to this run.\n\n",
    );
    prompt.push_str(&format!(
        "{} <subtask id>\n\
         **Sentiment:** <positive | neutral | negative>\n\
         <one or two sentences>\n\
         {}\n\n\
         {} <lesson>\n",
        markers::NOTE,
        markers::SEPARATOR,
        markers::LESSON
    ));
    prompt
}

fn excerpt(output: &str) -> &str {
    match output.char_indices().nth(OUTPUT_EXCERPT) {
        Some((idx, _)) => &output[..idx],
        None => output,
    }
}
