use dppm_core::Domain;

use crate::context::PromptContext;
use crate::headers;
use crate::markers;

/// Assemble the decomposition prompt for the goal in `ctx`.
pub fn build(ctx: &PromptContext, min: usize, max: usize) -> String {
    let mut prompt = String::new();
    ctx.append_preamble(&mut prompt);
    append_instructions(&mut prompt, min, max);
    prompt
}

fn append_instructions(prompt: &mut String, min: usize, max: usize) {
    let domains = Domain::ALL
        .iter()
        .map(|d| d.as_str())
        .collect::<Vec<_>>()
        .join(" | ");

    prompt.push_str(headers::DECOMPOSE);
    prompt.push_str("\n\n");
    prompt.push_str(&format!(
        "Split the goal above into between {min} and {max} subtasks. Each subtask \
         must be independently executable once its dependencies are done. A subtask \
         may only depend on subtasks declared before it.\n\n"
    ));
    prompt.push_str("Output each subtask in EXACTLY this format:\n\n");
    prompt.push_str(&format!(
        "{} <short-kebab-id>\n\
         **Title:** <one line>\n\
         **Domain:** <{domains}>\n\
         **Complexity:** <0-10>\n\
         **Depends on:** <comma-separated ids, or none>\n\
         **Description:**\n\
         <what this subtask delivers>\n\
         {}\n\n",
        markers::SUBTASK,
        markers::SEPARATOR
    ));
    prompt.push_str(
        "Do not output anything except the subtask blocks. Lessons from prior \
         experience, if listed above, should shape the breakdown.\n",
    );
}
