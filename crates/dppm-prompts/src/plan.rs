use dppm_core::Subtask;

use crate::context::PromptContext;
use crate::headers;
use crate::markers;

/// Assemble the mini-plan prompt for one subtask. `siblings` lists the other
/// subtasks of the goal so the model knows what it can rely on.
pub fn build(ctx: &PromptContext, subtask: &Subtask, siblings: &[Subtask]) -> String {
    let mut prompt = String::new();
    ctx.append_preamble(&mut prompt);

    prompt.push_str(&format!("{}\n\n", subtask_header(&subtask.id)));
    prompt.push_str(&format!("**Title:** {}\n", subtask.title));
    prompt.push_str(&format!("**Domain:** {}\n\n", subtask.domain));
    prompt.push_str(&format!("{}\n\n", subtask.description));

    if !subtask.depends_on.is_empty() {
        prompt.push_str("### Inputs from earlier subtasks\n\n");
        for dep in &subtask.depends_on {
            match siblings.iter().find(|s| &s.id == dep) {
                Some(s) => prompt.push_str(&format!("- {}: {}\n", s.id, s.title)),
                None => prompt.push_str(&format!("- {dep}\n")),
            }
        }
        prompt.push('\n');
    }

    append_instructions(&mut prompt);
    prompt
}

/// Header line naming the subtask a plan prompt is for.
pub fn subtask_header(id: &str) -> String {
    format!("## Subtask: {id}")
}

fn append_instructions(prompt: &mut String) {
    prompt.push_str(headers::PLAN);
    prompt.push_str("\n\n");
    prompt.push_str(
        "Produce an ordered step plan for this subtask only. Each step becomes a \
         single tool call.\n\n",
    );
    prompt.push_str(&format!(
        "{step} <action>\n\
         **Expected:** <observable outcome>\n\
         **Capability:** <tool capability tag, e.g. web, files, social>\n\
         {sep}\n\n\
         After the steps, optionally add:\n\n\
         {tools} <tool>, <tool>\n\
         {risk} <one risk per line>\n\
         {alt} <fallback approach if the main one fails>\n\
         - <fallback step action>\n",
        step = markers::STEP,
        sep = markers::SEPARATOR,
        tools = markers::TOOLS,
        risk = markers::RISK,
        alt = markers::ALTERNATIVE,
    ));
}

#[cfg(test)]
mod tests {
    use dppm_core::Domain;

    use super::*;

    fn subtask(id: &str, deps: &[&str]) -> Subtask {
        Subtask {
            id: id.into(),
            title: format!("Title {id}"),
            description: format!("Describe {id}"),
            domain: Domain::Writing,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            complexity: 3,
            optional: false,
        }
    }

    #[test]
    fn lists_dependencies_by_title() {
        let draft = subtask("draft", &[]);
        let review = subtask("review", &["draft", "ghost"]);
        let prompt = build(
            &PromptContext::new("tweet"),
            &review,
            &[draft.clone(), review.clone()],
        );
        assert!(prompt.contains(&format!("{}\n", subtask_header("review"))));
        assert!(prompt.contains("**Title:** Title review"));
        assert!(prompt.contains("- draft: Title draft"));
        assert!(prompt.contains("- ghost\n"));
        assert!(prompt.contains(markers::STEP));
        assert!(prompt.contains(headers::PLAN));
    }

    #[test]
    fn no_inputs_section_without_dependencies() {
        let draft = subtask("draft", &[]);
        let prompt = build(&PromptContext::new("tweet"), &draft, &[]);
        assert!(!prompt.contains("### Inputs"));
    }
}
