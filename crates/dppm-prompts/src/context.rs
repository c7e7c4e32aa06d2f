use serde::{Deserialize, Serialize};

/// Summary of a prior run, for inclusion in prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceHint {
    pub goal: String,
    pub succeeded: bool,
    pub lessons: Vec<String>,
}

/// Shared context rendered at the top of every prompt in a run.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub goal: String,
    pub experiences: Vec<ExperienceHint>,
}

impl PromptContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            experiences: Vec::new(),
        }
    }

    pub fn with_experiences(mut self, experiences: Vec<ExperienceHint>) -> Self {
        self.experiences = experiences;
        self
    }

    /// Render the shared preamble: goal header, then prior experience if any.
    pub fn append_preamble(&self, prompt: &mut String) {
        prompt.push_str(&format!("# Goal: {}\n\n", self.goal));

        if self.experiences.is_empty() {
            return;
        }
        prompt.push_str("## Prior Experience\n\n");
        for exp in &self.experiences {
            let status = if exp.succeeded { "succeeded" } else { "struggled" };
            prompt.push_str(&format!("- [{status}] {}\n", exp.goal));
            for lesson in &exp.lessons {
                prompt.push_str(&format!("  - lesson: {lesson}\n"));
            }
        }
        prompt.push('\n');
    }
}
