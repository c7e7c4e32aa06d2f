pub mod context;
pub mod critique;
pub mod decompose;
pub mod plan;
pub mod reflect;

pub use context::{ExperienceHint, PromptContext};
pub use critique::{CritiqueStrategy, DevilsAdvocate, DomainCritic};

/// Headings that open each structured block in a model response. The
/// parsers in the runner split on these, so prompts and parsers must agree.
pub mod markers {
    pub const SUBTASK: &str = "#### SUBTASK:";
    pub const STEP: &str = "#### STEP:";
    pub const TOOLS: &str = "#### TOOLS:";
    pub const RISK: &str = "#### RISK:";
    pub const ALTERNATIVE: &str = "#### ALTERNATIVE:";
    pub const NOTE: &str = "#### NOTE:";
    pub const LESSON: &str = "#### LESSON:";
    pub const SEPARATOR: &str = "---";
}

/// Header line each phase writes first. Mock providers key on these.
pub mod headers {
    pub const DECOMPOSE: &str = "## Instructions: Decompose";
    pub const PLAN: &str = "## Instructions: Plan Subtask";
    pub const CRITIQUE: &str = "## Instructions: Critique";
    pub const REFLECT: &str = "## Instructions: Reflect";
}
