pub mod experiences;
pub mod runs;
pub mod workflows;
