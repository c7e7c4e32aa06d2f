use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Sentiment::Positive),
            "neutral" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            _ => None,
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionNote {
    pub subtask_id: String,
    pub sentiment: Sentiment,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostExecutionReflection {
    pub notes: Vec<ReflectionNote>,
    pub lessons: Vec<String>,
    pub overall_success: bool,
    pub workflow_candidate: bool,
    pub success_rate: f64,
    pub fallbacks_used: usize,
    /// True when the reflection was generated locally without a model.
    #[serde(default)]
    pub defaulted: bool,
}

impl PostExecutionReflection {
    pub fn note_for(&self, subtask_id: &str) -> Option<&ReflectionNote> {
        self.notes.iter().find(|n| n.subtask_id == subtask_id)
    }
}
