use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Domain tag assigned to each subtask.
///
/// The tag doubles as the routing category when a mini-plan is requested,
/// so providers build up a separate track record per domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Research,
    Writing,
    Code,
    Data,
    Communication,
    General,
}

impl Domain {
    pub const ALL: &[Domain] = &[
        Domain::Research,
        Domain::Writing,
        Domain::Code,
        Domain::Data,
        Domain::Communication,
        Domain::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Research => "research",
            Domain::Writing => "writing",
            Domain::Code => "code",
            Domain::Data => "data",
            Domain::Communication => "communication",
            Domain::General => "general",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "research" => Some(Domain::Research),
            "writing" => Some(Domain::Writing),
            "code" => Some(Domain::Code),
            "data" => Some(Domain::Data),
            "communication" => Some(Domain::Communication),
            "general" => Some(Domain::General),
            _ => None,
        }
    }

    /// Guess a domain from free text. Used when the model omits the tag or
    /// returns one outside the known set.
    pub fn infer(text: &str) -> Self {
        let text = text.to_lowercase();
        let table: &[(Domain, &[&str])] = &[
            (
                Domain::Code,
                &["code", "implement", "deploy", "build", "script", "test", "debug", "api"],
            ),
            (
                Domain::Research,
                &["research", "investigate", "gather", "search", "find", "compare", "survey"],
            ),
            (
                Domain::Data,
                &["data", "analy", "csv", "metric", "spreadsheet", "chart", "dataset"],
            ),
            (
                Domain::Communication,
                &["post", "send", "email", "publish", "announce", "notify", "tweet", "share"],
            ),
            (
                Domain::Writing,
                &["write", "draft", "copy", "edit", "review", "summar", "document", "synthes"],
            ),
        ];

        table
            .iter()
            .map(|(domain, words)| {
                let hits = words.iter().filter(|w| text.contains(*w)).count();
                (*domain, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            // First-listed domain wins ties.
            .fold(None, |best: Option<(Domain, usize)>, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            })
            .map(|(d, _)| d)
            .unwrap_or(Domain::General)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decomposed unit of a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub domain: Domain,
    /// Ids of subtasks that must reach a terminal state first.
    pub depends_on: Vec<String>,
    /// Estimated complexity, 0–10.
    pub complexity: u8,
    /// Optional subtasks do not count against overall success.
    #[serde(default)]
    pub optional: bool,
}

impl Subtask {
    pub const MAX_COMPLEXITY: u8 = 10;

    /// One minute per complexity point, at least one minute.
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(60 * u64::from(self.complexity.max(1)))
    }
}
