use dppm_core::{Domain, Subtask};
use dppm_prompts::markers;

/// Extract subtasks from a decomposition response.
///
/// Looks for blocks in this format:
/// ```markdown
/// #### SUBTASK: <id>
/// **Title:** <one line>
/// **Domain:** <research|writing|code|data|communication|general>
/// **Complexity:** <0-10>
/// **Depends on:** <ids, or none>
/// **Optional:** <yes|no>
/// **Description:**
/// <multi-line description>
/// ---
/// ```
///
/// Missing fields get defaults: the title falls back to the id, the
/// description to the title, complexity to 5, and the domain is inferred
/// from the text.
pub fn extract_subtasks(content: &str) -> Vec<Subtask> {
    let mut subtasks = Vec::new();
    let mut current: Option<Draft> = None;
    let mut in_description = false;

    for line in content.lines() {
        let trimmed = line.trim();

        if let Some(id) = trimmed.strip_prefix(markers::SUBTASK) {
            if let Some(draft) = current.take() {
                subtasks.push(draft.finish());
            }
            current = Some(Draft::new(id.trim()));
            in_description = false;
            continue;
        }

        let Some(draft) = current.as_mut() else {
            continue;
        };

        if trimmed == markers::SEPARATOR {
            if let Some(draft) = current.take() {
                subtasks.push(draft.finish());
            }
            in_description = false;
            continue;
        }

        if let Some(value) = field(trimmed, "Title") {
            draft.title = Some(value.to_string());
            in_description = false;
            continue;
        }

        if let Some(value) = field(trimmed, "Domain") {
            draft.domain = Domain::parse_str(&value.to_lowercase());
            in_description = false;
            continue;
        }

        if let Some(value) = field(trimmed, "Complexity") {
            draft.complexity = parse_complexity(value);
            in_description = false;
            continue;
        }

        if let Some(value) = field(trimmed, "Depends on") {
            draft.depends_on = parse_ids(value);
            in_description = false;
            continue;
        }

        if let Some(value) = field(trimmed, "Optional") {
            draft.optional = matches!(value.to_lowercase().as_str(), "yes" | "true");
            in_description = false;
            continue;
        }

        if let Some(value) = field(trimmed, "Description") {
            in_description = true;
            if !value.is_empty() {
                draft.description.push_str(value);
                draft.description.push('\n');
            }
            continue;
        }

        if in_description {
            draft.description.push_str(trimmed);
            draft.description.push('\n');
        }
    }

    // Trailing block without a closing delimiter
    if let Some(draft) = current.take() {
        subtasks.push(draft.finish());
    }

    subtasks
}

struct Draft {
    id: String,
    title: Option<String>,
    domain: Option<Domain>,
    complexity: Option<u8>,
    depends_on: Vec<String>,
    optional: bool,
    description: String,
}

impl Draft {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            title: None,
            domain: None,
            complexity: None,
            depends_on: Vec::new(),
            optional: false,
            description: String::new(),
        }
    }

    fn finish(self) -> Subtask {
        let title = self
            .title
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.id.clone());
        let description = self.description.trim().to_string();
        let description = if description.is_empty() {
            title.clone()
        } else {
            description
        };
        let domain = self
            .domain
            .unwrap_or_else(|| Domain::infer(&format!("{title} {description}")));

        Subtask {
            id: self.id,
            title,
            description,
            domain,
            depends_on: self.depends_on,
            complexity: self.complexity.unwrap_or(5),
            optional: self.optional,
        }
    }
}

/// Value of a `**Name:** value` line, tolerating `**Name: **`.
fn field<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let tight = format!("**{name}:**");
    let loose = format!("**{name}: **");
    line.strip_prefix(tight.as_str())
        .or_else(|| line.strip_prefix(loose.as_str()))
        .map(str::trim)
}

fn parse_complexity(value: &str) -> Option<u8> {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits
        .parse::<u32>()
        .ok()
        .map(|n| n.min(u32::from(Subtask::MAX_COMPLEXITY)) as u8)
}

fn parse_ids(value: &str) -> Vec<String> {
    if value.eq_ignore_ascii_case("none") || value == "-" {
        return Vec::new();
    }
    value
        .split(',')
        .map(|s| s.trim().trim_matches('`').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
