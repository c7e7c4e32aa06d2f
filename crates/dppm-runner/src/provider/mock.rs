use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{ModelProvider, ProviderError};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(String),
    Timeout,
}

struct Rule {
    marker: String,
    replies: Vec<MockReply>,
    served: usize,
}

/// A provider scripted by prompt substring. Rules are checked in the order
/// they were added and the first whose marker occurs in the prompt answers.
/// A rule with several replies serves them in turn, repeating the last.
pub struct MockProvider {
    name: String,
    cost: f64,
    delay: Duration,
    rules: Mutex<Vec<Rule>>,
    fallback: Option<MockReply>,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cost: 1.0,
            delay: Duration::ZERO,
            rules: Mutex::new(Vec::new()),
            fallback: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on(self, marker: &str, text: &str) -> Self {
        self.on_replies(marker, vec![MockReply::Text(text.to_string())])
    }

    pub fn fail_on(self, marker: &str, message: &str) -> Self {
        self.on_replies(marker, vec![MockReply::Fail(message.to_string())])
    }

    pub fn on_replies(mut self, marker: &str, replies: Vec<MockReply>) -> Self {
        if let Ok(rules) = self.rules.get_mut() {
            rules.push(Rule {
                marker: marker.to_string(),
                replies,
                served: 0,
            });
        }
        self
    }

    /// Reply used when no rule matches. Without one, unmatched prompts fail.
    pub fn otherwise(mut self, reply: MockReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn next_reply(&self, prompt: &str) -> Option<MockReply> {
        let mut rules = self.rules.lock().ok()?;
        for rule in rules.iter_mut() {
            if rule.replies.is_empty() || !prompt.contains(&rule.marker) {
                continue;
            }
            let idx = rule.served.min(rule.replies.len() - 1);
            rule.served += 1;
            return Some(rule.replies[idx].clone());
        }
        self.fallback.clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost_per_call(&self) -> f64 {
        self.cost
    }

    async fn invoke(&self, prompt: &str) -> Result<String, ProviderError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let reply = self.next_reply(prompt);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match reply {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(message)) => Err(ProviderError::Failed(message)),
            Some(MockReply::Timeout) => Err(ProviderError::Timeout(Duration::ZERO)),
            None => Err(ProviderError::Failed(format!(
                "{}: no scripted reply for prompt",
                self.name
            ))),
        }
    }
}
