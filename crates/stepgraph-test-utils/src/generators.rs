use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use stepgraph_core::error::{Result, StepGraphError};
use stepgraph_core::structured::OutputSchema;
use stepgraph_core::traits::TextGenerator;
use stepgraph_core::types::{prompt_text, ChatMessage};

type ErrorFactory = Arc<dyn Fn() -> StepGraphError + Send + Sync>;

enum Reply {
    Text(Vec<String>),
    Json(Vec<Value>),
    Fail(ErrorFactory),
}

struct Rule {
    needle: String,
    reply: Reply,
    delay: Duration,
    hits: AtomicUsize,
}

/// One call received by a stub generator.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub prompt: String,
    /// Schema name for structured calls.
    pub schema: Option<String>,
}

/// A [`TextGenerator`] that answers from a script.
///
/// Each rule matches when its needle occurs in the prompt text; the first
/// matching rule of the right kind answers. A rule with several replies
/// hands them out in order and then repeats the last one. Structured
/// replies go through the schema's validation, so a scripted value that
/// does not conform fails the same way a real model reply would.
#[derive(Default)]
pub struct ScriptedGenerator {
    rules: Vec<Rule>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(mut self, needle: impl Into<String>, reply: Reply) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply,
            delay: Duration::ZERO,
            hits: AtomicUsize::new(0),
        });
        self
    }

    /// Answer free-text calls whose prompt contains `needle`.
    pub fn on_text(self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.rule(needle, Reply::Text(vec![text.into()]))
    }

    /// Answer successive free-text calls with `texts` in order.
    pub fn on_text_seq<I, S>(self, needle: impl Into<String>, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rule(needle, Reply::Text(texts.into_iter().map(Into::into).collect()))
    }

    /// Answer structured calls whose prompt contains `needle`.
    pub fn on_json(self, needle: impl Into<String>, value: Value) -> Self {
        self.rule(needle, Reply::Json(vec![value]))
    }

    /// Answer successive structured calls with `values` in order.
    pub fn on_json_seq(self, needle: impl Into<String>, values: Vec<Value>) -> Self {
        self.rule(needle, Reply::Json(values))
    }

    /// Fail any call whose prompt contains `needle`.
    pub fn fail_on<F>(self, needle: impl Into<String>, error: F) -> Self
    where
        F: Fn() -> StepGraphError + Send + Sync + 'static,
    {
        self.rule(needle, Reply::Fail(Arc::new(error)))
    }

    /// Delay the reply of the most recently added rule.
    pub fn delayed(mut self, delay: Duration) -> Self {
        if let Some(last) = self.rules.last_mut() {
            last.delay = delay;
        }
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of calls whose prompt contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.prompt.contains(needle))
            .count()
    }

    fn record(&self, prompt: &str, schema: Option<&str>) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call {
                prompt: prompt.to_string(),
                schema: schema.map(str::to_string),
            });
        }
    }

    fn find(&self, prompt: &str, structured: bool) -> Option<&Rule> {
        self.rules.iter().find(|r| {
            prompt.contains(&r.needle)
                && match r.reply {
                    Reply::Text(_) => !structured,
                    Reply::Json(_) => structured,
                    Reply::Fail(_) => true,
                }
        })
    }
}

fn nth_or_last<T: Clone>(items: &[T], n: usize) -> Option<T> {
    items.get(n).or_else(|| items.last()).cloned()
}

fn unscripted(prompt: &str) -> StepGraphError {
    let head: String = prompt.chars().take(80).collect();
    StepGraphError::LlmRequest(format!("no scripted reply for prompt: {}", head))
}

impl TextGenerator for ScriptedGenerator {
    fn generate(&self, messages: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let prompt = prompt_text(&messages);
            self.record(&prompt, None);

            let rule = self.find(&prompt, false).ok_or_else(|| unscripted(&prompt))?;
            let n = rule.hits.fetch_add(1, Ordering::SeqCst);
            if !rule.delay.is_zero() {
                tokio::time::sleep(rule.delay).await;
            }
            match &rule.reply {
                Reply::Text(texts) => nth_or_last(texts, n).ok_or_else(|| unscripted(&prompt)),
                Reply::Fail(error) => Err(error()),
                Reply::Json(_) => Err(unscripted(&prompt)),
            }
        })
    }

    fn generate_structured<'a>(
        &'a self,
        messages: Vec<ChatMessage>,
        schema: &'a OutputSchema,
    ) -> BoxFuture<'a, Result<Map<String, Value>>> {
        Box::pin(async move {
            let prompt = prompt_text(&messages);
            self.record(&prompt, Some(&schema.name));

            let rule = self.find(&prompt, true).ok_or_else(|| unscripted(&prompt))?;
            let n = rule.hits.fetch_add(1, Ordering::SeqCst);
            if !rule.delay.is_zero() {
                tokio::time::sleep(rule.delay).await;
            }
            match &rule.reply {
                Reply::Json(values) => {
                    let value = nth_or_last(values, n).ok_or_else(|| unscripted(&prompt))?;
                    schema.validate(&value)
                }
                Reply::Fail(error) => Err(error()),
                Reply::Text(_) => Err(unscripted(&prompt)),
            }
        })
    }
}

/// A [`TextGenerator`] whose every call fails.
pub struct FailingGenerator {
    error: ErrorFactory,
    calls: AtomicUsize,
}

impl FailingGenerator {
    pub fn new<F>(error: F) -> Self
    where
        F: Fn() -> StepGraphError + Send + Sync + 'static,
    {
        Self {
            error: Arc::new(error),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails like an unreachable model server.
    pub fn transient() -> Self {
        Self::new(|| StepGraphError::LlmRequest("connection refused".into()))
    }

    /// Fails like a model that answered in the wrong shape.
    pub fn invalid_output() -> Self {
        Self::new(|| StepGraphError::LlmParse("expected value at line 1 column 1".into()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextGenerator for FailingGenerator {
    fn generate(&self, _messages: Vec<ChatMessage>) -> BoxFuture<'_, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let err = (self.error)();
        Box::pin(async move { Err(err) })
    }

    fn generate_structured<'a>(
        &'a self,
        _messages: Vec<ChatMessage>,
        _schema: &'a OutputSchema,
    ) -> BoxFuture<'a, Result<Map<String, Value>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let err = (self.error)();
        Box::pin(async move { Err(err) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_text_rules_match_by_substring() {
        let generator = ScriptedGenerator::new()
            .on_text("tweet about", "Rust is fast")
            .on_text_seq("Improve", ["v2", "v3"]);

        let out = generator
            .generate(vec![ChatMessage::user("Write a tweet about Rust")])
            .await
            .unwrap();
        assert_eq!(out, "Rust is fast");

        for expected in ["v2", "v3", "v3"] {
            let out = generator
                .generate(vec![ChatMessage::user("Improve the tweet")])
                .await
                .unwrap();
            assert_eq!(out, expected);
        }
        assert_eq!(generator.call_count(), 4);
        assert_eq!(generator.calls_matching("Improve"), 3);
    }

    #[tokio::test]
    async fn test_structured_reply_is_validated() {
        let schema = OutputSchema::new("sentiment").one_of("sentiment", &["positive", "negative"]);
        let generator = ScriptedGenerator::new()
            .on_json("great", json!({"sentiment": "POSITIVE"}))
            .on_json("odd", json!({"sentiment": "confused"}));

        let out = generator
            .generate_structured(vec![ChatMessage::user("This is great")], &schema)
            .await
            .unwrap();
        assert_eq!(out["sentiment"], "positive");

        let err = generator
            .generate_structured(vec![ChatMessage::user("odd one")], &schema)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(generator.calls()[0].schema.as_deref(), Some("sentiment"));
    }

    #[tokio::test]
    async fn test_unscripted_and_failing_rules() {
        let generator = ScriptedGenerator::new()
            .fail_on("boom", || StepGraphError::LlmTimeout(5));

        let err = generator
            .generate(vec![ChatMessage::user("nothing matches")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no scripted reply"));

        let err = generator
            .generate(vec![ChatMessage::user("boom")])
            .await
            .unwrap_err();
        assert!(matches!(err, StepGraphError::LlmTimeout(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_rule_waits() {
        let generator = ScriptedGenerator::new()
            .on_text("slow", "done")
            .delayed(Duration::from_secs(3));

        let started = tokio::time::Instant::now();
        generator
            .generate(vec![ChatMessage::user("slow")])
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_failing_generator_counts_calls() {
        let generator = FailingGenerator::transient();
        let schema = OutputSchema::new("x").text("y");
        assert!(generator.generate(vec![]).await.unwrap_err().is_transient());
        assert!(generator
            .generate_structured(vec![], &schema)
            .await
            .is_err());
        assert_eq!(generator.call_count(), 2);
        assert!(FailingGenerator::invalid_output()
            .generate(vec![])
            .await
            .unwrap_err()
            .is_validation());
    }
}
