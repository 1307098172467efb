//! Scripted model producer for testing.
//!
//! Replays predefined output steps instead of calling a model, and captures
//! every generation request for verification. Scripts can be loaded from
//! JSON so the CLI can drive turns offline:
//!
//! ```json
//! [
//!   {"step": "fragment", "text": "Hel"},
//!   {"step": "fragment", "text": "lo"},
//!   {"step": "tool_call", "name": "set_progress", "arguments": {"percent": 20}},
//!   {"step": "finish"}
//! ]
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ChatError, ChatResult};
use crate::producer::{GenerationRequest, ModelProducer, ProducerItem, ProducerStream};

/// One scripted output step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    Fragment { text: String },
    ToolCall { name: String, arguments: Value },
    Finish,
    /// Yield a producer error
    Fail { message: String },
    /// Go quiet; `ms: null` never wakes up
    Stall {
        #[serde(default)]
        ms: Option<u64>,
    },
}

impl ScriptStep {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment { text: text.into() }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            name: name.into(),
            arguments,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptFile {
    Turns(Vec<Vec<ScriptStep>>),
    Single(Vec<ScriptStep>),
}

/// Model producer that replays scripts, one per `generate` call
#[derive(Clone, Default)]
pub struct ScriptedProducer {
    scripts: Arc<RwLock<VecDeque<Vec<ScriptStep>>>>,
    /// Captured requests for verification
    requests: Arc<RwLock<Vec<GenerationRequest>>>,
    generate_count: Arc<AtomicUsize>,
    /// Failure returned by `generate` itself, before any stream exists
    simulate_failure: Arc<RwLock<Option<String>>>,
}

impl ScriptedProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next generation
    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        self.scripts.write().push_back(steps);
        self
    }

    /// Queue a script that streams `fragments` then finishes
    pub fn with_reply(self, fragments: &[&str]) -> Self {
        let mut steps: Vec<ScriptStep> = fragments.iter().map(|f| ScriptStep::fragment(*f)).collect();
        steps.push(ScriptStep::Finish);
        self.with_script(steps)
    }

    /// Fail every `generate` call
    pub fn simulate_failure(self, message: impl Into<String>) -> Self {
        *self.simulate_failure.write() = Some(message.into());
        self
    }

    /// Load scripts from JSON: one step array, or an array of step arrays
    pub fn from_json(json: &str) -> ChatResult<Self> {
        let producer = Self::new();
        match serde_json::from_str::<ScriptFile>(json)? {
            ScriptFile::Turns(turns) => producer.scripts.write().extend(turns),
            ScriptFile::Single(steps) => producer.scripts.write().push_back(steps),
        }
        Ok(producer)
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.read().clone()
    }

    pub fn generate_count(&self) -> usize {
        self.generate_count.load(Ordering::SeqCst)
    }

    /// Scripts not yet consumed
    pub fn remaining_scripts(&self) -> usize {
        self.scripts.read().len()
    }
}

#[async_trait]
impl ModelProducer for ScriptedProducer {
    async fn generate(&self, request: GenerationRequest) -> ChatResult<ProducerStream> {
        self.generate_count.fetch_add(1, Ordering::SeqCst);
        self.requests.write().push(request);

        if let Some(message) = self.simulate_failure.read().clone() {
            return Err(ChatError::Producer(message));
        }

        let steps = self
            .scripts
            .write()
            .pop_front()
            .ok_or_else(|| ChatError::Producer("scripted producer has no script left".to_string()))?;

        let output = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                let item = match steps.next()? {
                    ScriptStep::Fragment { text } => Ok(ProducerItem::Fragment(text)),
                    ScriptStep::ToolCall { name, arguments } => {
                        Ok(ProducerItem::ToolCall { name, arguments })
                    }
                    ScriptStep::Finish => Ok(ProducerItem::Finished),
                    ScriptStep::Fail { message } => Err(ChatError::Producer(message)),
                    ScriptStep::Stall { ms: Some(ms) } => {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        continue;
                    }
                    ScriptStep::Stall { ms: None } => {
                        futures::future::pending::<()>().await;
                        continue;
                    }
                };
                return Some((item, steps));
            }
        });

        Ok(output.boxed())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
