//! Model-output producer seam.
//!
//! The language model is an external collaborator. It receives the folded
//! transcript and the declared tools and yields fragments and tool calls.
//! The turn processor never looks past this trait.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatResult;
use crate::projection::TranscriptEntry;
use crate::tools::ToolDefinition;

/// Input for one generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub session_id: String,
    pub module_number: u32,
    /// Transcript including the user message that opened the turn
    pub transcript: Vec<TranscriptEntry>,
    pub tools: Vec<ToolDefinition>,
}

/// One item of model output
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerItem {
    /// Text to stream to the user
    Fragment(String),
    /// A tool invocation; `arguments` is whatever the model sent
    ToolCall { name: String, arguments: Value },
    /// Normal end of output
    Finished,
}

/// Stream of producer output. Ending without [`ProducerItem::Finished`] is
/// treated as an abrupt termination.
pub type ProducerStream = BoxStream<'static, ChatResult<ProducerItem>>;

/// Source of model output for a turn
#[async_trait]
pub trait ModelProducer: Send + Sync {
    /// Start a generation
    async fn generate(&self, request: GenerationRequest) -> ChatResult<ProducerStream>;

    /// Name used in logs
    fn name(&self) -> &str;
}
