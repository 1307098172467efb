//! Tools declared to the model producer.
//!
//! The producer names a tool and passes JSON arguments. Parsing turns that
//! pair into a closed [`ToolInvocation`] so dispatch is an exhaustive match.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ChatError, ChatResult};
use crate::types::{CompletionSummary, OutcomeOption};

pub const APPEND_STRUCTURED_OUTCOMES: &str = "append_structured_outcomes";
pub const SET_PROGRESS: &str = "set_progress";
pub const COMPLETE_MODULE: &str = "complete_module";

/// Tool declaration handed to the producer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A parsed tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    AppendOutcomes { options: Vec<OutcomeOption> },
    SetProgress { percent: i64 },
    CompleteModule { summary: CompletionSummary },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AppendOutcomesArgs {
    options: Vec<OutcomeOption>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SetProgressArgs {
    percent: i64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CompleteModuleArgs {
    summary: CompletionSummary,
}

impl ToolInvocation {
    /// Parse a tool call by name. Unknown names and argument shapes that do
    /// not match the declared schema are `InvalidToolCall`.
    pub fn parse(name: &str, arguments: &Value) -> ChatResult<Self> {
        match name {
            APPEND_STRUCTURED_OUTCOMES => {
                let args: AppendOutcomesArgs = decode(name, arguments)?;
                Ok(Self::AppendOutcomes {
                    options: args.options,
                })
            }
            SET_PROGRESS => {
                let args: SetProgressArgs = decode(name, arguments)?;
                Ok(Self::SetProgress {
                    percent: args.percent,
                })
            }
            COMPLETE_MODULE => {
                let args: CompleteModuleArgs = decode(name, arguments)?;
                Ok(Self::CompleteModule {
                    summary: args.summary,
                })
            }
            other => Err(ChatError::InvalidToolCall {
                tool: other.to_string(),
                reason: "unknown tool".to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AppendOutcomes { .. } => APPEND_STRUCTURED_OUTCOMES,
            Self::SetProgress { .. } => SET_PROGRESS,
            Self::CompleteModule { .. } => COMPLETE_MODULE,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(tool: &str, arguments: &Value) -> ChatResult<T> {
    serde_json::from_value(arguments.clone()).map_err(|e| ChatError::InvalidToolCall {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

/// Declarations for every tool the turn processor can dispatch
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: APPEND_STRUCTURED_OUTCOMES.to_string(),
            description: "Offer the user a set of mutually exclusive choices. \
                The user resolves the set exactly once."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "options": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": { "type": "string", "description": "Unique option id" },
                                "label": { "type": "string", "description": "Text shown to the user" },
                                "value": { "type": "string", "description": "Value recorded on selection" }
                            },
                            "required": ["id", "label", "value"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["options"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: SET_PROGRESS.to_string(),
            description: "Report how far the user is through the module.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "percent": { "type": "integer", "minimum": 5, "maximum": 100 }
                },
                "required": ["percent"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: COMPLETE_MODULE.to_string(),
            description: "Finish the module with a structured summary.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "summary": {
                        "type": "object",
                        "properties": {
                            "insights": {
                                "type": "array",
                                "minItems": 1,
                                "items": { "type": "string" }
                            },
                            "assessment": { "type": "string" },
                            "takeaway": { "type": "string" }
                        },
                        "required": ["insights", "assessment", "takeaway"],
                        "additionalProperties": false
                    }
                },
                "required": ["summary"],
                "additionalProperties": false
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_tool() {
        let outcomes = ToolInvocation::parse(
            APPEND_STRUCTURED_OUTCOMES,
            &json!({"options": [{"id": "mod_opt_1", "label": "Yes", "value": "yes"}]}),
        )
        .unwrap();
        assert!(matches!(outcomes, ToolInvocation::AppendOutcomes { ref options } if options.len() == 1));

        let progress = ToolInvocation::parse(SET_PROGRESS, &json!({"percent": 30})).unwrap();
        assert_eq!(progress, ToolInvocation::SetProgress { percent: 30 });
        assert_eq!(progress.name(), "set_progress");

        let complete = ToolInvocation::parse(
            COMPLETE_MODULE,
            &json!({"summary": {"insights": ["a"], "assessment": "b", "takeaway": "c"}}),
        )
        .unwrap();
        assert!(matches!(complete, ToolInvocation::CompleteModule { .. }));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let err = ToolInvocation::parse("delete_everything", &json!({})).unwrap_err();
        assert!(matches!(err, ChatError::InvalidToolCall { ref tool, .. } if tool == "delete_everything"));

        assert!(ToolInvocation::parse(SET_PROGRESS, &json!({"percent": "half"})).is_err());
        assert!(ToolInvocation::parse(SET_PROGRESS, &json!({"percent": 10, "extra": 1})).is_err());
        assert!(ToolInvocation::parse(COMPLETE_MODULE, &json!({"summary": {"insights": []}})).is_err());
    }

    #[test]
    fn test_definitions_cover_all_tools() {
        let names: Vec<String> = tool_definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec![APPEND_STRUCTURED_OUTCOMES, SET_PROGRESS, COMPLETE_MODULE]);
    }
}
