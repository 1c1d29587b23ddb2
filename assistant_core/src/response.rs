//! Structured responses and the response-assembly collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::context::UserContext;
use crate::dispatcher::DispatchResult;
use crate::intent::Intent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Machine-readable failure kind, e.g. `unroutable_intent`.
    pub kind: String,
    pub detail: String,
}

/// What the orchestrator hands back for every request, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub request_id: Uuid,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub entities: HashMap<String, Value>,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn failure(
        agent: &str,
        request_id: Uuid,
        user_id: &str,
        intent: Option<&Intent>,
        kind: &str,
        detail: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            timestamp: Utc::now(),
            agent: agent.to_string(),
            request_id,
            user_id: user_id.to_string(),
            intent: intent.map(|i| i.kind().to_string()),
            confidence: intent.map(Intent::confidence),
            entities: intent.map(|i| i.entities().clone()).unwrap_or_default(),
            data: Value::Null,
            plugin: None,
            error: Some(ResponseError {
                kind: kind.to_string(),
                detail: detail.into(),
            }),
        }
    }
}

/// Turns a dispatch result into the user-facing response.
#[async_trait]
pub trait ResponseAssembler: Send + Sync {
    async fn assemble(
        &self,
        result: &DispatchResult,
        intent: &Intent,
        context: &UserContext,
        request_id: Uuid,
    ) -> Response;
}

/// Uses the handler's message when present, otherwise summarises its data.
#[derive(Debug, Clone)]
pub struct TemplateAssembler {
    agent_name: String,
}

impl TemplateAssembler {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
        }
    }
}

fn summarize(data: &Value) -> String {
    match data {
        Value::Null => "Done.".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => format!("Found {} result(s).", items.len()),
        other => other.to_string(),
    }
}

#[async_trait]
impl ResponseAssembler for TemplateAssembler {
    async fn assemble(
        &self,
        result: &DispatchResult,
        intent: &Intent,
        context: &UserContext,
        request_id: Uuid,
    ) -> Response {
        let mut message = result
            .output
            .message
            .clone()
            .unwrap_or_else(|| summarize(&result.output.data));
        if result.low_confidence {
            message.push_str("\n(I wasn't completely sure what you meant; let me know if that missed.)");
        }
        Response {
            success: true,
            message,
            timestamp: Utc::now(),
            agent: self.agent_name.clone(),
            request_id,
            user_id: context.user_id.clone(),
            intent: Some(intent.kind().to_string()),
            confidence: Some(intent.confidence()),
            entities: intent.entities().clone(),
            data: result.output.data.clone(),
            plugin: Some(result.binding.plugin.clone()),
            error: None,
        }
    }
}
