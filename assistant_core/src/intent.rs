//! Typed intents, raw requests and the intent-resolution collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::IntentResolutionError;

/// A raw inbound request as received from a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRequest {
    pub id: Uuid,
    pub user_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl RawRequest {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// A confidence-scored interpretation of a raw request.
///
/// Fields are private so an intent cannot change after it has been handed to
/// the dispatcher; use the `with_*` builders while producing one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    #[serde(rename = "type")]
    kind: String,
    confidence: f32,
    entities: HashMap<String, Value>,
    context: HashMap<String, Value>,
    timestamp: DateTime<Utc>,
    request_id: Option<Uuid>,
}

impl Intent {
    /// Confidence is clamped into `[0, 1]`.
    pub fn new(kind: impl Into<String>, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            kind: kind.into(),
            confidence,
            entities: HashMap::new(),
            context: HashMap::new(),
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    pub fn with_entity(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entities.insert(key.into(), value.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn entities(&self) -> &HashMap<String, Value> {
        &self.entities
    }

    pub fn entity(&self, key: &str) -> Option<&Value> {
        self.entities.get(key)
    }

    pub fn context(&self) -> &HashMap<String, Value> {
        &self.context
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn request_id(&self) -> Option<Uuid> {
        self.request_id
    }

    pub fn is_low_confidence(&self, threshold: f32) -> bool {
        self.confidence < threshold
    }
}

/// Turns a raw request into a typed intent. Classification internals live
/// behind this trait.
#[async_trait]
pub trait IntentResolver: Send + Sync {
    async fn resolve(&self, request: &RawRequest) -> Result<Intent, IntentResolutionError>;
}

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number regex"));
static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:~|\.{1,2})?/[\w./-]+|\b[\w-]+\.[A-Za-z0-9]{1,5}\b").expect("valid path regex"));
static EXPRESSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\d(][\d+\-*/().\s]*[\d)]").expect("valid expression regex"));

const OPERATOR_WORDS: &[(&str, &str)] = &[
    ("plus", "add"),
    ("add", "add"),
    ("+", "add"),
    ("minus", "subtract"),
    ("subtract", "subtract"),
    ("times", "multiply"),
    ("multiplied", "multiply"),
    ("multiply", "multiply"),
    ("*", "multiply"),
    ("divided", "divide"),
    ("divide", "divide"),
    ("/", "divide"),
    ("percent", "percentage"),
    ("%", "percentage"),
];

const FILE_ACTIONS: &[&str] = &["list", "find", "search", "create", "delete", "move", "copy", "rename"];

/// Phrase-table resolver used when no model-backed resolver is configured.
///
/// Each intent owns a list of trigger phrases; the intent with the most
/// matches wins and confidence grows with the number of matched phrases.
pub struct KeywordIntentResolver {
    rules: Vec<(String, Vec<String>)>,
}

impl Default for KeywordIntentResolver {
    fn default() -> Self {
        Self::with_rules(Self::default_rules())
    }
}

impl KeywordIntentResolver {
    /// Phrase table for the intents served by the built-in and bundled plugins.
    pub fn default_rules() -> Vec<(String, Vec<String>)> {
        let table: &[(&str, &[&str])] = &[
            ("greeting", &["hello", "hi", "hey", "good morning", "good evening", "howdy", "greetings"]),
            ("help", &["help", "what can you do", "instructions", "assist me", "guidance"]),
            ("status", &["status", "are you running", "health"]),
            ("time_date", &["time", "date", "today", "what day", "clock"]),
            ("calculation", &["calculate", "compute", "plus", "minus", "times", "divided by", "percent", "sum", "math"]),
            ("file_history", &["recent searches", "search history", "previous searches", "last searches"]),
            ("file_search", &["find file", "search files", "search for", "locate", "find"]),
            ("file_management", &["file", "folder", "directory", "list files", "create folder", "delete file"]),
            ("system_control", &["system info", "system information", "cpu", "memory", "disk space", "processes"]),
        ];
        table
            .iter()
            .map(|(intent, phrases)| {
                (intent.to_string(), phrases.iter().map(|p| p.to_string()).collect())
            })
            .collect()
    }

    pub fn with_rules(rules: Vec<(String, Vec<String>)>) -> Self {
        Self { rules }
    }

    /// Append a rule; earlier rules still win ties.
    pub fn with_rule(mut self, intent: &str, phrases: &[&str]) -> Self {
        self.rules.push((
            intent.to_string(),
            phrases.iter().map(|p| p.to_string()).collect(),
        ));
        self
    }

    pub fn intents(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(intent, _)| intent.as_str())
    }

    fn score(&self, text: &str) -> Option<(&str, usize)> {
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .collect();

        let mut best: Option<(&str, usize)> = None;
        for (intent, phrases) in &self.rules {
            let hits = phrases
                .iter()
                .filter(|phrase| {
                    if phrase.contains(' ') {
                        text.contains(phrase.as_str())
                    } else {
                        words.iter().any(|w| w == phrase)
                    }
                })
                .count();
            // strict `>` keeps the earlier rule on ties
            if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
                best = Some((intent.as_str(), hits));
            }
        }
        best
    }
}

fn extract_entities(text: &str, mut intent: Intent) -> Intent {
    let numbers: Vec<Value> = NUMBER_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .map(Value::from)
        .collect();
    if !numbers.is_empty() {
        intent = intent.with_entity("numbers", Value::Array(numbers));
    }

    let mut operators: Vec<Value> = Vec::new();
    for token in text.split_whitespace() {
        if let Some((_, op)) = OPERATOR_WORDS.iter().find(|(w, _)| *w == token) {
            operators.push(Value::from(*op));
        }
    }
    if !operators.is_empty() {
        intent = intent.with_entity("operators", Value::Array(operators));
    }

    if let Some(expr) = EXPRESSION_RE.find(text) {
        let expr = expr.as_str().trim();
        if expr.chars().any(|c| "+-*/".contains(c)) {
            intent = intent.with_entity("expression", expr);
        }
    }

    let paths: Vec<Value> = PATH_RE
        .find_iter(text)
        .map(|m| Value::from(m.as_str()))
        .collect();
    if !paths.is_empty() {
        intent = intent.with_entity("file_paths", Value::Array(paths));
    }

    let actions: Vec<Value> = FILE_ACTIONS
        .iter()
        .filter(|a| text.split_whitespace().any(|w| w == **a))
        .map(|a| Value::from(*a))
        .collect();
    if !actions.is_empty() {
        intent = intent.with_entity("actions", Value::Array(actions));
    }

    intent
}

#[async_trait]
impl IntentResolver for KeywordIntentResolver {
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    async fn resolve(&self, request: &RawRequest) -> Result<Intent, IntentResolutionError> {
        let text = request.text.trim().to_lowercase();
        if text.is_empty() {
            return Err(IntentResolutionError::EmptyRequest);
        }

        let (kind, hits) = self
            .score(&text)
            .ok_or_else(|| IntentResolutionError::Unrecognized(request.text.clone()))?;

        let confidence = (0.45 + 0.2 * hits as f32).min(0.95);
        debug!(intent = kind, hits, confidence, "Keyword intent resolved");

        let intent = Intent::new(kind, confidence)
            .with_request(request.id)
            .with_context("user_id", request.user_id.clone())
            .with_context("original_text", request.text.clone());
        Ok(extract_entities(&text, intent))
    }
}
