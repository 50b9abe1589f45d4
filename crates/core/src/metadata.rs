//! Structured contract metadata: the LLM-backed extractor, output recovery and
//! normalization, and the customer category lookup.

use crate::config::RetryPolicy;
use crate::error::MetadataError;
use crate::models::ContractMetadata;
use crate::retry::retry_with_backoff;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a contract analysis assistant. Extract structured fields \
from contract text and answer with a single JSON object only.";

const FIELD_INSTRUCTIONS: &str = r#"Extract these fields from the contract below:
- party_a: name of the customer (Party A)
- party_b: name of the contracting entity (Party B)
- contract_type: business line of the contract (finance, internet, telecom, other)
- contract_amount: total contract amount as a number, without currency symbols
- signing_date: signing date as YYYY-MM-DD
- project_description: project or service description
- positions: positions or roles named in the contract
- personnel_list: people named in the contract
Use null for any field the contract does not state.

Contract text:
"#;

/// Field map returned by an extractor before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMetadata {
    pub fields: Map<String, Value>,
}

impl RawMetadata {
    pub fn from_value(value: Value) -> Result<Self, MetadataError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(MetadataError::Unparseable(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Wraps hand-edited metadata so it goes through the same normalization as extractor output.
    pub fn from_edited(edited: &ContractMetadata) -> Result<Self, MetadataError> {
        Self::from_value(serde_json::to_value(edited)?)
    }

    fn first(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|key| self.fields.get(*key))
            .find(|value| !value.is_null())
    }

    /// Converts loosely typed extractor output into [`ContractMetadata`].
    pub fn normalize(&self) -> ContractMetadata {
        let text = |keys: &[&str]| self.first(keys).and_then(normalize_text);

        ContractMetadata {
            customer_name: text(&["party_a", "customer_name"]),
            our_entity: text(&["party_b", "our_entity"]),
            contract_type: text(&["contract_type"]),
            contract_amount: self.first(&["contract_amount"]).and_then(parse_amount),
            signing_date: self
                .first(&["signing_date"])
                .and_then(|value| value.as_str())
                .and_then(parse_date)
                .map(|date| date.format("%Y-%m-%d").to_string()),
            project_description: text(&["project_description"]),
            positions: text(&["positions"]),
            personnel_list: text(&["personnel_list"]),
            category_primary: None,
            category_secondary: None,
            extracted_at: Some(Utc::now()),
        }
    }
}

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<RawMetadata, MetadataError>;
}

fn is_placeholder(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "" | "null" | "none" | "n/a" | "na" | "-" | "无" | "未提及"
    )
}

/// Trimmed string value, with blanks and placeholders mapped to `None`.
/// Arrays are joined with `", "`; numbers are kept as their text.
pub fn normalize_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!is_placeholder(trimmed)).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(normalize_text).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

/// Numeric amount from a number or a string such as `"¥1,200,000.00"` or `"120万元"`.
pub fn parse_amount(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => parse_amount_text(text)?,
        _ => return None,
    };
    (amount.is_finite() && amount >= 0.0).then_some(amount)
}

fn parse_amount_text(text: &str) -> Option<f64> {
    let mut cleaned: String = text
        .trim()
        .replace("人民币", "")
        .replace("RMB", "")
        .replace("CNY", "")
        .chars()
        .filter(|c| !matches!(c, ',' | '，' | '¥' | '￥' | '$' | '元') && !c.is_whitespace())
        .collect();

    if is_placeholder(&cleaned) {
        return None;
    }

    let mut multiplier = 1.0;
    if let Some(stripped) = cleaned.strip_suffix('亿') {
        multiplier = 1e8;
        cleaned = stripped.to_string();
    } else if let Some(stripped) = cleaned.strip_suffix('万') {
        multiplier = 1e4;
        cleaned = stripped.to_string();
    }

    cleaned.parse::<f64>().ok().map(|amount| amount * multiplier)
}

/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, `YYYY.MM.DD` and `YYYY年MM月DD日`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y年%m月%d日"];
    let trimmed = text.trim();
    if is_placeholder(trimmed) {
        return None;
    }
    FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}

fn fenced_json() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid fence regex")
    })
}

/// Recovers a JSON object from model output: the whole reply, a fenced block,
/// or the outermost `{...}` span.
pub fn recover_json(reply: &str) -> Result<Value, MetadataError> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(captures) = fenced_json().captures(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&captures[1]) {
            return Ok(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(MetadataError::Unparseable(preview))
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Metadata extractor speaking the OpenAI-compatible `/v1/chat/completions` protocol.
pub struct LlmMetadataExtractor {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl LlmMetadataExtractor {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
            retry,
        }
    }

    fn request_body(&self, text: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": format!("{FIELD_INSTRUCTIONS}{text}") }
            ]
        })
    }

    /// One call. The outer error is retryable, the inner one is final.
    async fn call_once(&self, body: &Value) -> Result<Result<String, MetadataError>, MetadataError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(MetadataError::Request(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Ok(Err(MetadataError::Request(format!(
                "{} returned {status}: {details}",
                self.endpoint
            ))));
        }

        let body: ChatResponse = response.json().await?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| MetadataError::Unparseable("response carried no choices".to_string())))
    }
}

#[async_trait]
impl MetadataExtractor for LlmMetadataExtractor {
    async fn extract(&self, text: &str) -> Result<RawMetadata, MetadataError> {
        if text.trim().is_empty() {
            return Err(MetadataError::EmptyInput);
        }

        let body = self.request_body(text);
        let reply = retry_with_backoff(&self.retry, "metadata_llm", |_| self.call_once(&body)).await??;
        debug!(reply_chars = reply.chars().count(), "metadata model replied");
        RawMetadata::from_value(recover_json(&reply)?)
    }
}

/// One row of the customer category file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryEntry {
    pub customer_name: String,
    #[serde(default)]
    pub category_primary: Option<String>,
    #[serde(default)]
    pub category_secondary: Option<String>,
}

pub type CustomerCategory = (Option<String>, Option<String>);

fn party_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Regex::new(r"^(?:[甲乙丙丁]方|party\s*[abcd])[:：\s]*").expect("valid party prefix regex")
    })
}

/// Lookup key for a customer name: party prefix, brackets and whitespace removed, case-folded.
pub fn normalize_customer_key(name: &str) -> String {
    let lowered = name.trim().replace('\u{3000}', " ").to_lowercase();
    let without_prefix = party_prefix().replace(&lowered, "");
    without_prefix
        .trim_matches(|c: char| matches!(c, '（' | '）' | '(' | ')') || c.is_whitespace())
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

#[derive(Default)]
struct LoadedCategories {
    mapping: HashMap<String, CustomerCategory>,
    modified: Option<SystemTime>,
}

/// Customer → category mapping read from a JSON array of [`CategoryEntry`],
/// re-read whenever the file's modification time changes.
pub struct CustomerCategoryLookup {
    path: PathBuf,
    state: Mutex<LoadedCategories>,
}

impl CustomerCategoryLookup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(LoadedCategories::default()),
        }
    }

    pub fn lookup(&self, customer_name: &str) -> CustomerCategory {
        let key = normalize_customer_key(customer_name);
        if key.is_empty() {
            return (None, None);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.reload_if_changed(&mut state);
        state.mapping.get(&key).cloned().unwrap_or((None, None))
    }

    /// Fills the category fields of `metadata` from its customer name.
    pub fn apply(&self, metadata: &mut ContractMetadata) {
        if let Some(customer) = metadata.customer_name.as_deref() {
            let (primary, secondary) = self.lookup(customer);
            metadata.category_primary = primary;
            metadata.category_secondary = secondary;
        }
    }

    fn reload_if_changed(&self, state: &mut LoadedCategories) {
        let modified = match std::fs::metadata(&self.path).and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => {
                if !state.mapping.is_empty() {
                    warn!(path = %self.path.display(), "category file disappeared, clearing mapping");
                }
                *state = LoadedCategories::default();
                return;
            }
        };

        if state.modified == Some(modified) {
            return;
        }

        match read_category_file(&self.path) {
            Ok(mapping) => {
                info!(path = %self.path.display(), entries = mapping.len(), "category mapping loaded");
                state.mapping = mapping;
                state.modified = Some(modified);
            }
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "category mapping not reloaded");
            }
        }
    }
}

fn read_category_file(path: &std::path::Path) -> Result<HashMap<String, CustomerCategory>, MetadataError> {
    let raw = std::fs::read_to_string(path)?;
    let entries: Vec<CategoryEntry> = serde_json::from_str(&raw)?;

    let mut mapping = HashMap::new();
    for entry in entries {
        let key = normalize_customer_key(&entry.customer_name);
        if key.is_empty() {
            continue;
        }
        // First entry wins on duplicates.
        mapping
            .entry(key)
            .or_insert((entry.category_primary, entry.category_secondary));
    }
    Ok(mapping)
}
