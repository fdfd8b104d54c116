//! Form-source contracts and the record-matching layer: schema resolution, submission
//! matching, maturity classification and domain-expertise decoding.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use toolscope_core::{
    normalize_identifier, Choice, DomainCodeTable, DomainStatus, FailureKind, FieldCandidates,
    FormCategory, FormPage, FormTable, FormsConfig, MasterRecord, MaturityLevel,
    MaturitySynonyms, PerMaturity, Question, QuestionSchema, SourceFailure, SubmissionRecord,
};
use toolscope_provider::{FetchError, FormApiClient};
use tracing::debug;

pub const CRATE_NAME: &str = "toolscope-adapters";

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no registry record matches tool id {tool_id:?}")]
    ToolNotFound { tool_id: String },
    #[error("tool {tool_id:?} has unrecognized maturity value {raw:?}")]
    InvalidMaturity { tool_id: String, raw: String },
    #[error("loading question schema for {key}: {message}")]
    SchemaLoad { key: SchemaKey, message: String },
    #[error("fetching form {form_id}: {message}")]
    SourceFetch {
        form_id: String,
        status: Option<u16>,
        message: String,
    },
    #[error("form {form_id} did not respond within {after:?}")]
    SourceTimeout { form_id: String, after: Duration },
}

impl MatchError {
    pub fn fetch(form_id: &str, err: &FetchError) -> Self {
        MatchError::SourceFetch {
            form_id: form_id.to_string(),
            status: err.status(),
            message: err.to_string(),
        }
    }

    /// Classification failures end a search; everything else stays with its source.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchError::ToolNotFound { .. } | MatchError::InvalidMaturity { .. }
        )
    }

    pub fn to_failure(&self) -> SourceFailure {
        let kind = match self {
            MatchError::SourceTimeout { .. } => FailureKind::Timeout,
            MatchError::SchemaLoad { .. } => FailureKind::SchemaLoad,
            _ => FailureKind::Fetch,
        };
        SourceFailure {
            kind,
            message: self.to_string(),
        }
    }
}

/// The collection platform's submission listing.
#[async_trait]
pub trait FormDataProvider: Send + Sync {
    async fn fetch(&self, form_id: &str) -> Result<FormPage, MatchError>;
}

#[async_trait]
impl FormDataProvider for FormApiClient {
    async fn fetch(&self, form_id: &str) -> Result<FormPage, MatchError> {
        self.fetch_form(form_id)
            .await
            .map_err(|err| MatchError::fetch(form_id, &err))
    }
}

/// Offline provider reading `<root>/<form_id>.json` pages.
#[derive(Debug, Clone)]
pub struct FixtureFormProvider {
    root: PathBuf,
}

impl FixtureFormProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FormDataProvider for FixtureFormProvider {
    async fn fetch(&self, form_id: &str) -> Result<FormPage, MatchError> {
        let path = self.root.join(format!("{form_id}.json"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(MatchError::SourceFetch {
                    form_id: form_id.to_string(),
                    status: Some(404),
                    message: format!("no fixture at {}", path.display()),
                })
            }
            Err(err) => {
                return Err(MatchError::SourceFetch {
                    form_id: form_id.to_string(),
                    status: None,
                    message: format!("reading {}: {err}", path.display()),
                })
            }
        };
        serde_json::from_str(&text).map_err(|err| MatchError::SourceFetch {
            form_id: form_id.to_string(),
            status: None,
            message: format!("parsing {}: {err}", path.display()),
        })
    }
}

/// Cache key of a question schema: a form category, optionally narrowed to one maturity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaKey {
    pub category: FormCategory,
    pub maturity: Option<MaturityLevel>,
}

impl SchemaKey {
    pub fn new(category: FormCategory, maturity: Option<MaturityLevel>) -> Self {
        Self { category, maturity }
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.maturity {
            Some(maturity) => write!(f, "{}_{}", self.category, maturity),
            None => write!(f, "{}", self.category),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub choices: Option<Vec<Choice>>,
}

/// What a schema source hands back before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub fields: Vec<SchemaField>,
}

impl SchemaDefinition {
    pub fn into_schema(self) -> QuestionSchema {
        QuestionSchema::new(self.fields.into_iter().map(|field| {
            let label = if field.label.trim().is_empty() {
                field.name.clone()
            } else {
                field.label
            };
            Question {
                name: field.name,
                label,
                question_type: field.field_type,
                choices: field.choices.unwrap_or_default(),
            }
        }))
    }
}

#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load(&self, key: SchemaKey) -> Result<SchemaDefinition, MatchError>;
}

async fn read_definition_file(path: &Path) -> Result<SchemaDefinition> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    } else {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Schema definitions stored as `<root>/<key>.{json,yaml,yml}`. A maturity-specific
/// file (`user_type_a_early.json`) wins over the category file (`user_type_a.json`).
#[derive(Debug, Clone)]
pub struct FileSchemaSource {
    root: PathBuf,
}

impl FileSchemaSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidate_paths(&self, key: SchemaKey) -> Vec<PathBuf> {
        let mut stems = vec![key.to_string()];
        if key.maturity.is_some() {
            stems.push(key.category.to_string());
        }
        stems
            .iter()
            .flat_map(|stem| {
                ["json", "yaml", "yml"]
                    .into_iter()
                    .map(move |ext| self.root.join(format!("{stem}.{ext}")))
            })
            .collect()
    }
}

#[async_trait]
impl SchemaSource for FileSchemaSource {
    async fn load(&self, key: SchemaKey) -> Result<SchemaDefinition, MatchError> {
        for path in self.candidate_paths(key) {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            return read_definition_file(&path)
                .await
                .map_err(|err| MatchError::SchemaLoad {
                    key,
                    message: format!("{err:#}"),
                });
        }
        Err(MatchError::SchemaLoad {
            key,
            message: format!("no schema definition under {}", self.root.display()),
        })
    }
}

fn first_label(value: Option<&JsonValue>) -> Option<String> {
    let label = match value? {
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items.iter().find_map(|v| v.as_str())?.to_string(),
        _ => return None,
    };
    let label = label.trim().to_string();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

fn row_str<'a>(row: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| row.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Read the `survey` and `choices` tables of a form definition document.
pub fn parse_asset_content(asset: &JsonValue) -> Result<SchemaDefinition, String> {
    let content = asset.get("content").unwrap_or(asset);
    let survey = content
        .get("survey")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "form definition has no survey table".to_string())?;

    let mut lists: HashMap<&str, Vec<Choice>> = HashMap::new();
    if let Some(rows) = content.get("choices").and_then(|v| v.as_array()) {
        for row in rows {
            let (Some(list), Some(value)) = (
                row_str(row, &["list_name"]),
                row_str(row, &["name", "$autovalue"]),
            ) else {
                continue;
            };
            let label = first_label(row.get("label")).unwrap_or_else(|| value.to_string());
            lists.entry(list).or_default().push(Choice {
                value: value.to_string(),
                label,
            });
        }
    }

    let mut fields = Vec::new();
    for row in survey {
        let Some(field_type) = row_str(row, &["type"]) else {
            continue;
        };
        if field_type.starts_with("begin") || field_type.starts_with("end") {
            continue;
        }
        let Some(name) = row_str(row, &["name", "$autoname"]) else {
            continue;
        };
        let list_name = row_str(row, &["select_from_list_name"])
            .or_else(|| field_type.split_whitespace().nth(1));
        let choices = list_name.and_then(|list| lists.get(list).cloned());
        fields.push(SchemaField {
            name: name.to_string(),
            label: first_label(row.get("label")).unwrap_or_else(|| name.to_string()),
            field_type: field_type.to_string(),
            choices,
        });
    }

    Ok(SchemaDefinition { fields })
}

/// Reads schemas from the provider's form definition endpoint.
pub struct AssetSchemaSource {
    client: Arc<FormApiClient>,
    forms: FormTable,
}

impl AssetSchemaSource {
    pub fn new(client: Arc<FormApiClient>, forms: FormTable) -> Self {
        Self { client, forms }
    }
}

#[async_trait]
impl SchemaSource for AssetSchemaSource {
    async fn load(&self, key: SchemaKey) -> Result<SchemaDefinition, MatchError> {
        let source = self
            .forms
            .lookup(key.category, key.maturity)
            .ok_or_else(|| MatchError::SchemaLoad {
                key,
                message: "no form configured".to_string(),
            })?;
        let asset = self
            .client
            .fetch_asset(&source.form_id)
            .await
            .map_err(|err| MatchError::SchemaLoad {
                key,
                message: err.to_string(),
            })?;
        parse_asset_content(&asset).map_err(|message| MatchError::SchemaLoad { key, message })
    }
}

/// Process-lifetime store of resolved schemas. Cloning shares the store.
#[derive(Debug, Clone, Default)]
pub struct SchemaCache {
    entries: Arc<Mutex<HashMap<SchemaKey, Arc<OnceCell<Arc<QuestionSchema>>>>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: SchemaKey) -> Arc<OnceCell<Arc<QuestionSchema>>> {
        let mut entries = self.entries.lock().await;
        entries.entry(key).or_default().clone()
    }

    pub async fn get(&self, key: SchemaKey) -> Option<Arc<QuestionSchema>> {
        let entries = self.entries.lock().await;
        entries.get(&key).and_then(|cell| cell.get().cloned())
    }

    /// Number of schemas loaded so far.
    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

pub struct SchemaResolver {
    source: Arc<dyn SchemaSource>,
    cache: SchemaCache,
}

impl SchemaResolver {
    pub fn new(source: Arc<dyn SchemaSource>, cache: SchemaCache) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &SchemaCache {
        &self.cache
    }

    /// Loads at most once per key; failed loads are not cached.
    pub async fn resolve(&self, key: SchemaKey) -> Result<Arc<QuestionSchema>, MatchError> {
        let slot = self.cache.slot(key).await;
        slot.get_or_try_init(|| async {
            let definition = self.source.load(key).await?;
            let schema = definition.into_schema();
            debug!(%key, questions = schema.len(), "loaded question schema");
            Ok::<_, MatchError>(Arc::new(schema))
        })
        .await
        .cloned()
    }

    pub async fn clear(&self) {
        self.cache.clear().await;
    }
}

/// Normalized identifier of a record: the first populated candidate field.
pub fn record_identifier<S: AsRef<str>>(
    record: &SubmissionRecord,
    candidate_fields: &[S],
) -> Option<String> {
    record
        .first_text(candidate_fields)
        .map(|v| normalize_identifier(&v))
        .filter(|v| !v.is_empty())
}

/// Records whose identifier equals `target_id`, ignoring case and surrounding
/// whitespace, in input order.
pub fn match_submissions<S: AsRef<str>>(
    records: &[SubmissionRecord],
    target_id: &str,
    candidate_fields: &[S],
) -> Vec<SubmissionRecord> {
    let target = normalize_identifier(target_id);
    if target.is_empty() {
        return Vec::new();
    }
    records
        .iter()
        .filter(|record| record_identifier(record, candidate_fields).as_deref() == Some(target.as_str()))
        .cloned()
        .collect()
}

/// Applies the per-category identifier field table to submissions.
#[derive(Debug, Clone)]
pub struct SubmissionMatcher {
    id_fields: FieldCandidates,
}

impl SubmissionMatcher {
    pub fn new(id_fields: FieldCandidates) -> Self {
        Self { id_fields }
    }

    pub fn candidate_fields(&self, category: FormCategory) -> &[String] {
        self.id_fields.for_category(category)
    }

    pub fn match_category(
        &self,
        records: &[SubmissionRecord],
        target_id: &str,
        category: FormCategory,
    ) -> Vec<SubmissionRecord> {
        match_submissions(records, target_id, self.candidate_fields(category))
    }
}

#[derive(Debug, Clone)]
pub struct MaturityClassifier {
    id_fields: Vec<String>,
    maturity_fields: Vec<String>,
    synonyms: MaturitySynonyms,
}

impl MaturityClassifier {
    pub fn new(
        id_fields: Vec<String>,
        maturity_fields: Vec<String>,
        synonyms: MaturitySynonyms,
    ) -> Self {
        Self {
            id_fields,
            maturity_fields,
            synonyms,
        }
    }

    pub fn from_config(config: &FormsConfig) -> Self {
        Self::new(
            config
                .id_fields
                .for_category(FormCategory::MainRegistry)
                .to_vec(),
            config.maturity_fields.clone(),
            config.maturity_synonyms.clone(),
        )
    }

    /// First registry record naming the tool decides; duplicates further down are ignored.
    pub fn classify(
        &self,
        master_records: &[MasterRecord],
        tool_id: &str,
    ) -> Result<MaturityLevel, MatchError> {
        let target = normalize_identifier(tool_id);
        let record = master_records
            .iter()
            .find(|r| {
                !target.is_empty()
                    && record_identifier(r, &self.id_fields).as_deref() == Some(target.as_str())
            })
            .ok_or_else(|| MatchError::ToolNotFound {
                tool_id: tool_id.to_string(),
            })?;

        let raw = record.first_text(&self.maturity_fields).unwrap_or_default();
        self.synonyms
            .level_for(&raw)
            .ok_or_else(|| MatchError::InvalidMaturity {
                tool_id: tool_id.to_string(),
                raw,
            })
    }
}

#[derive(Debug, Clone)]
pub struct ExpertiseDecoder {
    codes: DomainCodeTable,
    fields: PerMaturity<Vec<String>>,
    expected: PerMaturity<Vec<String>>,
}

impl ExpertiseDecoder {
    pub fn new(
        codes: DomainCodeTable,
        fields: PerMaturity<Vec<String>>,
        expected: PerMaturity<Vec<String>>,
    ) -> Self {
        Self {
            codes,
            fields,
            expected,
        }
    }

    pub fn from_config(config: &FormsConfig) -> Self {
        Self::new(
            config.domain_codes.clone(),
            config.expertise_fields.clone(),
            config.expected_domains.clone(),
        )
    }

    /// Count recognized expertise codes per category. Unknown codes are skipped.
    pub fn decode(
        &self,
        records: &[SubmissionRecord],
        maturity: MaturityLevel,
    ) -> BTreeMap<String, usize> {
        let fields = self.fields.get(maturity);
        let mut counts = BTreeMap::new();
        for record in records {
            let Some(text) = record.first_text(fields) else {
                continue;
            };
            for token in text.trim().to_lowercase().split_whitespace() {
                if let Some(category) = self.codes.category_for(token) {
                    *counts.entry(category.to_string()).or_default() += 1;
                }
            }
        }
        counts
    }

    /// Submitted/not-submitted for each category expected at this maturity.
    pub fn domain_statuses(
        &self,
        counts: &BTreeMap<String, usize>,
        maturity: MaturityLevel,
    ) -> Vec<DomainStatus> {
        self.expected
            .get(maturity)
            .iter()
            .map(|category| {
                let count = counts.get(category).copied().unwrap_or(0);
                DomainStatus {
                    category: category.clone(),
                    submitted: count > 0,
                    count,
                }
            })
            .collect()
    }
}
