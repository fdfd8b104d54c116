//! Core domain model, field-name normalization and configuration tables for toolscope.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "toolscope-core";

/// Maturity classification of a tool. Always derived from a master record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaturityLevel {
    Advanced,
    Early,
}

impl MaturityLevel {
    pub const ALL: [MaturityLevel; 2] = [MaturityLevel::Advanced, MaturityLevel::Early];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaturityLevel::Advanced => "advanced",
            MaturityLevel::Early => "early",
        }
    }
}

impl fmt::Display for MaturityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormCategory {
    MainRegistry,
    UserTypeA,
    UserTypeB,
    InnovatorLeadership,
    InnovatorTechnical,
    InnovatorProjectManager,
    DomainExpert,
}

impl FormCategory {
    pub const INNOVATOR_ROLES: [FormCategory; 3] = [
        FormCategory::InnovatorLeadership,
        FormCategory::InnovatorTechnical,
        FormCategory::InnovatorProjectManager,
    ];

    /// Every per-maturity form queried by a search, in display order.
    pub const SEARCH_SOURCES: [FormCategory; 6] = [
        FormCategory::InnovatorLeadership,
        FormCategory::InnovatorTechnical,
        FormCategory::InnovatorProjectManager,
        FormCategory::UserTypeA,
        FormCategory::UserTypeB,
        FormCategory::DomainExpert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormCategory::MainRegistry => "main_registry",
            FormCategory::UserTypeA => "user_type_a",
            FormCategory::UserTypeB => "user_type_b",
            FormCategory::InnovatorLeadership => "innovator_leadership",
            FormCategory::InnovatorTechnical => "innovator_technical",
            FormCategory::InnovatorProjectManager => "innovator_project_manager",
            FormCategory::DomainExpert => "domain_expert",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            FormCategory::MainRegistry => "Main registry",
            FormCategory::UserTypeA => "User survey (type A)",
            FormCategory::UserTypeB => "User survey (type B)",
            FormCategory::InnovatorLeadership => "Leadership",
            FormCategory::InnovatorTechnical => "Technical",
            FormCategory::InnovatorProjectManager => "Project manager",
            FormCategory::DomainExpert => "Domain expert",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let needle = input.trim();
        [FormCategory::MainRegistry]
            .into_iter()
            .chain(FormCategory::SEARCH_SOURCES)
            .find(|c| c.as_str().eq_ignore_ascii_case(needle))
    }

    pub fn is_innovator_role(&self) -> bool {
        FormCategory::INNOVATOR_ROLES.contains(self)
    }

    /// Survey forms are displayed through their question schema.
    pub fn uses_question_schema(&self) -> bool {
        matches!(self, FormCategory::UserTypeA | FormCategory::UserTypeB)
    }
}

impl fmt::Display for FormCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip any `group/` prefixes: `group_toolinfo/Q_1` becomes `Q_1`.
pub fn bare_field_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Submission metadata added by the collection platform rather than the form author.
pub fn is_system_field(name: &str) -> bool {
    name.starts_with('_') || name.starts_with("meta/") || name.starts_with("formhub/")
}

/// Canonical comparison form of a tool identifier.
pub fn normalize_identifier(value: &str) -> String {
    value.trim().to_lowercase()
}

fn value_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn value_display(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One submission row from a form source. Keys may carry group prefixes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionRecord(JsonMap<String, JsonValue>);

/// A row of the main registry form.
pub type MasterRecord = SubmissionRecord;

impl SubmissionRecord {
    pub fn new(fields: JsonMap<String, JsonValue>) -> Self {
        Self(fields)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<JsonValue>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn fields(&self) -> &JsonMap<String, JsonValue> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Exact key first, then the first key whose bare name matches.
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        if let Some(value) = self.0.get(name) {
            return Some(value);
        }
        let bare = bare_field_name(name);
        self.0
            .iter()
            .find(|(key, _)| bare_field_name(key) == bare)
            .map(|(_, value)| value)
    }

    /// Raw scalar text of a field; blank values count as absent.
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(value_text)
    }

    /// First candidate field holding a non-blank value.
    pub fn first_text<S: AsRef<str>>(&self, candidates: &[S]) -> Option<String> {
        candidates.iter().find_map(|c| self.text(c.as_ref()))
    }
}

/// One page of the form data provider's listing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FormPage {
    #[serde(default)]
    pub results: Vec<SubmissionRecord>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub question_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
}

impl Question {
    pub fn is_select_one(&self) -> bool {
        self.question_type.starts_with("select_one")
    }

    pub fn is_select_multiple(&self) -> bool {
        self.question_type.starts_with("select_multiple")
    }

    pub fn choice_label(&self, value: &str) -> Option<&str> {
        self.choices
            .iter()
            .find(|c| c.value == value)
            .map(|c| c.label.as_str())
    }

    /// Resolve choice values to labels; unresolvable values pass through unchanged.
    pub fn display_value(&self, raw: &str) -> String {
        if self.is_select_multiple() {
            let tokens = raw.split_whitespace().collect::<Vec<_>>();
            if !tokens.iter().any(|t| self.choice_label(t).is_some()) {
                return raw.to_string();
            }
            return tokens
                .iter()
                .map(|t| self.choice_label(t).unwrap_or(*t))
                .collect::<Vec<_>>()
                .join(", ");
        }
        if self.is_select_one() {
            if let Some(label) = self.choice_label(raw.trim()) {
                return label.to_string();
            }
        }
        raw.to_string()
    }
}

/// A labeled answer ready for presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRow {
    pub field: String,
    pub label: String,
    pub value: String,
}

/// Questions of one form category keyed by bare field name. Immutable once built.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct QuestionSchema {
    questions: Vec<Question>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl QuestionSchema {
    /// Question names are reduced to bare names; the first definition of a name wins.
    pub fn new(questions: impl IntoIterator<Item = Question>) -> Self {
        let mut out = Vec::new();
        let mut index = HashMap::new();
        for mut question in questions {
            let bare = bare_field_name(&question.name).to_string();
            if bare.is_empty() || index.contains_key(&bare) {
                continue;
            }
            question.name = bare.clone();
            index.insert(bare, out.len());
            out.push(question);
        }
        Self {
            questions: out,
            index,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn question(&self, field_name: &str) -> Option<&Question> {
        self.index
            .get(bare_field_name(field_name))
            .map(|&i| &self.questions[i])
    }

    pub fn label(&self, field_name: &str) -> Option<&str> {
        self.question(field_name).map(|q| q.label.as_str())
    }

    pub fn display_value(&self, field_name: &str, raw: &str) -> String {
        match self.question(field_name) {
            Some(question) => question.display_value(raw),
            None => raw.to_string(),
        }
    }

    /// Schema-ordered rows followed by fields the schema does not know, each
    /// bare field name exactly once. System metadata is omitted.
    pub fn display_rows(&self, record: &SubmissionRecord) -> Vec<DisplayRow> {
        let mut seen = HashSet::new();
        let mut known: Vec<Option<DisplayRow>> = vec![None; self.questions.len()];
        let mut unknown = Vec::new();

        for (key, value) in record.fields() {
            if is_system_field(key) {
                continue;
            }
            let bare = bare_field_name(key);
            if !seen.insert(bare.to_string()) {
                continue;
            }
            let raw = value_display(value);
            match self.index.get(bare) {
                Some(&i) => {
                    let question = &self.questions[i];
                    known[i] = Some(DisplayRow {
                        field: bare.to_string(),
                        label: question.label.clone(),
                        value: question.display_value(&raw),
                    });
                }
                None => unknown.push(DisplayRow {
                    field: bare.to_string(),
                    label: bare.to_string(),
                    value: raw,
                }),
            }
        }

        known.into_iter().flatten().chain(unknown).collect()
    }
}

/// Values keyed by maturity level.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerMaturity<T> {
    pub advanced: T,
    pub early: T,
}

impl<T> PerMaturity<T> {
    pub fn get(&self, maturity: MaturityLevel) -> &T {
        match maturity {
            MaturityLevel::Advanced => &self.advanced,
            MaturityLevel::Early => &self.early,
        }
    }
}

/// Synonyms accepted for each maturity level in the registry's maturity field.
pub type MaturitySynonyms = PerMaturity<Vec<String>>;

impl PerMaturity<Vec<String>> {
    pub fn level_for(&self, raw: &str) -> Option<MaturityLevel> {
        let needle = raw.trim().to_lowercase();
        MaturityLevel::ALL.into_iter().find(|level| {
            self.get(*level)
                .iter()
                .any(|synonym| synonym.trim().to_lowercase() == needle)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormSource {
    pub category: FormCategory,
    #[serde(default)]
    pub maturity: Option<MaturityLevel>,
    pub form_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormTable(Vec<FormSource>);

impl FormTable {
    pub fn new(sources: Vec<FormSource>) -> Self {
        Self(sources)
    }

    pub fn sources(&self) -> &[FormSource] {
        &self.0
    }

    /// Exact maturity entry first, then a maturity-independent entry.
    pub fn lookup(
        &self,
        category: FormCategory,
        maturity: Option<MaturityLevel>,
    ) -> Option<&FormSource> {
        self.0
            .iter()
            .find(|s| s.category == category && s.maturity == maturity)
            .or_else(|| {
                self.0
                    .iter()
                    .find(|s| s.category == category && s.maturity.is_none())
            })
    }

    pub fn master(&self) -> Option<&FormSource> {
        self.lookup(FormCategory::MainRegistry, None)
    }

    pub fn search_sources(&self, maturity: MaturityLevel) -> Vec<FormSource> {
        FormCategory::SEARCH_SOURCES
            .iter()
            .filter_map(|c| self.lookup(*c, Some(maturity)).cloned())
            .collect()
    }

    pub fn missing_for(&self, maturity: MaturityLevel) -> Vec<FormCategory> {
        FormCategory::SEARCH_SOURCES
            .into_iter()
            .filter(|c| self.lookup(*c, Some(maturity)).is_none())
            .collect()
    }
}

/// Ordered identifier field names to probe, per form category.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldCandidates(BTreeMap<FormCategory, Vec<String>>);

impl FieldCandidates {
    pub fn new(table: BTreeMap<FormCategory, Vec<String>>) -> Self {
        Self(table)
    }

    pub fn for_category(&self, category: FormCategory) -> &[String] {
        self.0.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Domain-expertise code to category label. Codes are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct DomainCodeTable(BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for DomainCodeTable {
    fn from(table: BTreeMap<String, String>) -> Self {
        Self::new(table)
    }
}

impl From<DomainCodeTable> for BTreeMap<String, String> {
    fn from(table: DomainCodeTable) -> Self {
        table.0
    }
}

impl DomainCodeTable {
    pub fn new(table: BTreeMap<String, String>) -> Self {
        Self(
            table
                .into_iter()
                .map(|(code, label)| (code.trim().to_lowercase(), label))
                .collect(),
        )
    }

    pub fn category_for(&self, token: &str) -> Option<&str> {
        self.0.get(token).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Versioned configuration tables consumed by the matching layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormsConfig {
    pub version: u32,
    pub forms: FormTable,
    pub id_fields: FieldCandidates,
    pub maturity_fields: Vec<String>,
    pub maturity_synonyms: MaturitySynonyms,
    pub domain_codes: DomainCodeTable,
    pub expected_domains: PerMaturity<Vec<String>>,
    pub expertise_fields: PerMaturity<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Timeout,
    SchemaLoad,
}

/// A per-source failure captured inside its `MatchResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub category: FormCategory,
    pub maturity: Option<MaturityLevel>,
    pub form_id: String,
    pub matched_records: Vec<SubmissionRecord>,
    #[serde(skip)]
    pub schema: Arc<QuestionSchema>,
    pub error: Option<SourceFailure>,
}

impl MatchResult {
    pub fn failed(source: &FormSource, failure: SourceFailure) -> Self {
        Self {
            category: source.category,
            maturity: source.maturity,
            form_id: source.form_id.clone(),
            matched_records: Vec::new(),
            schema: Arc::new(QuestionSchema::empty()),
            error: Some(failure),
        }
    }

    pub fn count(&self) -> usize {
        self.matched_records.len()
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn display_rows(&self) -> Vec<Vec<DisplayRow>> {
        self.matched_records
            .iter()
            .map(|r| self.schema.display_rows(r))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleStatus {
    pub role: FormCategory,
    pub submitted: bool,
    pub count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub category: String,
    pub submitted: bool,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub innovator_statuses: Vec<RoleStatus>,
    pub domain_expert_statuses: Vec<DomainStatus>,
}

/// Everything one search produced.
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub search_id: Uuid,
    pub tool_id: String,
    pub maturity: MaturityLevel,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: AggregateStatus,
    pub results: Vec<MatchResult>,
}

impl SearchReport {
    pub fn result_for(&self, category: FormCategory) -> Option<&MatchResult> {
        self.results.iter().find(|r| r.category == category)
    }
}
