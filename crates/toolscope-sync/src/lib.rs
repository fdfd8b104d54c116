//! Search orchestration: classify a tool, fan out to its form sources and build the status view.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use toolscope_adapters::{
    AssetSchemaSource, ExpertiseDecoder, FileSchemaSource, FixtureFormProvider, FormDataProvider,
    MatchError, MaturityClassifier, SchemaCache, SchemaKey, SchemaResolver, SchemaSource,
    SubmissionMatcher,
};
use toolscope_core::{
    AggregateStatus, FormCategory, FormSource, FormTable, FormsConfig, MatchResult, MaturityLevel,
    QuestionSchema, RoleStatus, SearchReport, SubmissionRecord,
};
use toolscope_provider::{FormApiClient, HttpClientConfig};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "toolscope-sync";

/// Highest `forms.yaml` layout this build understands.
pub const SUPPORTED_FORMS_VERSION: u32 = 3;

const BUNDLED_FORMS_YAML: &str = include_str!("../../../config/forms.yaml");

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub forms_config: Option<PathBuf>,
    pub schema_dir: Option<PathBuf>,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_deadline_secs: u64,
    pub bind_addr: String,
}

impl DashboardConfig {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_base_url: non_empty("TOOLSCOPE_API_URL")
                .unwrap_or_else(|| "https://kf.kobotoolbox.org".to_string()),
            api_token: non_empty("TOOLSCOPE_API_TOKEN"),
            forms_config: non_empty("TOOLSCOPE_FORMS_CONFIG").map(PathBuf::from).or_else(|| {
                let default = PathBuf::from("./config/forms.yaml");
                default.exists().then_some(default)
            }),
            schema_dir: non_empty("TOOLSCOPE_SCHEMA_DIR").map(PathBuf::from),
            fixtures_dir: non_empty("TOOLSCOPE_FIXTURES_DIR").map(PathBuf::from),
            user_agent: non_empty("TOOLSCOPE_USER_AGENT")
                .unwrap_or_else(|| "toolscope/0.1".to_string()),
            http_timeout_secs: non_empty("TOOLSCOPE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            source_deadline_secs: non_empty("TOOLSCOPE_SOURCE_DEADLINE_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            bind_addr: non_empty("TOOLSCOPE_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            api_token: self.api_token.clone(),
            ..Default::default()
        }
    }

    pub fn source_deadline(&self) -> Duration {
        Duration::from_secs(self.source_deadline_secs.max(1))
    }

    pub fn load_forms(&self) -> Result<FormsConfig> {
        match &self.forms_config {
            Some(path) => load_forms_config(path),
            None => bundled_forms_config(),
        }
    }
}

pub fn parse_forms_config(text: &str) -> Result<FormsConfig> {
    let config: FormsConfig = serde_yaml::from_str(text).context("parsing forms config")?;
    validate_forms_config(&config)?;
    Ok(config)
}

pub fn load_forms_config(path: &Path) -> Result<FormsConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_forms_config(&text).with_context(|| format!("loading {}", path.display()))
}

pub fn bundled_forms_config() -> Result<FormsConfig> {
    parse_forms_config(BUNDLED_FORMS_YAML).context("loading bundled forms config")
}

pub fn validate_forms_config(config: &FormsConfig) -> Result<()> {
    anyhow::ensure!(
        (1..=SUPPORTED_FORMS_VERSION).contains(&config.version),
        "forms config version {} is not supported (max {})",
        config.version,
        SUPPORTED_FORMS_VERSION
    );
    anyhow::ensure!(
        config.forms.master().is_some(),
        "no main_registry form configured"
    );
    anyhow::ensure!(
        !config.maturity_fields.is_empty(),
        "maturity_fields must name at least one field"
    );
    for category in [FormCategory::MainRegistry]
        .into_iter()
        .chain(FormCategory::SEARCH_SOURCES)
    {
        anyhow::ensure!(
            !config.id_fields.for_category(category).is_empty(),
            "id_fields has no candidates for {category}"
        );
    }
    for maturity in MaturityLevel::ALL {
        let missing = config.forms.missing_for(maturity);
        anyhow::ensure!(
            missing.is_empty(),
            "no {maturity} form configured for {}",
            missing
                .iter()
                .map(FormCategory::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        anyhow::ensure!(
            !config.maturity_synonyms.get(maturity).is_empty(),
            "maturity_synonyms has no entries for {maturity}"
        );
    }

    anyhow::ensure!(!config.domain_codes.is_empty(), "domain_codes is empty");
    let labels = config.domain_codes.labels().collect::<BTreeSet<_>>();
    for expected in config
        .expected_domains
        .advanced
        .iter()
        .chain(&config.expected_domains.early)
    {
        anyhow::ensure!(
            labels.contains(expected.as_str()),
            "expected domain {expected:?} has no code in domain_codes"
        );
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no main registry form is configured")]
    MissingMasterForm,
    #[error("registry unavailable: {0}")]
    Registry(#[source] MatchError),
    #[error("{0}")]
    Classification(#[source] MatchError),
    #[error("search for {tool_id:?} was superseded by a newer search")]
    Superseded { tool_id: String },
}

impl SearchError {
    pub fn failure_kind(&self) -> SearchFailureKind {
        match self {
            SearchError::MissingMasterForm => SearchFailureKind::Configuration,
            SearchError::Registry(_) => SearchFailureKind::RegistryUnavailable,
            SearchError::Classification(MatchError::ToolNotFound { .. }) => {
                SearchFailureKind::ToolNotFound
            }
            SearchError::Classification(_) => SearchFailureKind::InvalidMaturity,
            SearchError::Superseded { .. } => SearchFailureKind::Superseded,
        }
    }
}

/// Why a search produced no report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchFailureKind {
    ToolNotFound,
    InvalidMaturity,
    RegistryUnavailable,
    Configuration,
    Superseded,
}

/// Await every future and keep one outcome per input, in input order. Never
/// short-circuits on a failure.
pub async fn settle_all<I, F, T, E>(tasks: I) -> Vec<Result<T, E>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    join_all(tasks).await
}

/// Fans a search out to independent form sources.
pub struct Aggregator {
    provider: Arc<dyn FormDataProvider>,
    schemas: Arc<SchemaResolver>,
    matcher: SubmissionMatcher,
    source_deadline: Duration,
}

impl Aggregator {
    pub fn new(
        provider: Arc<dyn FormDataProvider>,
        schemas: Arc<SchemaResolver>,
        matcher: SubmissionMatcher,
        source_deadline: Duration,
    ) -> Self {
        Self {
            provider,
            schemas,
            matcher,
            source_deadline,
        }
    }

    /// One result per source, in `sources` order. Source failures are captured in
    /// their result rather than returned.
    pub async fn aggregate(
        &self,
        tool_id: &str,
        maturity: MaturityLevel,
        sources: &[FormSource],
    ) -> Vec<MatchResult> {
        let tasks = sources.iter().map(|source| async move {
            match tokio::time::timeout(
                self.source_deadline,
                self.collect_source(tool_id, maturity, source),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(MatchError::SourceTimeout {
                    form_id: source.form_id.clone(),
                    after: self.source_deadline,
                }),
            }
        });

        settle_all(tasks)
            .await
            .into_iter()
            .zip(sources)
            .map(|(outcome, source)| match outcome {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        category = %source.category,
                        form_id = %source.form_id,
                        error = %err,
                        "form source failed; continuing with remaining sources"
                    );
                    MatchResult::failed(source, err.to_failure())
                }
            })
            .collect()
    }

    async fn collect_source(
        &self,
        tool_id: &str,
        maturity: MaturityLevel,
        source: &FormSource,
    ) -> Result<MatchResult, MatchError> {
        let page = self.provider.fetch(&source.form_id).await?;
        let matched_records = self
            .matcher
            .match_category(&page.results, tool_id, source.category);

        let mut schema = Arc::new(QuestionSchema::empty());
        let mut error = None;
        if source.category.uses_question_schema() {
            let key = SchemaKey::new(source.category, source.maturity.or(Some(maturity)));
            match self.schemas.resolve(key).await {
                Ok(resolved) => schema = resolved,
                Err(err) => {
                    warn!(%key, error = %err, "question schema unavailable");
                    error = Some(err.to_failure());
                }
            }
        }

        debug!(
            category = %source.category,
            form_id = %source.form_id,
            fetched = page.results.len(),
            matched = matched_records.len(),
            "form source settled"
        );

        Ok(MatchResult {
            category: source.category,
            maturity: source.maturity,
            form_id: source.form_id.clone(),
            matched_records,
            schema,
            error,
        })
    }
}

pub struct SearchService {
    forms: FormTable,
    provider: Arc<dyn FormDataProvider>,
    schemas: Arc<SchemaResolver>,
    classifier: MaturityClassifier,
    decoder: ExpertiseDecoder,
    aggregator: Aggregator,
    source_deadline: Duration,
}

impl SearchService {
    pub fn new(
        config: &FormsConfig,
        provider: Arc<dyn FormDataProvider>,
        schemas: Arc<SchemaResolver>,
        source_deadline: Duration,
    ) -> Self {
        let aggregator = Aggregator::new(
            provider.clone(),
            schemas.clone(),
            SubmissionMatcher::new(config.id_fields.clone()),
            source_deadline,
        );
        Self {
            forms: config.forms.clone(),
            provider,
            schemas,
            classifier: MaturityClassifier::from_config(config),
            decoder: ExpertiseDecoder::from_config(config),
            aggregator,
            source_deadline,
        }
    }

    pub fn forms(&self) -> &FormTable {
        &self.forms
    }

    pub fn schemas(&self) -> &SchemaResolver {
        &self.schemas
    }

    /// Fetch the registry and classify the tool. Any failure here ends the search.
    pub async fn classify(&self, tool_id: &str) -> Result<MaturityLevel, SearchError> {
        let master = self.forms.master().ok_or(SearchError::MissingMasterForm)?;
        let page = tokio::time::timeout(self.source_deadline, self.provider.fetch(&master.form_id))
            .await
            .map_err(|_| {
                SearchError::Registry(MatchError::SourceTimeout {
                    form_id: master.form_id.clone(),
                    after: self.source_deadline,
                })
            })?
            .map_err(SearchError::Registry)?;
        self.classifier
            .classify(&page.results, tool_id)
            .map_err(SearchError::Classification)
    }

    pub async fn search(&self, tool_id: &str) -> Result<SearchReport, SearchError> {
        let search_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("search", %search_id, tool_id);

        async move {
            let maturity = self.classify(tool_id).await?;
            let sources = self.forms.search_sources(maturity);
            let results = self.aggregator.aggregate(tool_id, maturity, &sources).await;
            let status = self.build_status(&results, maturity);
            let failed = results.iter().filter(|r| !r.is_ok()).count();
            info!(%maturity, sources = results.len(), failed, "search complete");

            Ok(SearchReport {
                search_id,
                tool_id: tool_id.trim().to_string(),
                maturity,
                started_at,
                finished_at: Utc::now(),
                status,
                results,
            })
        }
        .instrument(span)
        .await
    }

    pub fn build_status(&self, results: &[MatchResult], maturity: MaturityLevel) -> AggregateStatus {
        let innovator_statuses = results
            .iter()
            .filter(|r| r.category.is_innovator_role())
            .map(|r| RoleStatus {
                role: r.category,
                submitted: r.is_ok() && r.count() > 0,
                count: r.count(),
                error: r.error.as_ref().map(|e| e.message.clone()),
            })
            .collect();

        let expert_records = results
            .iter()
            .filter(|r| r.category == FormCategory::DomainExpert)
            .flat_map(|r| r.matched_records.iter().cloned())
            .collect::<Vec<SubmissionRecord>>();
        let counts = self.decoder.decode(&expert_records, maturity);

        AggregateStatus {
            innovator_statuses,
            domain_expert_statuses: self.decoder.domain_statuses(&counts, maturity),
        }
    }
}

/// The latest search as seen by the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SearchOutcome {
    Completed { report: SearchReport },
    Failed {
        tool_id: String,
        kind: SearchFailureKind,
        message: String,
    },
}

/// Holds the most recent search outcome. A search that finishes after a newer one
/// started is discarded instead of published.
pub struct SearchSession {
    service: Arc<SearchService>,
    generation: AtomicU64,
    latest: RwLock<Option<Arc<SearchOutcome>>>,
}

impl SearchSession {
    pub fn new(service: Arc<SearchService>) -> Self {
        Self {
            service,
            generation: AtomicU64::new(0),
            latest: RwLock::new(None),
        }
    }

    pub fn service(&self) -> &Arc<SearchService> {
        &self.service
    }

    pub async fn run(&self, tool_id: &str) -> Result<Arc<SearchOutcome>, SearchError> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = match self.service.search(tool_id).await {
            Ok(report) => SearchOutcome::Completed { report },
            Err(err) => SearchOutcome::Failed {
                tool_id: tool_id.to_string(),
                kind: err.failure_kind(),
                message: err.to_string(),
            },
        };

        let mut latest = self.latest.write().await;
        if self.generation.load(Ordering::SeqCst) != ticket {
            warn!(tool_id, ticket, "discarding superseded search result");
            return Err(SearchError::Superseded {
                tool_id: tool_id.to_string(),
            });
        }
        let outcome = Arc::new(outcome);
        *latest = Some(outcome.clone());
        Ok(outcome)
    }

    pub async fn latest(&self) -> Option<Arc<SearchOutcome>> {
        self.latest.read().await.clone()
    }
}

pub fn build_search_service(config: &DashboardConfig) -> Result<SearchService> {
    let forms = config.load_forms()?;

    let provider: Arc<dyn FormDataProvider>;
    let schema_source: Arc<dyn SchemaSource>;
    match &config.fixtures_dir {
        Some(dir) => {
            let schema_dir = config
                .schema_dir
                .clone()
                .unwrap_or_else(|| dir.join("schemas"));
            provider = Arc::new(FixtureFormProvider::new(dir.join("forms")));
            schema_source = Arc::new(FileSchemaSource::new(schema_dir));
        }
        None => {
            let client = Arc::new(
                FormApiClient::new(config.api_base_url.clone(), &config.http_client_config())
                    .context("building form API client")?,
            );
            schema_source = match &config.schema_dir {
                Some(dir) => Arc::new(FileSchemaSource::new(dir.clone())),
                None => Arc::new(AssetSchemaSource::new(client.clone(), forms.forms.clone())),
            };
            provider = client;
        }
    }

    let schemas = Arc::new(SchemaResolver::new(schema_source, SchemaCache::new()));
    Ok(SearchService::new(
        &forms,
        provider,
        schemas,
        config.source_deadline(),
    ))
}

/// Plain-text status summary of a finished search.
pub fn render_status_summary(report: &SearchReport) -> String {
    let mut lines = vec![
        format!("Tool {} ({} maturity)", report.tool_id, report.maturity),
        String::new(),
        "Innovator forms:".to_string(),
    ];
    for status in &report.status.innovator_statuses {
        let state = match (&status.error, status.submitted) {
            (Some(message), _) => format!("error: {message}"),
            (None, true) => format!("submitted ({})", status.count),
            (None, false) => "not submitted".to_string(),
        };
        lines.push(format!("- {}: {}", status.role.display_name(), state));
    }

    lines.push(String::new());
    lines.push("Domain experts:".to_string());
    for status in &report.status.domain_expert_statuses {
        let state = if status.submitted {
            format!("submitted ({})", status.count)
        } else {
            "not submitted".to_string()
        };
        lines.push(format!("- {}: {}", status.category, state));
    }

    lines.push(String::new());
    lines.push("Forms:".to_string());
    for result in &report.results {
        let state = match &result.error {
            Some(failure) => format!("{} matched, error: {}", result.count(), failure),
            None => format!("{} matched", result.count()),
        };
        lines.push(format!(
            "- {} [{}]: {}",
            result.category.display_name(),
            result.form_id,
            state
        ));
    }
    lines.join("\n")
}
