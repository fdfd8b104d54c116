use std::path::{Path, PathBuf};
use std::sync::Arc;

use toolscope_adapters::{
    FileSchemaSource, FixtureFormProvider, FormDataProvider, MaturityClassifier, SchemaCache,
    SchemaKey, SchemaResolver, SubmissionMatcher,
};
use toolscope_core::{FormCategory, FormsConfig, MaturityLevel};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn forms_config() -> FormsConfig {
    let text = std::fs::read_to_string(workspace_root().join("config/forms.yaml"))
        .expect("read forms.yaml");
    serde_yaml::from_str(&text).expect("parse forms.yaml")
}

#[tokio::test]
async fn every_configured_form_has_a_fixture_page() {
    let config = forms_config();
    let provider = FixtureFormProvider::new(workspace_root().join("fixtures/forms"));
    for source in config.forms.sources() {
        let page = provider
            .fetch(&source.form_id)
            .await
            .unwrap_or_else(|err| panic!("{}: {err}", source.form_id));
        assert_eq!(page.count, page.results.len(), "{}", source.form_id);
    }
}

#[tokio::test]
async fn fixture_registry_classifies_first_record_per_tool() {
    let config = forms_config();
    let provider = FixtureFormProvider::new(workspace_root().join("fixtures/forms"));
    let master = config.forms.master().expect("master form");
    let page = provider.fetch(&master.form_id).await.expect("registry page");

    let classifier = MaturityClassifier::from_config(&config);
    assert_eq!(
        classifier.classify(&page.results, "TS-001").unwrap(),
        MaturityLevel::Advanced
    );
    assert_eq!(
        classifier.classify(&page.results, "ts-002").unwrap(),
        MaturityLevel::Early
    );
    assert!(classifier.classify(&page.results, "TS-003").is_err());
}

#[tokio::test]
async fn fixture_survey_renders_with_file_schema() {
    let config = forms_config();
    let provider = FixtureFormProvider::new(workspace_root().join("fixtures/forms"));
    let page = provider.fetch("aUserTypeAAdvanced").await.expect("survey page");
    let matched = SubmissionMatcher::new(config.id_fields.clone()).match_category(
        &page.results,
        "TS-001",
        FormCategory::UserTypeA,
    );
    assert_eq!(matched.len(), 2);

    let resolver = SchemaResolver::new(
        Arc::new(FileSchemaSource::new(workspace_root().join("fixtures/schemas"))),
        SchemaCache::new(),
    );
    let schema = resolver
        .resolve(SchemaKey::new(FormCategory::UserTypeA, Some(MaturityLevel::Advanced)))
        .await
        .expect("schema");

    let rows = schema.display_rows(&matched[0]);
    let fields = rows.iter().map(|r| r.field.as_str()).collect::<Vec<_>>();
    assert_eq!(fields, vec!["Q_1", "Q_2", "Q_3"]);
    assert_eq!(rows[1].value, "Every week");
    assert_eq!(rows[2].value, "SMS, Web portal");

    let yaml_schema = resolver
        .resolve(SchemaKey::new(FormCategory::UserTypeB, Some(MaturityLevel::Advanced)))
        .await
        .expect("yaml schema");
    assert_eq!(yaml_schema.label("Q_2"), Some("Satisfaction (1-5)"));
}
