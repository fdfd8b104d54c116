use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use toolscope_core::FormCategory;
use toolscope_sync::{build_search_service, render_status_summary, DashboardConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "toolscope_core=info,toolscope_provider=info,\
toolscope_adapters=info,toolscope_sync=info,toolscope_web=info,warn";

#[derive(Debug, Parser)]
#[command(name = "toolscope")]
#[command(about = "Tool submission coordinator dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Classify a tool and report submission status across its forms.
    Search {
        tool_id: String,
        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
        /// Read form pages and schemas from a fixture directory instead of the API.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// List the configured form sources.
    Forms {
        /// Only list forms of this category, e.g. `domain_expert`.
        #[arg(long, value_parser = parse_category)]
        category: Option<FormCategory>,
    },
    /// Run the JSON API.
    Serve,
}

fn parse_category(input: &str) -> Result<FormCategory, String> {
    FormCategory::parse(input).ok_or_else(|| format!("unknown form category {input:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = DashboardConfig::from_env();

    match cli.command.unwrap_or(Commands::Forms { category: None }) {
        Commands::Search {
            tool_id,
            json,
            fixtures,
        } => {
            if fixtures.is_some() {
                config.fixtures_dir = fixtures;
            }
            let service = build_search_service(&config)?;
            let report = service.search(&tool_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_status_summary(&report));
            }
        }
        Commands::Forms { category } => {
            let forms = config.load_forms()?;
            println!("forms config version {}", forms.version);
            for source in forms
                .forms
                .sources()
                .iter()
                .filter(|s| category.map_or(true, |c| s.category == c))
            {
                let maturity = source
                    .maturity
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "any".to_string());
                println!(
                    "{:<26} {:<9} {}",
                    source.category.as_str(),
                    maturity,
                    source.form_id
                );
            }
        }
        Commands::Serve => {
            toolscope_web::serve_from_env().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_filter_covers_every_crate() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        for krate in [
            "toolscope_core",
            "toolscope_provider",
            "toolscope_adapters",
            "toolscope_sync",
            "toolscope_web",
        ] {
            assert!(
                DEFAULT_LOG_FILTER.contains(&format!("{krate}=info")),
                "{krate} missing from default filter"
            );
        }
    }

    #[test]
    fn forms_category_flag_parses_known_categories() {
        let cli = Cli::try_parse_from(["toolscope", "forms", "--category", "Domain_Expert"])
            .expect("parse");
        match cli.command {
            Some(Commands::Forms { category }) => {
                assert_eq!(category, Some(FormCategory::DomainExpert))
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["toolscope", "forms", "--category", "nope"]).is_err());
    }
}
