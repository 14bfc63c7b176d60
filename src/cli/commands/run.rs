//! Run Command
//!
//! Executes one research run against a local corpus manifest:
//!
//!   cassandra run "<query>" --corpus corpus.json [--output DIR] [--provider P]
//!       [--model M] [--timeout-secs N] [--no-storage] [--dry-run]
//!
//! Ctrl-C cancels the run; stages already finished keep their results and
//! the command exits with an error.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::provider::{SharedProvider, create_provider};
use crate::cli::progress::ConsoleRenderer;
use crate::cli::ui::Output;
use crate::config::{Config, ConfigLoader};
use crate::pipeline::{
    DEFAULT_EDGES, FsContentExtractor, ManifestSearchClient, ResearchOutcome, ResearchPipeline,
    SharedFindingSink,
};
use crate::storage::{FileArtifactSink, SqliteFindingSink};
use crate::types::{CassandraError, Result};

/// Run command options (consolidated parameters)
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub query: String,
    pub corpus: PathBuf,
    pub config: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub no_storage: bool,
    pub dry_run: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl RunOptions {
    /// CLI arguments take precedence over every config source
    pub fn apply_overrides(&self, config: &mut Config) -> Result<()> {
        if let Some(provider) = &self.provider {
            config.llm.provider = provider.clone();
        }
        if let Some(model) = &self.model {
            config.llm.model = model.clone();
        }
        if let Some(timeout) = self.timeout_secs {
            config.pipeline.timeout_secs = timeout;
        }
        if let Some(output) = &self.output {
            config.output.dir = output.clone();
        }
        if self.no_storage {
            config.storage.enabled = false;
        }
        config.validate()
    }
}

pub fn run(options: RunOptions) -> Result<()> {
    if options.query.trim().is_empty() {
        return Err(CassandraError::Config("Query must not be empty".to_string()));
    }

    let mut config = ConfigLoader::load(options.config.as_deref())?;
    options.apply_overrides(&mut config)?;
    let config = Arc::new(config);

    let output = Output::new().quiet(options.quiet);
    let search = ManifestSearchClient::load(&options.corpus)?;
    if search.is_empty() {
        output.warning(&format!(
            "Corpus manifest {} lists no documents",
            options.corpus.display()
        ));
    }

    if options.dry_run {
        print_plan(&output, &options, &config, search.len());
        return Ok(());
    }

    let provider = create_provider(&config.llm)?;
    info!(provider = provider.name(), model = provider.model(), "Using LLM provider");

    let rt = Runtime::new().map_err(|e| CassandraError::Workflow(e.to_string()))?;
    let outcome = rt.block_on(execute(&options, config, provider, search, &output))?;

    print_outcome(&output, &outcome);

    if outcome.succeeded() {
        Ok(())
    } else {
        Err(CassandraError::Workflow(format!(
            "run {} finished with status {}",
            outcome.state.run_id,
            outcome.state.status()
        )))
    }
}

async fn execute(
    options: &RunOptions,
    config: Arc<Config>,
    provider: SharedProvider,
    search: ManifestSearchClient,
    output: &Output,
) -> Result<ResearchOutcome> {
    // Preflight only warns; the client's retries decide whether calls succeed
    match provider.health_check().await {
        Ok(true) => {}
        Ok(false) => output.warning(&format!(
            "Provider {} did not pass its health check",
            provider.name()
        )),
        Err(e) => output.warning(&format!("Provider health check failed: {}", e)),
    }

    let mut pipeline = ResearchPipeline::new(
        Arc::clone(&config),
        provider,
        Arc::new(search),
        Arc::new(FsContentExtractor::new()),
        Arc::new(FileArtifactSink::new(config.output.dir.clone())),
    )?;
    if let Some(sink) = open_finding_sink(&config)? {
        pipeline = pipeline.with_finding_sink(sink);
    }

    let render_handle = (!options.quiet).then(|| {
        ConsoleRenderer::new(pipeline.progress())
            .with_debug(options.verbose)
            .start_render_loop()
    });

    let cancel = CancellationToken::new();
    let signal_handle = spawn_ctrl_c_handler(cancel.clone());

    output.header(&format!("Researching: {}", options.query));
    let outcome = pipeline.run(&options.query, &cancel).await;

    signal_handle.abort();
    // No Finished event arrives when the run errors before the runner starts
    if let Some(handle) = render_handle {
        if outcome.is_ok() {
            let _ = handle.await;
        } else {
            handle.abort();
        }
    }
    outcome
}

fn open_finding_sink(config: &Config) -> Result<Option<SharedFindingSink>> {
    if !config.storage.enabled {
        return Ok(None);
    }
    let sink = SqliteFindingSink::open(&config.storage.path)?;
    Ok(Some(Arc::new(sink)))
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
        }
    })
}

fn print_plan(output: &Output, options: &RunOptions, config: &Config, documents: usize) {
    output.header("[Dry Run] Plan");
    output.field("Query", &options.query);
    output.field("Corpus", format!("{} ({} documents)", options.corpus.display(), documents));
    output.field("Provider", format!("{} / {}", config.llm.provider, config.llm.model));
    output.field("Timeout", format!("{}s", config.pipeline.timeout_secs));
    output.field("Max documents", config.pipeline.max_documents);
    output.field("Output", config.output.dir.display());
    output.field("Storage", storage_label(config));
    output.header("Stages");
    for (upstream, downstream, mandatory) in effective_edges(config) {
        let kind = if mandatory { "mandatory" } else { "optional" };
        output.field(&format!("{} → {}", upstream, downstream), kind);
    }
}

fn storage_label(config: &Config) -> String {
    if config.storage.enabled {
        config.storage.path.display().to_string()
    } else {
        "disabled".to_string()
    }
}

/// Default edges with configured overrides applied
fn effective_edges(config: &Config) -> Vec<(String, String, bool)> {
    let mut edges: Vec<(String, String, bool)> = DEFAULT_EDGES
        .iter()
        .map(|(u, d, m)| (u.to_string(), d.to_string(), *m))
        .collect();
    for dep in &config.pipeline.dependencies {
        match edges
            .iter_mut()
            .find(|(u, d, _)| *u == dep.upstream && *d == dep.stage)
        {
            Some(edge) => edge.2 = dep.mandatory,
            None => edges.push((dep.upstream.clone(), dep.stage.clone(), dep.mandatory)),
        }
    }
    edges
}

fn print_outcome(output: &Output, outcome: &ResearchOutcome) {
    output.header("Stages");
    for result in outcome.state.results_in_order() {
        let detail = format!(
            "{}/{} items, {} findings",
            result.succeeded,
            result.attempted,
            result.findings.len()
        );
        output.stage(&result.stage, result.status, &detail);
    }

    if let Some(artifact) = &outcome.artifact {
        output.header("Report");
        output.field("Recommendation", &artifact.recommendation);
        output.field("Confidence", &artifact.confidence);
        output.field(
            "Risk",
            format!("{:.1}/10 ({})", artifact.risk_score, artifact.risk_level),
        );
        if !artifact.fallback_sections.is_empty() {
            let keys: Vec<String> = artifact
                .fallback_sections
                .iter()
                .map(ToString::to_string)
                .collect();
            output.field("Fallbacks", keys.join(", "));
        }
        for location in &outcome.locations {
            output.field("Written", location);
        }
    }

    output.header("Metrics");
    for line in outcome.metrics.display().lines() {
        output.info(line);
    }

    if outcome.succeeded() {
        output.success(&format!("Run {} complete", outcome.state.run_id));
    } else {
        let failed = outcome.state.failed_stages();
        let detail = if outcome.state.timed_out() {
            "timed out".to_string()
        } else if outcome.state.is_cancelled() {
            "cancelled".to_string()
        } else {
            format!("failed stages: {}", failed.join(", "))
        };
        output.error(&format!("Run {} did not complete ({})", outcome.state.run_id, detail));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DependencyConfig;

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = Config::default();
        let options = RunOptions {
            query: "drug x".to_string(),
            provider: Some("openai".to_string()),
            model: Some("gpt-4o".to_string()),
            timeout_secs: Some(60),
            output: Some(PathBuf::from("out")),
            no_storage: true,
            ..Default::default()
        };
        options.apply_overrides(&mut config).unwrap();

        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.pipeline.timeout_secs, 60);
        assert_eq!(config.output.dir, PathBuf::from("out"));
        assert!(!config.storage.enabled);
    }

    #[test]
    fn test_effective_edges_apply_overrides() {
        let mut config = Config::default();
        config.pipeline.dependencies = vec![
            DependencyConfig {
                stage: "aggregate".to_string(),
                upstream: "mine".to_string(),
                mandatory: true,
            },
            DependencyConfig {
                stage: "write".to_string(),
                upstream: "audit".to_string(),
                mandatory: false,
            },
        ];
        let edges = effective_edges(&config);

        assert_eq!(edges.len(), DEFAULT_EDGES.len() + 1);
        assert!(edges.contains(&("mine".to_string(), "aggregate".to_string(), true)));
        assert!(edges.contains(&("audit".to_string(), "write".to_string(), false)));
    }

    #[test]
    fn test_dry_run_needs_no_provider() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus.json");
        std::fs::write(&corpus, r#"{"documents": []}"#).unwrap();

        let options = RunOptions {
            query: "drug x".to_string(),
            corpus,
            dry_run: true,
            quiet: true,
            provider: Some("openai".to_string()),
            ..Default::default()
        };
        run(options).unwrap();
    }

    #[test]
    fn test_empty_query_rejected() {
        let result = run(RunOptions::default());
        assert!(matches!(result, Err(CassandraError::Config(_))));
    }
}
