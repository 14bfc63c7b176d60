//! File-based artifact sink: `<slug>_<timestamp>.md` plus a `.json` twin

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::pipeline::sources::ArtifactSink;
use crate::synthesis::ReportArtifact;
use crate::types::{Result, ResultExt};

const MAX_SLUG_CHARS: usize = 60;

/// Lowercase ASCII slug; runs of other characters collapse to one `-`
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if slug.len() >= MAX_SLUG_CHARS {
                break;
            }
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "report".to_string()
    } else {
        slug.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct FileArtifactSink {
    dir: PathBuf,
}

impl FileArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_stem(artifact: &ReportArtifact) -> String {
        format!(
            "{}_{}",
            slugify(&artifact.query),
            artifact.generated_at.format("%Y%m%d_%H%M%S")
        )
    }
}

#[async_trait]
impl ArtifactSink for FileArtifactSink {
    async fn publish(&self, artifact: &ReportArtifact) -> Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stem = Self::file_stem(artifact);

        let markdown_path = self.dir.join(format!("{}.md", stem));
        tokio::fs::write(&markdown_path, &artifact.markdown).await?;

        let json_path = self.dir.join(format!("{}.json", stem));
        let json = serde_json::to_string_pretty(artifact)
            .with_context("Failed to serialize report artifact")?;
        tokio::fs::write(&json_path, json).await?;

        info!(
            markdown = %markdown_path.display(),
            json = %json_path.display(),
            "Wrote report"
        );
        Ok(vec![
            markdown_path.display().to_string(),
            json_path.display().to_string(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::context::ContextBudgeter;
    use crate::pipeline::aggregate::AggregateReport;
    use crate::scoring::{ConfidenceScore, RiskInputs, RiskScorer};
    use crate::synthesis::Template;
    use crate::types::RunId;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Drug X (phase II) -- efficacy?"), "drug-x-phase-ii-efficacy");
        assert_eq!(slugify("???"), "report");
        assert_eq!(slugify(&"a".repeat(100)).len(), MAX_SLUG_CHARS);
    }

    #[tokio::test]
    async fn test_publish_writes_markdown_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileArtifactSink::new(dir.path().join("reports"));
        let report = AggregateReport {
            confidence: ConfidenceScore::new(1, 2),
            risk: RiskScorer::default().assess(RiskInputs::default()),
            context: ContextBudgeter::new(100, 2.0).build(&[]),
            failures: Vec::new(),
            stages: Vec::new(),
            total_findings: 0,
        };
        let artifact = ReportArtifact::assemble(
            &Template::parse("# {{title}}\n{{confidence}}").unwrap(),
            &RunId::new("run-a"),
            "Drug X",
            &report,
            Vec::new(),
            None,
        );

        let locations = sink.publish(&artifact).await.unwrap();
        assert_eq!(locations.len(), 2);
        assert!(locations[0].ends_with(".md"));
        assert!(locations[0].contains("drug-x_"));

        let markdown = std::fs::read_to_string(&locations[0]).unwrap();
        assert_eq!(markdown, "# Cassandra Risk Report: Drug X\n5.0/10");
        let json: ReportArtifact =
            serde_json::from_str(&std::fs::read_to_string(&locations[1]).unwrap()).unwrap();
        assert_eq!(json, artifact);
    }
}
