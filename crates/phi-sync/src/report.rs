//! Per-run report files under `reports/<run_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunKind {
    FullResync,
    Append,
    Prune,
    Ingest,
    DetailPages,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullResync => "full-resync",
            Self::Append => "append",
            Self::Prune => "prune",
            Self::Ingest => "ingest",
            Self::DetailPages => "detail-pages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
}

/// Markdown lines summarizing a run's outcome for `brief.md`.
pub trait RunDetail {
    fn brief(&self) -> Vec<String>;
}

#[derive(Debug, Clone)]
pub struct ReportWriter {
    reports_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    /// Write `run.json` and `brief.md` for one finished run; returns the run directory.
    pub async fn write<D>(&self, kind: RunKind, started_at: DateTime<Utc>, detail: &D) -> Result<PathBuf>
    where
        D: RunDetail + Serialize,
    {
        let run = RunRecord {
            run_id: Uuid::new_v4(),
            kind,
            started_at,
            finished_at: Utc::now(),
            status: "completed".to_string(),
        };
        let run_dir = self.reports_dir.join(run.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(&serde_json::json!({
            "run": run,
            "detail": detail,
        }))
        .context("serializing run report")?;
        fs::write(run_dir.join("run.json"), json)
            .await
            .context("writing run.json")?;

        let brief = format!(
            "# Listing index run: {}\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n\n## Outcome\n{}\n",
            kind.as_str(),
            run.run_id,
            run.started_at,
            run.finished_at,
            detail.brief().join("\n")
        );
        fs::write(run_dir.join("brief.md"), brief)
            .await
            .context("writing brief.md")?;

        Ok(run_dir)
    }
}

/// Markdown digest of the most recent runs, newest first.
pub fn recent_runs_markdown(reports_dir: &Path, limit: usize) -> Result<String> {
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let run_path = entry.path().join("run.json");
        let Ok(text) = std::fs::read_to_string(&run_path) else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", run_path.display()))?;
        let record: RunRecord = serde_json::from_value(value.get("run").cloned().unwrap_or_default())
            .with_context(|| format!("reading run record in {}", run_path.display()))?;
        runs.push((record, entry.path()));
    }
    runs.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Listing Index Runs".to_string(), String::new()];
    for (record, dir) in runs.into_iter().take(limit.max(1)) {
        lines.push(format!("## Run `{}` ({})", record.run_id, record.kind.as_str()));
        lines.push(format!("- started: {}", record.started_at));
        lines.push(format!("- finished: {}", record.finished_at));
        lines.push(format!("- status: {}", record.status));
        let brief = dir.join("brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Counted {
        entries: usize,
    }

    impl RunDetail for Counted {
        fn brief(&self) -> Vec<String> {
            vec![format!("- Entries: {}", self.entries)]
        }
    }

    #[tokio::test]
    async fn writes_run_files_and_lists_newest_first() {
        let dir = tempdir().expect("tempdir");
        let writer = ReportWriter::new(dir.path());

        let older = Utc::now() - chrono::Duration::minutes(5);
        let first = writer
            .write(RunKind::Prune, older, &Counted { entries: 1 })
            .await
            .expect("first report");
        let second = writer
            .write(RunKind::FullResync, Utc::now(), &Counted { entries: 7 })
            .await
            .expect("second report");

        let brief = std::fs::read_to_string(second.join("brief.md")).unwrap();
        assert!(brief.contains("full-resync"));
        assert!(brief.contains("- Entries: 7"));
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(first.join("run.json")).unwrap()).unwrap();
        assert_eq!(json["run"]["kind"], "prune");
        assert_eq!(json["detail"]["entries"], 1);

        let digest = recent_runs_markdown(dir.path(), 10).unwrap();
        let resync_at = digest.find("(full-resync)").unwrap();
        let prune_at = digest.find("(prune)").unwrap();
        assert!(resync_at < prune_at);

        let only_latest = recent_runs_markdown(dir.path(), 1).unwrap();
        assert!(!only_latest.contains("(prune)"));
    }
}
