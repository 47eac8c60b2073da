use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::consistency::ConsistencyFinding;
use crate::coordinator::{EntityOutcome, EntityReport};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dac: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub work: usize,
    pub counts: BTreeMap<String, usize>,
    pub consistency_findings: Vec<ConsistencyFinding>,
    pub fatal_error: Option<String>,
    pub ledger_persisted: bool,
    pub entities: Vec<EntityReport>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, dac: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            dac: dac.into(),
            started_at,
            finished_at: started_at,
            listed: 0,
            work: 0,
            counts: BTreeMap::new(),
            consistency_findings: Vec::new(),
            fatal_error: None,
            ledger_persisted: false,
            entities: Vec::new(),
        }
    }

    pub fn record_entities(&mut self, entities: Vec<EntityReport>) {
        self.counts.clear();
        for entity in &entities {
            *self
                .counts
                .entry(entity.outcome.as_str().to_string())
                .or_default() += 1;
        }
        self.entities = entities;
    }

    pub fn count(&self, outcome: EntityOutcome) -> usize {
        self.counts.get(outcome.as_str()).copied().unwrap_or(0)
    }

    pub fn failures(&self) -> usize {
        self.entities.iter().filter(|e| e.outcome.is_failure()).count()
    }

    /// Per-entity failures do not fail the run; fatal errors and an
    /// unpersisted ledger do.
    pub fn is_success(&self) -> bool {
        self.fatal_error.is_none() && self.ledger_persisted
    }

    pub fn outcome_of(&self, key: &str) -> Option<EntityOutcome> {
        self.entities.iter().find(|e| e.key == key).map(|e| e.outcome)
    }

    pub fn brief(&self) -> String {
        let counts = EntityOutcome::ALL
            .iter()
            .map(|o| (o, self.count(*o)))
            .filter(|(_, n)| *n > 0)
            .map(|(o, n)| format!("- {o}: {n}"))
            .collect::<Vec<_>>();
        let failed = self
            .entities
            .iter()
            .filter(|e| e.outcome != EntityOutcome::Processed && e.outcome != EntityOutcome::SkippedUnchanged)
            .map(|e| {
                format!(
                    "- `{}` {}: {}",
                    e.key,
                    e.outcome,
                    e.detail.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>();
        let findings = self
            .consistency_findings
            .iter()
            .map(|f| format!("- {}", f.describe()))
            .collect::<Vec<_>>();

        let mut brief = format!(
            "# Argo Sync Brief\n\n- Run ID: `{}`\n- DAC: {}\n- Started: {}\n- Finished: {}\n- Floats listed: {}\n- Floats needing work: {}\n- Ledger persisted: {}\n",
            self.run_id,
            self.dac,
            self.started_at,
            self.finished_at,
            self.listed,
            self.work,
            if self.ledger_persisted { "yes" } else { "no" },
        );
        if let Some(fatal) = &self.fatal_error {
            brief.push_str(&format!("- Fatal error: {fatal}\n"));
        }
        brief.push_str("\n## Outcomes\n");
        brief.push_str(&or_none(&counts));
        if !findings.is_empty() {
            brief.push_str("\n## Consistency Repairs\n");
            brief.push_str(&findings.join("\n"));
            brief.push('\n');
        }
        brief.push_str("\n## Not Processed\n");
        brief.push_str(&or_none(&failed));
        brief
    }
}

fn or_none(lines: &[String]) -> String {
    if lines.is_empty() {
        "- none\n".to_string()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

/// Write `run_summary.json` and `daily_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("daily_brief.md"), summary.brief())
        .await
        .context("writing daily_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    Ok(reports_dir)
}
