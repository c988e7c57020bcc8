//! Summary reporter.
//!
//! Every phase records its outcome here, success or not; the rendered
//! report is the single contract surfaced to the operator regardless of
//! how deep into the pipeline a failure occurred.

use chrono::{DateTime, Utc};

/// Outcome of one pipeline phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The phase mutated host state.
    Changed(String),
    /// The phase completed without mutating anything (probes, checks).
    Completed(String),
    /// The phase verified state and found nothing to do.
    Unchanged,
    /// The phase did not run (gated off or aborted earlier).
    Skipped(String),
    /// The phase failed; the run may still degrade and continue.
    Failed(String),
}

impl PhaseOutcome {
    fn label(&self) -> &'static str {
        match self {
            PhaseOutcome::Changed(_) => "changed",
            PhaseOutcome::Completed(_) => "ok",
            PhaseOutcome::Unchanged => "unchanged",
            PhaseOutcome::Skipped(_) => "skipped",
            PhaseOutcome::Failed(_) => "FAILED",
        }
    }

    fn detail(&self) -> &str {
        match self {
            PhaseOutcome::Changed(d)
            | PhaseOutcome::Completed(d)
            | PhaseOutcome::Skipped(d)
            | PhaseOutcome::Failed(d) => d,
            PhaseOutcome::Unchanged => "",
        }
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Some shares failed validation but the node deployed degraded.
    PartialSuccess,
    Failure,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial success",
            RunStatus::Failure => "failure",
        }
    }
}

/// Accumulated end-of-run report.
#[derive(Debug, Clone)]
pub struct RunReport {
    started_at: DateTime<Utc>,
    phases: Vec<(String, PhaseOutcome)>,
    degraded: bool,
    fatal: Option<String>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            phases: Vec::new(),
            degraded: false,
            fatal: None,
        }
    }

    pub fn record(&mut self, phase: &str, outcome: PhaseOutcome) {
        tracing::debug!("[Report] {} -> {:?}", phase, outcome);
        self.phases.push((phase.to_string(), outcome));
    }

    /// Mark the run degraded (partial mount failure) without failing it.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    /// Record the fatal error that aborted the pipeline.
    pub fn mark_fatal(&mut self, phase: &str, reason: String) {
        self.record(phase, PhaseOutcome::Failed(reason.clone()));
        self.fatal = Some(reason);
    }

    pub fn status(&self) -> RunStatus {
        if self.fatal.is_some() {
            RunStatus::Failure
        } else if self.degraded
            || self
                .phases
                .iter()
                .any(|(_, o)| matches!(o, PhaseOutcome::Failed(_)))
        {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        }
    }

    pub fn phases(&self) -> &[(String, PhaseOutcome)] {
        &self.phases
    }

    /// Aligned text table for the operator.
    pub fn render(&self) -> String {
        let width = self
            .phases
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(5)
            .max(5);

        let mut out = String::new();
        out.push_str(&format!(
            "Run started {}, status: {}\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.status().as_str()
        ));
        for (name, outcome) in &self.phases {
            let detail = outcome.detail();
            if detail.is_empty() {
                out.push_str(&format!("  {:width$}  {}\n", name, outcome.label()));
            } else {
                out.push_str(&format!(
                    "  {:width$}  {:9}  {}\n",
                    name,
                    outcome.label(),
                    detail
                ));
            }
        }
        if let Some(fatal) = &self.fatal {
            out.push_str(&format!("\nRun aborted: {}\n", fatal));
        }
        out
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}
