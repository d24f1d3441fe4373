//! Per-site (CP test) runner.
//!
//! Wraps one sequencer execution bound to a wafer site. Site policy differs
//! from the bench run: a failed power check aborts immediately
//! (*AbortOnFail*), and a stage-1 failure aborts the remaining stages. The
//! finished [`SiteTestRecord`] is persisted exactly once, after power-off.

use log::info;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{ConfigProvider, RigSettings};
use crate::core::{FinalVerdict, SiteTestRecord, StageIndex};
use crate::error::RigResult;
use crate::instrument::InstrumentRegistry;
use crate::progress::RunContext;
use crate::recorder::ResultRecorder;
use crate::sequencer::{SequenceState, SequencerOptions, StageSequencer};

/// One wafer-site test run.
pub struct SiteRunner {
    sequencer: StageSequencer,
    recorder: Arc<dyn ResultRecorder>,
    site_id: String,
    row: u32,
    col: u32,
}

impl SiteRunner {
    pub fn new(
        registry: Arc<InstrumentRegistry>,
        provider: Arc<dyn ConfigProvider>,
        recorder: Arc<dyn ResultRecorder>,
        settings: &RigSettings,
        site_id: impl Into<String>,
        row: u32,
        col: u32,
    ) -> Self {
        let options = SequencerOptions::site(&settings.limits);
        let sequencer = StageSequencer::new(
            registry,
            provider,
            options,
            settings.delays.clone(),
            settings.scan.clone(),
        )
        .with_recorder(Arc::clone(&recorder));
        Self {
            sequencer,
            recorder,
            site_id: site_id.into(),
            row,
            col,
        }
    }

    /// Subscribes to the underlying sequencer's state updates.
    pub fn state(&self) -> watch::Receiver<SequenceState> {
        self.sequencer.state()
    }

    /// Runs the site test and persists its record.
    pub async fn run(&self, ctx: &RunContext) -> RigResult<SiteTestRecord> {
        info!(
            "starting CP test for site {} (R{}, C{})",
            self.site_id, self.row, self.col
        );
        let mut record = SiteTestRecord::new(self.site_id.clone(), self.row, self.col);

        let outcome = self.sequencer.run(ctx).await;

        if let Some(check) = &outcome.power_check {
            record.power_current = check.max_current;
            record.power_check = check.status;
        }
        record.stages = outcome.stages;
        record.final_verdict = match outcome.abort_reason {
            Some(reason) => {
                record.fail_reason = Some(reason);
                FinalVerdict::Fail
            }
            None => {
                let all_ran = record.stages.len() == usize::from(StageIndex::COUNT);
                let all_passed = record.stages.iter().all(|s| s.verdict.is_passing());
                if all_ran && all_passed {
                    FinalVerdict::Pass
                } else {
                    FinalVerdict::Partial
                }
            }
        };

        // The sequencer has already powered off; persist exactly once.
        self.recorder.append_site_result(&record).await?;
        info!(
            "site {} finished: {} ({} stages ran)",
            self.site_id,
            record.final_verdict,
            record.stages.len()
        );
        Ok(record)
    }
}
