//! Append-only result persistence.
//!
//! Two sheets: per-stage linearity results and per-site wafer-sort records.
//! The header row is written when a file is first created; rows are only
//! ever appended, never rewritten.

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::core::{SiteTestRecord, StageIndex, StageResult};
use crate::error::RigResult;

/// Append-only sink for run results.
#[async_trait]
pub trait ResultRecorder: Send + Sync {
    async fn append_stage_result(&self, result: &StageResult) -> RigResult<()>;
    async fn append_site_result(&self, record: &SiteTestRecord) -> RigResult<()>;
}

/// CSV-backed recorder writing into a results directory.
pub struct CsvRecorder {
    stage_path: PathBuf,
    site_path: PathBuf,
}

impl CsvRecorder {
    /// Creates the results directory if needed. Files are created lazily on
    /// first append.
    pub fn new(results_dir: impl AsRef<Path>) -> RigResult<Self> {
        let dir = results_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            stage_path: dir.join("stage_results.csv"),
            site_path: dir.join("wafer_sort_results.csv"),
        })
    }

    pub fn stage_path(&self) -> &Path {
        &self.stage_path
    }

    pub fn site_path(&self) -> &Path {
        &self.site_path
    }

    fn stage_header() -> Vec<String> {
        [
            "Test_Time",
            "Stage",
            "Gain_Config_dB",
            "Input_Amp_V",
            "Gain",
            "Offset_V",
            "LSB_Ideal",
            "Nonlinearity_pct",
            "Max_INL",
            "Max_DNL",
            "Result",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn site_header() -> Vec<String> {
        let mut fields: Vec<String> = [
            "Test_Time",
            "Site_ID",
            "Row",
            "Col",
            "Final_Result",
            "Fail_Reason",
            "Power_Current",
            "Power_Check_Result",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for i in 1..=StageIndex::COUNT {
            for col in [
                "Gain_Config",
                "Input_Amp",
                "Gain",
                "Offset",
                "Nonlinearity",
                "Max_INL",
                "Max_DNL",
                "Result",
            ] {
                fields.push(format!("S{}_{}", i, col));
            }
        }
        fields
    }

    /// Opens `path` for append, writing `header` first if the file is new.
    fn append_row(path: &Path, header: Vec<String>, row: Vec<String>) -> RigResult<()> {
        let is_new = !path.exists() || std::fs::metadata(path)?.len() == 0;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(&header)?;
        }
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }

    fn stage_row(result: &StageResult) -> Vec<String> {
        let mut row = vec![
            Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            result.stage.to_string(),
            format!("{:.1}", result.gain_config_db),
            format!("{:.4}", result.input_amplitude),
        ];
        match &result.metrics {
            Some(m) => {
                row.push(format!("{:.6}", m.gain));
                row.push(format!("{:.6}", m.offset));
                row.push(format!("{:.6e}", m.lsb_ideal));
                row.push(format!("{:.4}", m.nonlinearity_pct));
                row.push(format!("{:.6}", m.max_inl));
                row.push(format!("{:.6}", m.max_dnl));
            }
            None => row.extend(std::iter::repeat(String::new()).take(6)),
        }
        row.push(result.verdict.to_string());
        row
    }

    fn site_row(record: &SiteTestRecord) -> Vec<String> {
        let mut row = vec![
            record.tested_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.site_id.clone(),
            record.row.to_string(),
            record.col.to_string(),
            record.final_verdict.to_string(),
            record
                .fail_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            format!("{:.4}", record.power_current),
            record.power_check.to_string(),
        ];
        for i in 1..=StageIndex::COUNT {
            let stage = StageIndex::new(i).ok().and_then(|idx| record.stage(idx));
            match stage {
                Some(s) => {
                    row.push(format!("{:.1}", s.gain_config_db));
                    row.push(format!("{:.4}", s.input_amplitude));
                    match &s.metrics {
                        Some(m) => {
                            row.push(format!("{:.6}", m.gain));
                            row.push(format!("{:.6}", m.offset));
                            row.push(format!("{:.4}", m.nonlinearity_pct));
                            row.push(format!("{:.6}", m.max_inl));
                            row.push(format!("{:.6}", m.max_dnl));
                        }
                        None => row.extend(std::iter::repeat(String::new()).take(5)),
                    }
                    row.push(s.verdict.to_string());
                }
                // Stage never executed (aborted run): all columns empty.
                None => row.extend(std::iter::repeat(String::new()).take(8)),
            }
        }
        row
    }
}

#[async_trait]
impl ResultRecorder for CsvRecorder {
    async fn append_stage_result(&self, result: &StageResult) -> RigResult<()> {
        Self::append_row(
            &self.stage_path,
            Self::stage_header(),
            Self::stage_row(result),
        )?;
        info!(
            "stage {} result recorded ({})",
            result.stage, result.verdict
        );
        Ok(())
    }

    async fn append_site_result(&self, record: &SiteTestRecord) -> RigResult<()> {
        Self::append_row(&self.site_path, Self::site_header(), Self::site_row(record))?;
        info!(
            "site {} (R{}, C{}) result recorded: {}",
            record.site_id, record.row, record.col, record.final_verdict
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FinalVerdict, StageVerdict};
    use tempfile::tempdir;

    fn stage_result(stage: u8, verdict: StageVerdict) -> StageResult {
        StageResult {
            stage: StageIndex::new(stage).unwrap(),
            gain_config_db: 0.0,
            input_amplitude: 0.25,
            metrics: None,
            verdict,
        }
    }

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path()).unwrap();
        recorder
            .append_stage_result(&stage_result(1, StageVerdict::Pass))
            .await
            .unwrap();
        recorder
            .append_stage_result(&stage_result(2, StageVerdict::Fail))
            .await
            .unwrap();

        let content = std::fs::read_to_string(recorder.stage_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Test_Time,Stage"));
        assert!(lines[1].contains("PASS"));
        assert!(lines[2].contains("FAIL"));
    }

    #[tokio::test]
    async fn test_append_never_rewrites_prior_rows() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path()).unwrap();
        recorder
            .append_stage_result(&stage_result(1, StageVerdict::Pass))
            .await
            .unwrap();
        let first = std::fs::read_to_string(recorder.stage_path()).unwrap();
        recorder
            .append_stage_result(&stage_result(2, StageVerdict::Pass))
            .await
            .unwrap();
        let second = std::fs::read_to_string(recorder.stage_path()).unwrap();
        assert!(second.starts_with(&first));
    }

    #[tokio::test]
    async fn test_site_row_width_matches_header() {
        let dir = tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path()).unwrap();
        let mut record = SiteTestRecord::new("S01", 3, 4);
        record.final_verdict = FinalVerdict::Fail;
        record.fail_reason = Some(crate::core::AbortReason::Stage1Fail);
        record.stages.push(stage_result(1, StageVerdict::Fail));
        recorder.append_site_result(&record).await.unwrap();

        let content = std::fs::read_to_string(recorder.site_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let header_cols = lines[0].split(',').count();
        let row_cols = lines[1].split(',').count();
        assert_eq!(header_cols, row_cols);
        assert!(lines[1].contains("Stage1_Fail"));
    }
}
