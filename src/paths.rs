//! Typed paths into the output layout.
//!
//! Centralizing path construction keeps every stage writing where the next
//! stage and the reporting program expect to read.
use crate::stage::StageKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct OutputPaths {
    root: PathBuf,
}

impl OutputPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `logs/` directory path.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Return the per-stage directory (`admixture/`, `structure/`, `clumpak/`).
    pub fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.root.join(stage.as_str())
    }

    /// Root under which a stage's trial working directories live.
    pub fn trial_root(&self, stage: StageKind) -> PathBuf {
        match stage {
            StageKind::Admixture => self.stage_dir(stage).join("raw"),
            StageKind::Structure | StageKind::Clumpak => self.stage_dir(stage),
        }
    }

    /// Canonically named artifacts ready for the next stage.
    pub fn prepared_dir(&self, stage: StageKind) -> PathBuf {
        self.stage_dir(stage).join("prepared")
    }

    /// Return the `admixture/cv_errors.txt` path.
    pub fn cv_errors_path(&self) -> PathBuf {
        self.stage_dir(StageKind::Admixture).join("cv_errors.txt")
    }

    /// Converted STRUCTURE input and parameter files.
    pub fn structure_input_dir(&self) -> PathBuf {
        self.stage_dir(StageKind::Structure).join("input")
    }

    pub fn mainparams_path(&self) -> PathBuf {
        self.structure_input_dir().join("mainparams")
    }

    pub fn extraparams_path(&self) -> PathBuf {
        self.structure_input_dir().join("extraparams")
    }

    /// Aligned Q matrices copied out of the CLUMPAK run directories.
    pub fn aligned_dir(&self) -> PathBuf {
        self.stage_dir(StageKind::Clumpak).join("aligned")
    }

    /// Return the `clumpak/method_comparison.txt` path.
    pub fn method_comparison_path(&self) -> PathBuf {
        self.stage_dir(StageKind::Clumpak).join("method_comparison.txt")
    }

    /// Return the `visualization/` directory path.
    pub fn visualization_dir(&self) -> PathBuf {
        self.root.join("visualization")
    }

    /// Return the `analysis_summary.txt` path.
    pub fn summary_path(&self) -> PathBuf {
        self.root.join("analysis_summary.txt")
    }

    /// Return the `analysis_summary.json` path.
    pub fn summary_json_path(&self) -> PathBuf {
        self.root.join("analysis_summary.json")
    }
}
