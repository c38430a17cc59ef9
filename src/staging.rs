//! Result stager.
//!
//! Copies the primary artifact of every successful trial into a prepared
//! directory under the canonical name `K{k}_run{run}.Q`, converting the
//! format first where the next stage needs a plain Q matrix. Problems with
//! individual artifacts become warnings; only I/O on the target directory
//! itself is fatal.
mod extract;

use crate::error::StagingError;
use crate::stage::{StageKind, StageResults, TrialKey, TrialResult};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub use extract::{extract_ancestry_matrix, individual_rows_matrix};

/// Extension of every staged ancestry matrix.
pub const STAGED_EXTENSION: &str = "Q";

/// Provenance table written next to the alignment inputs.
pub const ALIGNMENT_SOURCES_NAME: &str = "sources.tsv";

const CANONICAL_PATTERN: &str = r"^K(\d+)_run(\d+)\.Q$";

/// How a trial's primary artifact becomes a staged Q matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// Already a Q matrix; copied byte for byte.
    Verbatim,
    /// A STRUCTURE `_f` results file; the per-individual ancestry section
    /// is extracted.
    StructureAncestry,
    /// A CLUMPP aligned individual file; rows are converted to a Q matrix.
    ClumppIndividuals,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedArtifact {
    pub key: TrialKey,
    pub source: PathBuf,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StagingReport {
    pub staged: Vec<StagedArtifact>,
    pub warnings: Vec<StagingError>,
}

/// Canonical staged file name; a pure function of (K, run).
pub fn canonical_name(k: u32, run: u32) -> String {
    format!("K{k}_run{run}.{STAGED_EXTENSION}")
}

/// Stage every successful trial in `results` into `target_dir`.
///
/// Canonical files left in `target_dir` by an earlier run are removed first so
/// the directory only ever reflects the current results.
pub fn stage_results(
    results: &StageResults,
    target_dir: &Path,
    format: ArtifactFormat,
) -> Result<StagingReport> {
    fs::create_dir_all(target_dir)
        .with_context(|| format!("create {}", target_dir.display()))?;
    remove_canonical_files(target_dir)?;

    let mut report = StagingReport::default();
    for result in results.values().filter(|result| result.succeeded()) {
        let key = result.key;
        let dest = target_dir.join(canonical_name(key.k, key.run));
        match staged_bytes(result, format) {
            Ok(bytes) => {
                write_atomic(&dest, &bytes)?;
                tracing::debug!(
                    k = key.k,
                    run = key.run,
                    path = %dest.display(),
                    "staged artifact"
                );
                report.staged.push(StagedArtifact {
                    key,
                    source: result.primary_output.clone(),
                    path: dest,
                });
            }
            Err(err) => {
                let warning = StagingError {
                    k: key.k,
                    run: key.run,
                    reason: format!("{err:#}"),
                };
                tracing::warn!(warning = %warning, "artifact not staged");
                report.warnings.push(warning);
            }
        }
    }
    tracing::info!(
        target_dir = %target_dir.display(),
        staged = report.staged.len(),
        warnings = report.warnings.len(),
        "staging finished"
    );
    Ok(report)
}

fn staged_bytes(result: &TrialResult, format: ArtifactFormat) -> Result<Vec<u8>> {
    let source = &result.primary_output;
    if !source.is_file() {
        return Err(anyhow!(
            "artifact {} missing despite successful trial",
            source.display()
        ));
    }
    match format {
        ArtifactFormat::Verbatim => {
            fs::read(source).with_context(|| format!("read {}", source.display()))
        }
        ArtifactFormat::StructureAncestry => {
            let text = fs::read_to_string(source)
                .with_context(|| format!("read {}", source.display()))?;
            let matrix = extract_ancestry_matrix(&text)
                .with_context(|| format!("extract ancestry from {}", source.display()))?;
            Ok(matrix.into_bytes())
        }
        ArtifactFormat::ClumppIndividuals => {
            let text = fs::read_to_string(source)
                .with_context(|| format!("read {}", source.display()))?;
            let matrix = individual_rows_matrix(&text)
                .with_context(|| format!("read aligned rows from {}", source.display()))?;
            Ok(matrix.into_bytes())
        }
    }
}

/// Prepared directory of one method feeding the alignment stage.
#[derive(Debug, Clone)]
pub struct AlignmentSource {
    pub method: StageKind,
    pub prepared_dir: PathBuf,
}

/// One staged alignment input and where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentEntry {
    pub k: u32,
    pub run: u32,
    pub method: StageKind,
    pub original_run: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlignmentInputs {
    /// Only Ks with at least one input appear.
    pub per_k: BTreeMap<u32, Vec<AlignmentEntry>>,
    pub warnings: Vec<String>,
}

impl AlignmentInputs {
    pub fn methods_for(&self, k: u32) -> Vec<StageKind> {
        let mut methods: Vec<StageKind> = self
            .per_k
            .get(&k)
            .map(|entries| entries.iter().map(|entry| entry.method).collect())
            .unwrap_or_default();
        methods.dedup();
        methods
    }
}

/// Directory holding the alignment inputs for one K.
pub fn alignment_dir(target_dir: &Path, k: u32) -> PathBuf {
    target_dir.join(format!("K{k}"))
}

/// Gather the prepared matrices of every method into per-K alignment input
/// directories (`K{k}/K{k}_run{n}.Q`), renumbering runs per K across methods
/// in source order. `target_dir` is rebuilt from scratch on every call.
pub fn stage_for_alignment(
    sources: &[AlignmentSource],
    ks: &[u32],
    target_dir: &Path,
) -> Result<AlignmentInputs> {
    if target_dir.exists() {
        fs::remove_dir_all(target_dir)
            .with_context(|| format!("remove stale {}", target_dir.display()))?;
    }
    fs::create_dir_all(target_dir)
        .with_context(|| format!("create {}", target_dir.display()))?;

    let mut inputs = AlignmentInputs::default();
    let mut by_source = Vec::with_capacity(sources.len());
    for source in sources {
        if !source.prepared_dir.is_dir() {
            let warning = format!(
                "{} has no prepared directory at {}",
                source.method,
                source.prepared_dir.display()
            );
            tracing::warn!(%warning, "alignment source missing");
            inputs.warnings.push(warning);
            by_source.push(BTreeMap::new());
            continue;
        }
        by_source.push(list_canonical_files(&source.prepared_dir)?);
    }

    for &k in ks {
        let k_dir = alignment_dir(target_dir, k);
        let mut next_run = 1;
        for (source, files) in sources.iter().zip(&by_source) {
            let runs = files.range(TrialKey { k, run: 0 }..=TrialKey { k, run: u32::MAX });
            for (key, path) in runs {
                fs::create_dir_all(&k_dir)
                    .with_context(|| format!("create {}", k_dir.display()))?;
                let dest = k_dir.join(canonical_name(k, next_run));
                let bytes =
                    fs::read(path).with_context(|| format!("read {}", path.display()))?;
                write_atomic(&dest, &bytes)?;
                inputs.per_k.entry(k).or_default().push(AlignmentEntry {
                    k,
                    run: next_run,
                    method: source.method,
                    original_run: key.run,
                    path: dest,
                });
                next_run += 1;
            }
        }
        if next_run == 1 {
            let warning = format!("no prepared matrices for K={k}");
            tracing::warn!(%warning, "alignment input missing");
            inputs.warnings.push(warning);
        }
    }

    write_sources_table(&inputs, &target_dir.join(ALIGNMENT_SOURCES_NAME))?;
    Ok(inputs)
}

fn write_sources_table(inputs: &AlignmentInputs, path: &Path) -> Result<()> {
    let mut table = String::from("file\tmethod\tk\toriginal_run\n");
    for entry in inputs.per_k.values().flatten() {
        table.push_str(&format!(
            "K{}/{}\t{}\t{}\t{}\n",
            entry.k,
            canonical_name(entry.k, entry.run),
            entry.method,
            entry.k,
            entry.original_run
        ));
    }
    write_atomic(path, table.as_bytes())
}

/// Canonically named files in `dir`, keyed by the (K, run) in their name.
fn list_canonical_files(dir: &Path) -> Result<BTreeMap<TrialKey, PathBuf>> {
    let pattern = Regex::new(CANONICAL_PATTERN).context("compile canonical name pattern")?;
    let mut files = BTreeMap::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let Some(captures) = name.to_str().and_then(|name| pattern.captures(name)) else {
            continue;
        };
        let (Ok(k), Ok(run)) = (captures[1].parse::<u32>(), captures[2].parse::<u32>()) else {
            continue;
        };
        files.insert(TrialKey { k, run }, entry.path());
    }
    Ok(files)
}

fn remove_canonical_files(dir: &Path) -> Result<()> {
    for path in list_canonical_files(dir)?.into_values() {
        fs::remove_file(&path).with_context(|| format!("remove stale {}", path.display()))?;
    }
    Ok(())
}

/// Write through a hidden `.{name}.tmp` sibling and rename into place.
fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid staging path {}", dest.display()))?;
    let tmp_path = dest.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, bytes).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, dest).with_context(|| format!("publish {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
#[path = "staging_tests.rs"]
mod tests;
