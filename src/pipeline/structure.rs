//! STRUCTURE parameter files.
//!
//! K, the locus and sample counts, the input file and the seed are also
//! passed on the command line, so these files only carry the run-wide
//! settings. RANDOMIZE is off so the seed from `-D` is used.
use crate::config::StructureParams;
use crate::dataset::DatasetStats;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub(super) fn render_mainparams(params: &StructureParams, stats: &DatasetStats) -> String {
    let flag = |value: bool| u8::from(value);
    let entries: [(&str, String); 19] = [
        ("BURNIN", params.burnin.to_string()),
        ("NUMREPS", params.numreps.to_string()),
        ("NUMINDS", stats.samples.to_string()),
        ("NUMLOCI", stats.variants.to_string()),
        ("PLOIDY", "2".to_string()),
        ("MISSING", "-9".to_string()),
        ("ONEROWPERIND", flag(params.onerowperind).to_string()),
        ("LABEL", flag(params.label).to_string()),
        ("POPDATA", flag(params.popdata).to_string()),
        ("POPFLAG", "0".to_string()),
        ("LOCDATA", "0".to_string()),
        ("PHENOTYPE", "0".to_string()),
        ("EXTRACOLS", "0".to_string()),
        ("MARKERNAMES", flag(params.markernames).to_string()),
        ("RECESSIVEALLELES", "0".to_string()),
        ("MAPDISTANCES", flag(params.mapdistances).to_string()),
        ("PHASED", "0".to_string()),
        ("PHASEINFO", "0".to_string()),
        ("MARKOVPHASE", "0".to_string()),
    ];
    render_defines(&entries)
}

pub(super) fn render_extraparams() -> String {
    let entries = [
        ("NOADMIX", "0"),
        ("LINKAGE", "0"),
        ("USEPOPINFO", "0"),
        ("LOCPRIOR", "0"),
        ("INFERALPHA", "1"),
        ("ALPHA", "1.0"),
        ("FREQSCORR", "1"),
        ("LAMBDA", "1.0"),
        ("COMPUTEPROB", "1"),
        ("ANCESTDIST", "0"),
        ("RANDOMIZE", "0"),
    ];
    render_defines(&entries)
}

fn render_defines<V: AsRef<str>>(entries: &[(&str, V)]) -> String {
    entries
        .iter()
        .map(|(name, value)| format!("#define {name:<16} {}\n", value.as_ref()))
        .collect()
}

/// Write both parameter files, creating their directory if needed.
pub(super) fn write_parameter_files(
    mainparams: &Path,
    extraparams: &Path,
    params: &StructureParams,
    stats: &DatasetStats,
) -> Result<()> {
    if let Some(parent) = mainparams.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(mainparams, render_mainparams(params, stats))
        .with_context(|| format!("write {}", mainparams.display()))?;
    fs::write(extraparams, render_extraparams())
        .with_context(|| format!("write {}", extraparams.display()))?;
    Ok(())
}
