use super::*;
use crate::cli::PipelineArgs;
use crate::dataset::{expected_genotype_bytes, BED_MAGIC};
use clap::Parser;
use std::fs;
use std::path::Path;

fn write_dataset(root: &Path, samples: u64, variants: u64) -> Dataset {
    let dataset = Dataset::from_prefix(&root.join("cohort")).expect("dataset");
    let fam: String = (0..samples)
        .map(|idx| format!("fam{idx} ind{idx} 0 0 1 -9\n"))
        .collect();
    let bim: String = (0..variants)
        .map(|idx| format!("1 rs{idx} 0 {} A G\n", 1000 + idx))
        .collect();
    let mut bed = BED_MAGIC.to_vec();
    bed.resize(expected_genotype_bytes(samples, variants) as usize, 0);
    fs::write(dataset.sample_index_path(), fam).expect("write fam");
    fs::write(dataset.variant_index_path(), bim).expect("write bim");
    fs::write(dataset.genotype_path(), bed).expect("write bed");
    dataset
}

fn tool(program: &str, optional: bool) -> RequiredExecutable {
    RequiredExecutable {
        program: program.to_string(),
        purpose: "test",
        optional,
    }
}

fn pipeline_error(err: anyhow::Error) -> PipelineError {
    err.downcast::<PipelineError>().expect("pipeline error")
}

#[test]
fn passes_on_consistent_dataset_with_resolvable_tools() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = write_dataset(dir.path(), 20, 600);
    let report = validate_preconditions(&dataset, &Thresholds::default(), &[tool("sh", false)])
        .expect("valid");
    assert_eq!(report.stats.samples, 20);
    assert_eq!(report.stats.variants, 600);
    assert!(report.warnings.is_empty());
    assert!(report.reporter_available);
    assert_eq!(report.resolved.len(), 1);
}

#[test]
fn reports_every_missing_companion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = write_dataset(dir.path(), 20, 600);
    fs::remove_file(dataset.sample_index_path()).expect("remove fam");
    fs::remove_file(dataset.variant_index_path()).expect("remove bim");

    let err = validate_preconditions(&dataset, &Thresholds::default(), &[]).unwrap_err();
    match pipeline_error(err) {
        PipelineError::MissingInput { files } => {
            assert_eq!(
                files,
                vec![dataset.variant_index_path(), dataset.sample_index_path()]
            );
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn reports_every_threshold_violation_with_measurements() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = write_dataset(dir.path(), 3, 8);

    let err = validate_preconditions(&dataset, &Thresholds::default(), &[]).unwrap_err();
    match pipeline_error(err) {
        PipelineError::InsufficientData { violations } => {
            let checks: Vec<(&str, u64, u64)> = violations
                .iter()
                .map(|v| (v.check.as_str(), v.measured, v.threshold))
                .collect();
            assert_eq!(
                checks,
                vec![
                    ("genotype file bytes", 11, 1024),
                    ("variant count", 8, 10),
                    ("sample count", 3, 5),
                ]
            );
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn aggregates_missing_dependencies_and_tolerates_optional_ones() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = write_dataset(dir.path(), 20, 600);
    let executables = [
        tool("ancestry-missing-tool-a", false),
        tool("sh", false),
        tool("ancestry-missing-tool-b", false),
        tool("ancestry-missing-plotter", true),
    ];
    let err =
        validate_preconditions(&dataset, &Thresholds::default(), &executables).unwrap_err();
    match pipeline_error(err) {
        PipelineError::MissingDependency { executables } => {
            assert_eq!(
                executables,
                vec![
                    "ancestry-missing-tool-a".to_string(),
                    "ancestry-missing-tool-b".to_string()
                ]
            );
        }
        other => panic!("unexpected error {other}"),
    }

    let report = validate_preconditions(
        &dataset,
        &Thresholds::default(),
        &[tool("ancestry-missing-plotter", true)],
    )
    .expect("optional tool only warns");
    assert!(!report.reporter_available);
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn validation_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dataset = write_dataset(dir.path(), 20, 600);
    let first = validate_preconditions(&dataset, &Thresholds::default(), &[]).expect("first");
    let second = validate_preconditions(&dataset, &Thresholds::default(), &[]).expect("second");
    assert_eq!(first.stats, second.stats);
    assert_eq!(first.warnings, second.warnings);
}

#[test]
fn skipped_stages_need_no_executables() {
    let args = PipelineArgs::try_parse_from([
        "ancestry-pipeline",
        "data/x",
        "2",
        "4",
        "--skip-structure",
        "--skip-clumpak",
        "--skip-report",
    ])
    .expect("args");
    let config = PipelineConfig::from_args(&args).expect("config");
    let required = required_executables(&config).expect("required");
    let programs: Vec<&str> = required.iter().map(|r| r.program.as_str()).collect();
    assert_eq!(programs, vec!["admixture"]);

    let args = PipelineArgs::try_parse_from(["ancestry-pipeline", "data/x", "2", "4"])
        .expect("args");
    let config = PipelineConfig::from_args(&args).expect("config");
    let required = required_executables(&config).expect("required");
    let programs: Vec<&str> = required.iter().map(|r| r.program.as_str()).collect();
    assert_eq!(
        programs,
        vec!["admixture", "plink", "structure", "CLUMPAK.pl", "plot_ancestry"]
    );
}
