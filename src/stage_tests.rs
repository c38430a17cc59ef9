use super::*;
use crate::config::{MetricSource, MetricSpec};

fn sh_tool(script: &str, primary_output: Option<&str>) -> ToolSpec {
    ToolSpec {
        executable: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        primary_output: primary_output.map(str::to_string),
        metric: Some(MetricSpec {
            name: "cv_error".to_string(),
            pattern: r"CV error \(K=\d+\):\s*([-+0-9.eE]+)".to_string(),
            source: MetricSource::Output,
        }),
    }
}

fn spec_for(kind: StageKind, tool: ToolSpec, trial_root: &Path) -> StageSpec {
    StageSpec {
        kind,
        command: ResolvedCommand::resolve(&tool).expect("resolve sh"),
        tool,
        trial_root: trial_root.to_path_buf(),
        vars: TemplateVars::from([("stem", "cohort".to_string())]),
    }
}

fn options(jobs: usize) -> RunnerOptions {
    RunnerOptions {
        jobs,
        timeout: None,
        base_seed: 42,
        resume: false,
        cancel: CancelFlag::new(),
    }
}

const FLAKY_K3: &str = "if [ {k} = 3 ]; then echo 'simulated crash'; exit 1; fi; \
                        echo 'CV error (K={k}): 0.{k}{run}'; \
                        printf '0.5 0.5\\n' > {stem}.{k}.Q";

#[test]
fn one_failed_k_does_not_stop_the_sweep() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = spec_for(
        StageKind::Admixture,
        sh_tool(FLAKY_K3, Some("{stem}.{k}.Q")),
        dir.path(),
    );
    let results = run_stage(&spec, &[2, 3, 4], 2, &options(1)).expect("run stage");

    assert_eq!(results.len(), 6);
    for (key, result) in &results {
        if key.k == 3 {
            assert_eq!(result.status, TrialStatus::Failure);
            assert!(matches!(
                result.error,
                Some(TrialExecutionError::MissingOutput {
                    exit_code: Some(1),
                    ..
                })
            ));
            assert!(result.output_excerpt.contains("simulated crash"));
            assert_eq!(result.metric, None);
        } else {
            assert_eq!(result.status, TrialStatus::Success, "{key:?}");
            assert!(result.primary_output.ends_with(format!(
                "K{}_run{}/cohort.{}.Q",
                key.k, key.run, key.k
            )));
            let expected: f64 = format!("0.{}{}", key.k, key.run).parse().expect("float");
            assert_eq!(result.metric, Some(expected));
        }
    }
    assert_eq!(unsatisfied_ks(&results, &[2, 3, 4]), vec![3]);
}

#[test]
fn concurrent_trials_match_sequential_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sequential_spec = spec_for(
        StageKind::Admixture,
        sh_tool(FLAKY_K3, Some("{stem}.{k}.Q")),
        &dir.path().join("seq"),
    );
    let parallel_spec = spec_for(
        StageKind::Admixture,
        sh_tool(FLAKY_K3, Some("{stem}.{k}.Q")),
        &dir.path().join("par"),
    );
    let sequential = run_stage(&sequential_spec, &[2, 3, 4, 5], 2, &options(1)).expect("seq");
    let parallel = run_stage(&parallel_spec, &[2, 3, 4, 5], 2, &options(4)).expect("par");

    let summarize = |results: &StageResults| -> Vec<(TrialKey, TrialStatus, Option<f64>)> {
        results
            .values()
            .map(|result| (result.key, result.status, result.metric))
            .collect()
    };
    assert_eq!(summarize(&sequential), summarize(&parallel));
}

#[test]
fn seeds_are_deterministic_and_distinct() {
    assert_eq!(derive_seed(42, 3, 1), derive_seed(42, 3, 1));
    assert_ne!(derive_seed(42, 3, 1), derive_seed(42, 3, 2));
    assert_ne!(derive_seed(42, 3, 1), derive_seed(42, 4, 1));
    assert_eq!(derive_seed(42, 2, 5), 42 + 2000 + 5);

    let dir = tempfile::tempdir().expect("tempdir");
    let spec = spec_for(
        StageKind::Structure,
        sh_tool("echo {seed} > seed.txt", Some("seed.txt")),
        dir.path(),
    );
    let results = run_stage(&spec, &[2], 2, &options(1)).expect("run");
    let first = &results[&TrialKey { k: 2, run: 1 }];
    assert_eq!(first.seed, Some(derive_seed(42, 2, 1)));
    let written = fs::read_to_string(&first.primary_output).expect("seed file");
    assert_eq!(written.trim(), derive_seed(42, 2, 1).to_string());
    assert!(first.workdir.ends_with("K2/run1"));
}

#[test]
fn deterministic_stage_gets_no_seed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = spec_for(
        StageKind::Clumpak,
        sh_tool("echo 'seed={seed}' > aligned.Q", Some("aligned.Q")),
        dir.path(),
    );
    let results = run_stage(&spec, &[2], 1, &options(1)).expect("run");
    let result = &results[&TrialKey { k: 2, run: 1 }];
    assert_eq!(result.seed, None);
    let text = fs::read_to_string(&result.primary_output).expect("artifact");
    assert_eq!(text.trim(), "seed={seed}");
}

#[test]
fn resume_reuses_existing_artifacts_without_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = spec_for(
        StageKind::Admixture,
        sh_tool(
            "touch invoked; echo 'CV error (K={k}): 0.9'; printf 'x\\n' > {stem}.{k}.Q",
            Some("{stem}.{k}.Q"),
        ),
        dir.path(),
    );
    let workdir = StageKind::Admixture.trial_dir(dir.path(), TrialKey { k: 2, run: 1 });
    fs::create_dir_all(&workdir).expect("workdir");
    fs::write(workdir.join("cohort.2.Q"), "0.1 0.9\n").expect("artifact");
    fs::write(workdir.join("trial.log"), "CV error (K=2): 0.25\n").expect("log");

    let mut opts = options(1);
    opts.resume = true;
    let results = run_stage(&spec, &[2, 3], 1, &opts).expect("run");

    let reused = &results[&TrialKey { k: 2, run: 1 }];
    assert!(reused.reused);
    assert_eq!(reused.metric, Some(0.25));
    assert!(!workdir.join("invoked").exists());

    let fresh = &results[&TrialKey { k: 3, run: 1 }];
    assert!(!fresh.reused);
    assert!(fresh.workdir.join("invoked").exists());
}

#[test]
fn cancelled_runner_schedules_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = spec_for(
        StageKind::Admixture,
        sh_tool("printf 'x' > {stem}.{k}.Q", Some("{stem}.{k}.Q")),
        dir.path(),
    );
    let opts = options(1);
    opts.cancel.cancel();
    let results = run_stage(&spec, &[2, 3], 1, &opts).expect("run");
    assert!(results
        .values()
        .all(|result| result.error == Some(TrialExecutionError::Cancelled)));
    assert!(!dir.path().join("K2_run1").exists());
}

#[test]
fn timeout_classifies_trial_as_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = spec_for(
        StageKind::Admixture,
        sh_tool("printf 'x' > {stem}.{k}.Q; sleep 30", Some("{stem}.{k}.Q")),
        dir.path(),
    );
    let mut opts = options(1);
    opts.timeout = Some(Duration::from_secs(1));
    let results = run_stage(&spec, &[2], 1, &opts).expect("run");
    let result = &results[&TrialKey { k: 2, run: 1 }];
    assert_eq!(result.status, TrialStatus::Failure);
    assert_eq!(
        result.error,
        Some(TrialExecutionError::TimedOut { seconds: 1 })
    );
}

#[test]
fn classification_trusts_the_artifact_over_exit_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let artifact = dir.path().join("out.Q");
    let failed_exit = ExecOutcome {
        exit_code: Some(2),
        ..ExecOutcome::default()
    };

    let (status, error) = classify_trial(&failed_exit, &artifact, None);
    assert_eq!(status, TrialStatus::Failure);
    assert!(matches!(
        error,
        Some(TrialExecutionError::MissingOutput { .. })
    ));

    fs::write(&artifact, "").expect("empty artifact");
    let (status, _) = classify_trial(&failed_exit, &artifact, None);
    assert_eq!(status, TrialStatus::Failure);

    fs::write(&artifact, "0.2 0.8\n").expect("artifact");
    let (status, error) = classify_trial(&failed_exit, &artifact, None);
    assert_eq!(status, TrialStatus::Success);
    assert_eq!(error, None);

    let timed_out = ExecOutcome {
        timed_out: true,
        ..ExecOutcome::default()
    };
    let (status, _) = classify_trial(&timed_out, &artifact, Some(Duration::from_secs(5)));
    assert_eq!(status, TrialStatus::Failure);
}

#[test]
fn satisfaction_policies() {
    assert!(stage_satisfied(&[], &[2, 3], SatisfactionPolicy::EveryK));
    assert!(!stage_satisfied(&[3], &[2, 3], SatisfactionPolicy::EveryK));
    assert!(stage_satisfied(&[3], &[2, 3], SatisfactionPolicy::AnyK));
    assert!(!stage_satisfied(&[2, 3], &[2, 3], SatisfactionPolicy::AnyK));
}

#[test]
fn metrics_by_k_averages_successful_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = spec_for(
        StageKind::Admixture,
        sh_tool(FLAKY_K3, Some("{stem}.{k}.Q")),
        dir.path(),
    );
    let results = run_stage(&spec, &[2, 3], 2, &options(1)).expect("run");
    let metrics = metrics_by_k(&results);
    let k2 = metrics[&2].expect("k2 metric");
    assert!((k2 - 0.215).abs() < 1e-9);
    assert_eq!(metrics[&3], None);
}

#[test]
fn auxiliary_without_primary_output_uses_exit_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ok = sh_tool("echo plotted", None);
    let outcome = run_auxiliary("report", &ok, &TemplateVars::new(), dir.path(), &options(1))
        .expect("run");
    assert!(outcome.succeeded);
    assert!(outcome.primary_output.is_none());

    let failing = sh_tool("exit 4", None);
    let outcome = run_auxiliary(
        "report",
        &failing,
        &TemplateVars::new(),
        &dir.path().join("second"),
        &options(1),
    )
    .expect("run");
    assert!(!outcome.succeeded);
    assert_eq!(outcome.detail, "exited with status 4");
}

#[test]
fn leftover_artifact_does_not_rescue_a_crashed_trial() {
    let dir = tempfile::tempdir().expect("tempdir");
    let leftover = dir.path().join("K2_run1/cohort.2.Q");
    fs::create_dir_all(leftover.parent().expect("parent")).expect("trial dir");
    fs::write(&leftover, "0.5 0.5\n").expect("leftover artifact");
    let spec = spec_for(
        StageKind::Admixture,
        sh_tool("echo 'simulated crash'; exit 1", Some("{stem}.{k}.Q")),
        dir.path(),
    );

    let results = run_stage(&spec, &[2], 1, &options(1)).expect("run stage");

    let result = &results[&TrialKey { k: 2, run: 1 }];
    assert_eq!(result.status, TrialStatus::Failure);
    assert!(!result.reused);
    assert_eq!(result.exit_code, Some(1));
    assert!(matches!(
        result.error,
        Some(TrialExecutionError::MissingOutput { .. })
    ));
    assert!(!leftover.exists());
}

#[test]
fn auxiliary_ignores_output_from_an_earlier_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("dataset.recode.strct_in"), "old\n").expect("leftover");
    let failing = sh_tool("exit 2", Some("dataset.recode.strct_in"));

    let outcome = run_auxiliary(
        "structure input conversion",
        &failing,
        &TemplateVars::new(),
        dir.path(),
        &options(1),
    )
    .expect("run");

    assert!(!outcome.succeeded);
    assert!(outcome.detail.contains("missing or empty"), "{}", outcome.detail);
}
