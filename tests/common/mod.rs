//! Shared fixture for end-to-end runs of the pipeline binary.
//!
//! Every external program is replaced by a small shell script that appends
//! its arguments to `invocations.log` and writes the artifacts the real tool
//! would leave behind.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

pub const SAMPLES: usize = 20;
pub const VARIANTS: usize = 600;

/// SNP-major `.bed` header.
const BED_MAGIC: [u8; 3] = [0x6c, 0x1b, 0x01];

pub struct PipelineFixture {
    dir: TempDir,
    tools: Value,
}

/// Exit status and streams of one pipeline invocation.
#[derive(Debug)]
pub struct RunResult {
    pub code: Option<i32>,
    pub stderr: String,
}

impl PipelineFixture {
    pub fn new() -> Self {
        Self::with_failing_admixture_k(None)
    }

    /// Fixture whose ADMIXTURE stand-in crashes for one K.
    pub fn with_failing_admixture_k(failing_k: Option<u32>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture_root = dir.path().to_path_buf();
        write_dataset(&fixture_root.join("data/cohort"));
        let scripts = fixture_root.join("bin");
        fs::create_dir_all(&scripts).expect("script dir");

        let marker = fixture_root.join("invocations.log");
        let record = format!("echo \"$0 $*\" >> '{}'\n", marker.display());
        let fail = failing_k
            .map(|k| format!("if [ \"$1\" = {k} ]; then echo 'simulated crash'; exit 1; fi\n"))
            .unwrap_or_default();

        let admixture = write_script(
            &scripts,
            "admixture.sh",
            &format!(
                "{record}{fail}echo \"CV error (K=$1): 0.${{1}}5\"\n\
                 printf '0.5 0.5\\n0.4 0.6\\n' > \"$2.$1.Q\"\n\
                 touch \"$2.nosex\"\n"
            ),
        );
        let converter = write_script(
            &scripts,
            "convert.sh",
            &format!("{record}printf 'converted\\n' > \"$1/dataset.recode.strct_in\"\n"),
        );
        let structure = write_script(
            &scripts,
            "structure.sh",
            &format!(
                "{record}test -s \"$2\" && test -s \"$3\" || exit 3\n\
                 printf 'Estimated Ln Prob of Data   = -10%s.5\\n\\n\
                 Inferred ancestry of individuals:\\n\
                 \x20       Label (%%Miss) Pop:  Inferred clusters\\n\
                 \x20 1 ind1 (0) 1 :  0.25 0.75\\n\
                 \x20 2 ind2 (0) 1 :  0.60 0.40\\n\\n' \"$1\" > structure_out_f\n"
            ),
        );
        let clumpak = write_script(
            &scripts,
            "clumpak.sh",
            &format!(
                "{record}ls \"$2/K$1\" > inputs.txt || exit 2\n\
                 mkdir -p MajorCluster/CLUMPP.files\n\
                 printf '  1  1 (0) 1 : 0.3 0.7\\n  2  2 (0) 1 : 0.5 0.5\\n' \
                 > MajorCluster/CLUMPP.files/ClumppIndFile.output\n"
            ),
        );
        let reporter = write_script(
            &scripts,
            "report.sh",
            &format!("{record}touch \"$1/plot.png\"\n"),
        );

        let tools = json!({
            "schema_version": 1,
            "admixture": {
                "executable": sh_command(&admixture),
                "args": ["{k}", "{stem}"],
                "primary_output": "{stem}.{k}.Q",
                "metric": {
                    "name": "cv_error",
                    "pattern": r"CV error \(K=\d+\):\s*([-+0-9.eE]+)"
                }
            },
            "converter": {
                "executable": sh_command(&converter),
                "args": ["{output_dir}"],
                "primary_output": "dataset.recode.strct_in"
            },
            "structure": {
                "executable": sh_command(&structure),
                "args": ["{k}", "{mainparams}", "{input}"],
                "primary_output": "structure_out_f",
                "metric": {
                    "name": "ln_prob",
                    "pattern": r"Estimated Ln Prob of Data\s*=\s*([-+0-9.eE]+)",
                    "source": "artifact"
                }
            },
            "clumpak": {
                "executable": sh_command(&clumpak),
                "args": ["{k}", "{input_dir}"],
                "primary_output": "MajorCluster/CLUMPP.files/ClumppIndFile.output"
            },
            "reporter": {
                "executable": sh_command(&reporter),
                "args": ["{output_dir}"]
            }
        });

        Self { dir, tools }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn prefix(&self) -> PathBuf {
        self.root().join("data/cohort")
    }

    pub fn output_base(&self) -> PathBuf {
        self.root().join("results")
    }

    /// Point one tool entry at a program that does not exist.
    pub fn break_tool(&mut self, name: &str) {
        self.tools[name]["executable"] = json!("definitely-not-installed-tool");
    }

    /// Lines appended by the stand-in scripts, in invocation order.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.root().join("invocations.log"))
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn invocations_of(&self, script: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|line| line.contains(script))
            .count()
    }

    /// Run the binary with `prefix min_k max_k` followed by `extra`.
    pub fn run(&self, min_k: u32, max_k: u32, extra: &[&str]) -> RunResult {
        let tools_path = self.root().join("tools.json");
        fs::write(
            &tools_path,
            serde_json::to_string_pretty(&self.tools).expect("tools json"),
        )
        .expect("write tools.json");

        let output: Output = Command::new(env!("CARGO_BIN_EXE_ancestry-pipeline"))
            .arg(self.prefix())
            .arg(min_k.to_string())
            .arg(max_k.to_string())
            .arg("--output-base")
            .arg(self.output_base())
            .arg("--tools-config")
            .arg(&tools_path)
            .arg("--structure-runs")
            .arg("2")
            .args(extra)
            .env_remove("RUST_LOG")
            .output()
            .expect("spawn ancestry-pipeline");
        RunResult {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }

    pub fn read_output(&self, relative: &str) -> String {
        let path = self.output_base().join(relative);
        fs::read_to_string(&path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
    }

    pub fn output_files(&self, relative: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.output_base().join(relative))
            .map(|entries| {
                entries
                    .flatten()
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn write_dataset(prefix: &Path) {
    fs::create_dir_all(prefix.parent().expect("prefix parent")).expect("data dir");
    let fam: String = (0..SAMPLES)
        .map(|idx| format!("fam{idx} ind{idx} 0 0 1 -9\n"))
        .collect();
    let bim: String = (0..VARIANTS)
        .map(|idx| format!("1 rs{idx} 0 {} A G\n", 1000 + idx))
        .collect();
    let mut bed = BED_MAGIC.to_vec();
    bed.resize(BED_MAGIC.len() + VARIANTS * SAMPLES.div_ceil(4), 0);
    fs::write(prefix.with_extension("fam"), fam).expect("fam");
    fs::write(prefix.with_extension("bim"), bim).expect("bim");
    fs::write(prefix.with_extension("bed"), bed).expect("bed");
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    path
}

/// Scripts are run through `sh` so they never need the executable bit.
fn sh_command(script: &Path) -> String {
    format!("sh {}", shell_words::quote(&script.display().to_string()))
}
