//! Binary PLINK dataset addressed by a path prefix.
//!
//! The orchestrator never parses genotypes; it only needs the three companion
//! files, their record counts, and the genotype file size.
use crate::util::absolute_path;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

/// Leading bytes of a SNP-major PLINK `.bed` file.
pub const BED_MAGIC: [u8; 3] = [0x6c, 0x1b, 0x01];

#[derive(Debug, Clone)]
pub struct Dataset {
    prefix: PathBuf,
}

/// Measured size of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub prefix: String,
    pub samples: u64,
    pub variants: u64,
    pub genotype_bytes: u64,
}

impl Dataset {
    /// Anchor the prefix to the current directory so tools running in their
    /// own working directories still find the files.
    pub fn from_prefix(prefix: &Path) -> Result<Self> {
        Ok(Self {
            prefix: absolute_path(prefix)?,
        })
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// File name of the prefix, used by tools that name outputs after it.
    pub fn stem(&self) -> String {
        self.prefix
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn genotype_path(&self) -> PathBuf {
        self.with_extension("bed")
    }

    pub fn variant_index_path(&self) -> PathBuf {
        self.with_extension("bim")
    }

    pub fn sample_index_path(&self) -> PathBuf {
        self.with_extension("fam")
    }

    pub fn companion_paths(&self) -> [PathBuf; 3] {
        [
            self.genotype_path(),
            self.variant_index_path(),
            self.sample_index_path(),
        ]
    }

    // Appends rather than replaces so prefixes containing dots stay intact.
    fn with_extension(&self, ext: &str) -> PathBuf {
        let mut raw = self.prefix.clone().into_os_string();
        raw.push(".");
        raw.push(ext);
        PathBuf::from(raw)
    }

    pub fn measure(&self) -> Result<DatasetStats> {
        let genotype = self.genotype_path();
        let genotype_bytes = fs::metadata(&genotype)
            .with_context(|| format!("stat {}", genotype.display()))?
            .len();
        Ok(DatasetStats {
            prefix: self.prefix.display().to_string(),
            samples: count_records(&self.sample_index_path())?,
            variants: count_records(&self.variant_index_path())?,
            genotype_bytes,
        })
    }

    /// Compare the genotype size against the record counts. Returns a
    /// description of the mismatch, or `None` when consistent or when the
    /// file is not a SNP-major PLINK matrix.
    pub fn consistency_issue(&self, stats: &DatasetStats) -> Result<Option<String>> {
        let genotype = self.genotype_path();
        let mut header = [0u8; 3];
        let mut file =
            fs::File::open(&genotype).with_context(|| format!("open {}", genotype.display()))?;
        let read = file
            .read(&mut header)
            .with_context(|| format!("read {}", genotype.display()))?;
        if read < header.len() || header != BED_MAGIC {
            return Ok(None);
        }
        let expected = expected_genotype_bytes(stats.samples, stats.variants);
        if expected == stats.genotype_bytes {
            return Ok(None);
        }
        Ok(Some(format!(
            "{} is {} bytes but {} samples x {} variants needs {} bytes",
            genotype.display(),
            stats.genotype_bytes,
            stats.samples,
            stats.variants,
            expected
        )))
    }
}

/// Size of a SNP-major `.bed` file: magic header plus one padded row of
/// two-bit genotypes per variant.
pub fn expected_genotype_bytes(samples: u64, variants: u64) -> u64 {
    BED_MAGIC.len() as u64 + samples.div_ceil(4) * variants
}

/// Count non-blank lines. Lines are scanned as bytes, so identifiers in a
/// legacy encoding still count.
pub fn count_records(path: &Path) -> Result<u64> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut count = 0;
    for line in BufReader::new(file).split(b'\n') {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if !line.trim_ascii().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}
