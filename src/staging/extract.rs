//! Pull the per-individual ancestry proportions out of a STRUCTURE results
//! file.
//!
//! The section looks like:
//!
//! ```text
//! Inferred ancestry of individuals:
//!         Label (%Miss) Pop:  Inferred clusters
//!   1      ind1    (0)    1 :  0.012 0.988
//!   2      ind2    (0)    1 :  0.501 0.499
//! ```
//!
//! Each row becomes one line of the Q matrix. The original number tokens are
//! kept as written.
use anyhow::{bail, Result};

const SECTION_HEADER: &str = "Inferred ancestry of individuals:";

pub fn extract_ancestry_matrix(text: &str) -> Result<String> {
    let Some(start) = text.find(SECTION_HEADER) else {
        bail!("no \"{SECTION_HEADER}\" section");
    };
    individual_rows_matrix(&text[start + SECTION_HEADER.len()..])
}

/// Q matrix from the first block of individual rows in `text`. CLUMPP writes
/// its aligned individual file in this row layout without a section header.
pub fn individual_rows_matrix(text: &str) -> Result<String> {
    let mut rows: Vec<Vec<&str>> = Vec::new();
    for line in text.lines() {
        match parse_row(line) {
            Some(values) => rows.push(values),
            // Column headings and blank lines before the first row.
            None if rows.is_empty() => continue,
            None => break,
        }
    }
    if rows.is_empty() {
        bail!("no individual rows found");
    }
    let columns = rows[0].len();
    if let Some(position) = rows.iter().position(|row| row.len() != columns) {
        bail!(
            "row {} has {} clusters, expected {columns}",
            position + 1,
            rows[position].len()
        );
    }

    let mut matrix = String::new();
    for row in rows {
        matrix.push_str(&row.join(" "));
        matrix.push('\n');
    }
    Ok(matrix)
}

/// Proportions of one individual row, or `None` for anything else.
fn parse_row(line: &str) -> Option<Vec<&str>> {
    let trimmed = line.trim();
    let index = trimmed.split_whitespace().next()?;
    index.parse::<u64>().ok()?;
    let (_, after_colon) = trimmed.split_once(':')?;
    // Prior population probabilities follow a '|' when USEPOPINFO is on.
    let proportions = after_colon.split('|').next().unwrap_or_default();
    let values: Vec<&str> = proportions.split_whitespace().collect();
    if values.is_empty() || values.iter().any(|value| value.parse::<f64>().is_err()) {
        return None;
    }
    Some(values)
}
