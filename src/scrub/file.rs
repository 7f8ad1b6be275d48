use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};

use super::engine::scrub_text;
use super::patterns::MERGED;
use super::tokenizer::Tokenizer;
use crate::error::{Error, Result};
use crate::sandbox::PathSandbox;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileScrubSummary {
    pub lines_processed: usize,
    pub items_scrubbed: usize,
    pub summary: BTreeMap<String, usize>,
}

/// Scrub a file line by line.
///
/// Both names are resolved through the sandbox here: the tool server is
/// the path authority and does not trust its caller. One tokenizer is
/// shared across the whole file so a value repeated on different lines
/// maps to a single placeholder.
pub fn scrub_file(
    sandbox: &PathSandbox,
    input_name: &str,
    output_name: &str,
    item_types: &[String],
) -> Result<FileScrubSummary> {
    let input = sandbox.resolve(input_name, "in")?;
    let output = sandbox.resolve(output_name, "out")?;

    if !input.exists() {
        return Err(Error::NotFound(format!("Input file not found: {input_name}")));
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let bytes = fs::read(&input)?;
    let text = String::from_utf8_lossy(&bytes);

    let mut tokenizer = Tokenizer::new();
    let mut lines_processed = 0;
    let mut items_scrubbed = 0;
    let mut total_summary: BTreeMap<String, usize> = BTreeMap::new();
    let mut scrubbed = String::with_capacity(text.len());

    for line in text.split_inclusive('\n') {
        lines_processed += 1;
        let outcome = scrub_text(line, item_types, &MERGED, &mut tokenizer);
        items_scrubbed += outcome.replacements.len();
        for (item_type, count) in outcome.summary {
            *total_summary.entry(item_type).or_insert(0) += count;
        }
        scrubbed.push_str(&outcome.sanitized_text);
    }

    fs::write(&output, scrubbed)?;

    Ok(FileScrubSummary {
        lines_processed,
        items_scrubbed,
        summary: total_summary,
    })
}
