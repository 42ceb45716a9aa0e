//! Recovering patch records from an original/patched image pair.

use log::{debug, info};
use snafu::ensure;

use crate::error::{Result, SizeMismatchSnafu};
use crate::ledger::PatchRecord;

/// One record per section of differing bytes.
///
/// Runs of at most `max_gap` unchanged bytes between two differences are
/// folded into the surrounding section instead of splitting it. Applying
/// every record to `original` yields `patched`.
pub fn diff_images(original: &[u8], patched: &[u8], max_gap: usize) -> Result<Vec<PatchRecord>> {
    ensure!(
        original.len() == patched.len(),
        SizeMismatchSnafu {
            left: original.len(),
            right: patched.len(),
        }
    );

    let mut sections: Vec<(usize, usize)> = Vec::new();
    for (i, (a, b)) in original.iter().zip(patched).enumerate() {
        if a == b {
            continue;
        }
        match sections.last_mut() {
            Some((_, end)) if i - *end <= max_gap => *end = i + 1,
            _ => {
                debug!("starting section {} at 0x{:x}", sections.len(), i);
                sections.push((i, i + 1));
            }
        }
    }
    info!("sections found: {}", sections.len());

    Ok(sections
        .into_iter()
        .enumerate()
        .map(|(n, (start, end))| PatchRecord {
            name: format!("section_{}", n),
            offset: start,
            pre: original[start..end].to_vec(),
            post: patched[start..end].to_vec(),
        })
        .collect())
}
