//! Size-preserving byte substitution and the records it leaves behind.

use hex_buffer_serde::{Hex as _, HexForm};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};

use crate::error::{
    LedgerBincodeSnafu, LedgerJsonSnafu, NotAppliedSnafu, OutOfBoundsSnafu, Result,
};

/// One applied substitution. `pre` and `post` always have the same length.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct PatchRecord {
    pub name: String,
    pub offset: usize,
    #[serde(with = "HexForm")]
    pub pre: Vec<u8>,
    #[serde(with = "HexForm")]
    pub post: Vec<u8>,
}

impl PatchRecord {
    pub fn len(&self) -> usize {
        self.post.len()
    }

    pub fn is_empty(&self) -> bool {
        self.post.is_empty()
    }

    /// The record that undoes this one.
    pub fn reversed(&self) -> PatchRecord {
        PatchRecord {
            name: self.name.clone(),
            offset: self.offset,
            pre: self.post.clone(),
            post: self.pre.clone(),
        }
    }

    /// Whether `image` currently holds `post` at `offset`.
    pub fn is_applied(&self, image: &[u8]) -> bool {
        span(image, self.offset, self.post.len())
            .map_or(false, |current| current == self.post.as_slice())
    }
}

fn span(image: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    image.get(offset..offset.checked_add(len)?)
}

/// Overwrites `image[offset..offset + new_bytes.len()]` with `new_bytes`.
///
/// Nothing is written when the span does not fit inside the image.
pub fn apply(image: &mut [u8], name: &str, offset: usize, new_bytes: &[u8]) -> Result<PatchRecord> {
    let image_len = image.len();
    let target = offset
        .checked_add(new_bytes.len())
        .and_then(|end| image.get_mut(offset..end))
        .context(OutOfBoundsSnafu {
            offset,
            len: new_bytes.len(),
            image_len,
        })?;

    let pre = target.to_vec();
    target.copy_from_slice(new_bytes);
    debug!(
        "{} @ 0x{:x}: {} -> {}",
        name,
        offset,
        hex::encode(&pre),
        hex::encode(new_bytes)
    );

    Ok(PatchRecord {
        name: name.to_owned(),
        offset,
        pre,
        post: new_bytes.to_vec(),
    })
}

/// Undoes `record`, provided its `post` bytes are still in place.
pub fn revert(image: &mut [u8], record: &PatchRecord) -> Result<PatchRecord> {
    ensure!(
        record.is_applied(image),
        NotAppliedSnafu {
            name: record.name.clone(),
            offset: record.offset,
        }
    );
    apply(image, &record.name, record.offset, &record.pre)
}

/// Ordered collection of applied patches.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
pub struct Ledger {
    pub records: Vec<PatchRecord>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &mut self,
        image: &mut [u8],
        name: &str,
        offset: usize,
        new_bytes: &[u8],
    ) -> Result<&PatchRecord> {
        let record = apply(image, name, offset, new_bytes)?;
        self.records.push(record);
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = PatchRecord>) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PatchRecord> {
        self.records.iter()
    }

    /// Undo every record, newest first. Stops at the first record whose
    /// bytes are no longer in place; records reverted before that stay
    /// reverted.
    pub fn revert(&self, image: &mut [u8]) -> Result<Vec<PatchRecord>> {
        self.records
            .iter()
            .rev()
            .map(|record| revert(image, record))
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context(LedgerJsonSnafu)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context(LedgerJsonSnafu)
    }

    pub fn to_bincode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context(LedgerBincodeSnafu)
    }

    pub fn from_bincode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context(LedgerBincodeSnafu)
    }
}

impl<'a> IntoIterator for &'a Ledger {
    type Item = &'a PatchRecord;
    type IntoIter = std::slice::Iter<'a, PatchRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<PatchRecord> for Ledger {
    fn from_iter<I: IntoIterator<Item = PatchRecord>>(iter: I) -> Self {
        Ledger {
            records: iter.into_iter().collect(),
        }
    }
}
