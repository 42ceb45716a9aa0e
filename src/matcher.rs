//! First-match signature search over an image.

use log::{debug, trace};

use crate::error::{Result, SignatureNotFoundSnafu};
use crate::pattern::Pattern;

/// Offset of the first match of `pattern` at or after `start`.
///
/// A `start` past the last position the pattern could fit at is an empty
/// search space and reports `SignatureNotFound`.
pub fn find(image: &[u8], pattern: &Pattern, start: usize) -> Result<usize> {
    trace!("searching {} from 0x{:x}", pattern, start);
    match scan(image, pattern, start) {
        Some(offset) => Ok(offset),
        None => {
            debug!("signature {} not found from 0x{:x}", pattern, start);
            SignatureNotFoundSnafu {
                pattern: pattern.clone(),
                start,
            }
            .fail()
        }
    }
}

fn scan(image: &[u8], pattern: &Pattern, start: usize) -> Option<usize> {
    let len = pattern.len();
    if len == 0 || start.checked_add(len)? > image.len() {
        return None;
    }
    image[start..]
        .windows(len)
        .position(|window| pattern.matches(window))
        .map(|i| start + i)
}

/// All matches of `pattern` from `start` on, lazily.
///
/// Each match resumes the scan one byte further, so overlapping
/// occurrences are all reported.
pub fn find_iter<'a>(image: &'a [u8], pattern: &Pattern, start: usize) -> Matches<'a> {
    Matches {
        image,
        cursor: Cursor::new(pattern.clone(), start),
    }
}

pub struct Matches<'a> {
    image: &'a [u8],
    cursor: Cursor,
}

impl Iterator for Matches<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.cursor.next_in(self.image)
    }
}

/// A restartable match sequence that does not borrow the image.
///
/// Lets a caller patch the image between matches:
///
/// ```
/// use fwpatch::{matcher::Cursor, pattern};
///
/// let mut image = vec![0x0f, 0x20, 0x00, 0x0f, 0x20];
/// let mut cursor = Cursor::new(pattern![0x0f, 0x20], 0);
/// while let Some(ofs) = cursor.next_in(&image) {
///     image[ofs] = 0x14;
/// }
/// assert_eq!(image, [0x14, 0x20, 0x00, 0x14, 0x20]);
/// ```
#[derive(Debug, Clone)]
pub struct Cursor {
    pattern: Pattern,
    next: usize,
    done: bool,
}

impl Cursor {
    pub fn new(pattern: Pattern, start: usize) -> Self {
        Cursor {
            pattern,
            next: start,
            done: false,
        }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Next match at or after the current position; `None` once the
    /// signature runs out.
    pub fn next_in(&mut self, image: &[u8]) -> Option<usize> {
        if self.done {
            return None;
        }
        match find(image, &self.pattern, self.next) {
            Ok(offset) => {
                self.next = offset + 1;
                Some(offset)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }

    /// Restart the sequence at `offset`.
    pub fn seek(&mut self, offset: usize) {
        self.next = offset;
        self.done = false;
    }
}
