//! Byte signatures with wildcard positions.

use std::fmt;
use std::str::FromStr;

use crate::error::{InvalidPatternSnafu, Result};

/// Builds a [`Pattern`] from byte literals, `_` marks a wildcard.
///
/// ```
/// use fwpatch::pattern;
///
/// let sig = pattern![0x40, 0x1c, 0x10, 0x28, _, 0xdb];
/// assert_eq!(sig.len(), 6);
/// ```
#[macro_export]
macro_rules! pattern {
    (@byte _) => { ::core::option::Option::None };
    (@byte $b:literal) => { ::core::option::Option::Some($b as u8) };
    ($($b:tt),+ $(,)?) => {
        $crate::pattern::Pattern::__literal(::std::vec![$($crate::pattern!(@byte $b)),+])
    };
}

/// An ordered run of byte matchers; `None` matches any byte.
///
/// A pattern is never empty.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pattern(Vec<Option<u8>>);

impl Pattern {
    pub fn new(matchers: Vec<Option<u8>>) -> Result<Self> {
        snafu::ensure!(
            !matchers.is_empty(),
            InvalidPatternSnafu {
                reason: "pattern is empty"
            }
        );
        Ok(Pattern(matchers))
    }

    /// A pattern without wildcards, typically the output of an assembler.
    pub fn exact(bytes: &[u8]) -> Result<Self> {
        Self::new(bytes.iter().copied().map(Some).collect())
    }

    #[doc(hidden)]
    pub fn __literal(matchers: Vec<Option<u8>>) -> Self {
        debug_assert!(!matchers.is_empty());
        Pattern(matchers)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matchers(&self) -> &[Option<u8>] {
        &self.0
    }

    /// `window` must be exactly `self.len()` bytes long.
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.0.len()
            && self
                .0
                .iter()
                .zip(window)
                .all(|(m, &b)| m.map_or(true, |v| v == b))
    }
}

impl FromStr for Pattern {
    type Err = crate::Error;

    /// Accepts `"18 78 ?? D1"` as well as packed `"1878XXD1"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut matchers = Vec::new();
        for token in s.split_whitespace() {
            if token == "?" || token == "??" {
                matchers.push(None);
                continue;
            }
            snafu::ensure!(
                token.is_ascii() && token.len() % 2 == 0,
                InvalidPatternSnafu {
                    reason: format!("odd number of hex digits in {:?}", token)
                }
            );
            for pair in token.as_bytes().chunks(2) {
                // ascii was checked above
                let pair = std::str::from_utf8(pair).unwrap_or_default();
                if pair == "??" || pair.eq_ignore_ascii_case("xx") {
                    matchers.push(None);
                } else {
                    let byte = u8::from_str_radix(pair, 16).map_err(|_| {
                        InvalidPatternSnafu {
                            reason: format!("invalid hex byte {:?}", pair),
                        }
                        .build()
                    })?;
                    matchers.push(Some(byte));
                }
            }
        }
        Self::new(matchers)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match m {
                Some(b) => write!(f, "{:02X}", b)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self)
    }
}
