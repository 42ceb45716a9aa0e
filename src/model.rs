use std::fmt;
use std::str::FromStr;

use crate::error::{Error, InvalidArgumentSnafu};

/// Supported controller hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    G2,
    G3,
    Zt3Pro,
    Max4,
    Plus4,
    F2,
    F2Plus,
    F2Pro,
}

impl Model {
    pub const ALL: [Model; 8] = [
        Model::G2,
        Model::G3,
        Model::Zt3Pro,
        Model::Max4,
        Model::Plus4,
        Model::F2,
        Model::F2Plus,
        Model::F2Pro,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Model::G2 => "g2",
            Model::G3 => "g3",
            Model::Zt3Pro => "zt3pro",
            Model::Max4 => "4max",
            Model::Plus4 => "4plus",
            Model::F2 => "f2",
            Model::F2Plus => "f2plus",
            Model::F2Pro => "f2pro",
        }
    }

    /// 4max and 4plus share most of their firmware layout.
    pub fn is_four_series(self) -> bool {
        matches!(self, Model::Max4 | Model::Plus4)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Model {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Model::ALL
            .iter()
            .copied()
            .find(|m| m.id() == s)
            .ok_or_else(|| {
                InvalidArgumentSnafu {
                    reason: format!("unknown model {:?}", s),
                }
                .build()
            })
    }
}
