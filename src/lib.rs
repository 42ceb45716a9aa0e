//! Signature search and size-preserving patching for motor-controller
//! firmware images.
//!
//! The core is two calls: [`find`] locates a byte [`Pattern`] (with
//! wildcards) in an image, and [`apply`] overwrites bytes in place and
//! returns a [`PatchRecord`] that can be audited or reverted. The
//! [`recipes`] module builds named features on top of them.
//!
//! ```
//! use fwpatch::{apply, find, pattern};
//!
//! let mut image = vec![0x00, 0x40, 0x1c, 0x10, 0x28, 0x05, 0xdb, 0x00, 0x20];
//! let ofs = find(&image, &pattern![0x40, 0x1c, 0x10, 0x28, _, 0xdb], 0)? + 6;
//! let record = apply(&mut image, "skip", ofs, &[0x03, 0xe0])?;
//! assert_eq!(record.pre, [0x00, 0x20]);
//!
//! apply(&mut image, "skip", ofs, &record.pre)?;
//! assert_eq!(&image[ofs..], [0x00, 0x20]);
//! # Ok::<(), fwpatch::Error>(())
//! ```

pub mod asm;
pub mod diff;
mod error;
pub mod ledger;
pub mod matcher;
pub mod model;
pub mod pattern;
pub mod recipes;

pub use asm::{Assembler, EncodeError, Thumb};
pub use error::{Error, Result};
pub use ledger::{apply, revert, Ledger, PatchRecord};
pub use matcher::{find, find_iter, Cursor};
pub use model::Model;
pub use pattern::Pattern;
pub use recipes::{Feature, Patcher};
