use snafu::Snafu;

use crate::asm::EncodeError;
use crate::model::Model;
use crate::pattern::Pattern;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("signature {} not found at or after 0x{:x}", pattern, start))]
    SignatureNotFound { pattern: Pattern, start: usize },

    #[snafu(display(
        "{} bytes at 0x{:x} exceed image of {} bytes",
        len,
        offset,
        image_len
    ))]
    OutOfBounds {
        offset: usize,
        len: usize,
        image_len: usize,
    },

    #[snafu(display("instruction encoding failed: {}", source))]
    Encoding { source: EncodeError },

    #[snafu(display("{} already applied at 0x{:x}", name, offset))]
    AlreadyPatched { name: String, offset: usize },

    #[snafu(display("{} is not applied at 0x{:x}, refusing to revert", name, offset))]
    NotApplied { name: String, offset: usize },

    #[snafu(display(
        "{}: replacement is {} bytes, target is {} bytes",
        name,
        actual,
        expected
    ))]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[snafu(display("invalid pattern: {}", reason))]
    InvalidPattern { reason: String },

    #[snafu(display("{} is not supported on {}", feature, model))]
    Unsupported { feature: String, model: Model },

    #[snafu(display("encryption data not found"))]
    MissingEncryptionData,

    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: String },

    #[snafu(display("image sizes differ: {} vs {} bytes", left, right))]
    SizeMismatch { left: usize, right: usize },

    #[snafu(display("ledger json: {}", source))]
    LedgerJson { source: serde_json::Error },

    #[snafu(display("ledger bincode: {}", source))]
    LedgerBincode { source: bincode::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
