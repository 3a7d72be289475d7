//! Header validation for the SPV sync engines.

mod header;

pub use header::{check_checkpoint, check_header_sanity, BlockHeaderValidator};

use crate::error::ValidationResult;

pub trait Validator<T> {
    fn validate(&self, data: T) -> ValidationResult<()>;
}
