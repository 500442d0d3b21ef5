//! Query validation and relation desugaring.

pub mod relations;
pub mod validate;

pub use validate::validate_query;
