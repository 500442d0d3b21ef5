//! Shared value, ACL and identity types.

pub mod acl;
pub mod identity;
pub mod value;

pub use acl::{transform_object_acl, untransform_object_acl};
pub use identity::{AclGroup, Caller};
pub use value::{ObjectMap, Value};
