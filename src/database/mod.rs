//! Object reads and writes with ACL, permission and relation handling.

pub mod controller;
pub mod operators;
pub mod permissions;

pub use controller::{DatabaseController, FindOptions, UpdateOptions};
