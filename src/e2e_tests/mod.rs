//! End-to-end tests of the shim over exported local directories

pub mod test_context;

// Test scenario modules
pub mod delete_operations;
pub mod directory_operations;
pub mod file_operations;
pub mod process_operations;
pub mod rename_operations;
pub mod scenarios;

pub use test_context::TestContext;
