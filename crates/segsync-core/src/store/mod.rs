// # Table Store Implementations
//
// This module provides implementations of the TableStore trait for
// different persistence strategies.

pub mod file;
pub mod memory;

pub use file::{FileTableStore, FileTableStoreFactory};
pub use memory::{MemoryTableStore, MemoryTableStoreFactory};
