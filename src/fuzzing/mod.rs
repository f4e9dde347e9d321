/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Test cases and checkers shared by the fuzz targets and the benches.

pub mod interval_tree;
pub mod moves;
pub mod stack_walk;

pub use arbitrary;
pub use libfuzzer_sys::fuzz_target;
