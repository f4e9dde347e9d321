/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

#![no_main]
use liveregs::fuzzing::fuzz_target;
use liveregs::fuzzing::stack_walk::{check, TestCase};

fuzz_target!(|testcase: TestCase| {
    let _ = env_logger::try_init();
    check(testcase);
});
