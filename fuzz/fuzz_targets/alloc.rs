#![no_main]
use libfuzzer_sys::fuzz_target;

use l2ra::{test_framework as ir, validator};
use l2regalloc::{self, RegUniverse};

fuzz_target!(|prog: ir::Program| {
    let mut prog = prog;
    let univ = RegUniverse::x86_64();

    if let Err(msg) = validator::validate(&prog, &univ) {
        panic!("alloc.rs: generated an invalid program: {}\n{}", msg, prog);
    }

    let opts = l2regalloc::Options { run_checker: true };
    if let Err((func, err)) = prog.allocate(&univ, opts) {
        if let l2regalloc::RegAllocError::RegChecker(_) = &err {
            panic!("alloc.rs: checker error in ':{}': {:?}", func, err);
        }
        println!("allocation error in ':{}': {}", func, err.to_string());
    }
});
