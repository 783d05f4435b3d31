#![no_main]
use libfuzzer_sys::fuzz_target;

use l2ra::test_framework as ir;
use l2regalloc::{self, RegUniverse};

fuzz_target!(|prog: ir::Program| {
    let mut prog = prog;
    let univ = RegUniverse::x86_64();

    let expected = ir::run_program(&prog, &univ, &[], ir::DEFAULT_STEP_BUDGET);
    print!("{}", prog);

    let opts = l2regalloc::Options { run_checker: true };
    if let Err((func, err)) = prog.allocate(&univ, opts) {
        if let l2regalloc::RegAllocError::RegChecker(_) = &err {
            panic!("alloc_differential.rs: checker error in ':{}': {:?}", func, err);
        }
        println!("allocation error in ':{}': {}", func, err.to_string());
        return;
    }
    print!("{}", prog);

    let observed = ir::run_program(&prog, &univ, &[], ir::DEFAULT_STEP_BUDGET);
    if let Err(msg) = ir::check_results(&expected, &observed) {
        panic!("alloc_differential.rs: {}", msg);
    }
});
