#![no_main]
use libfuzzer_sys::fuzz_target;

use l2ra::{parser, test_framework as ir};

fuzz_target!(|prog: ir::Program| {
    let printed = prog.to_string();

    let parsed = match parser::parse_program(&printed) {
        Ok(p) => p,
        Err(e) => panic!("parser error: {}\n{}", e.to_string(), printed),
    };
    let reprinted = parsed.to_string();
    assert_eq!(printed, reprinted);

    let reparsed = match parser::parse_program(&reprinted) {
        Ok(p) => p,
        Err(e) => panic!("shouldn't error on the second parse: {}", e.to_string()),
    };
    assert_eq!(reprinted, reparsed.to_string());
});
