/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Built-in test programs, runnable by name from the command line.

use crate::parser::parse_program;
use crate::test_framework::Program;

pub struct TestCase {
  pub name: &'static str,
  pub program: Program,
  /// Fed to `call input`.
  pub input: Vec<i64>,
  /// What the program prints.
  pub expected: Vec<String>,
}

struct Source {
  name: &'static str,
  text: String,
  input: &'static [i64],
  expected: &'static [&'static str],
}

fn src(
  name: &'static str, text: &str, input: &'static [i64],
  expected: &'static [&'static str],
) -> Source {
  Source { name, text: text.to_string(), input, expected }
}

// Twenty values, all live across a call and then summed.
fn pressure() -> String {
  let mut s = String::from("(:main\n(:main 0\n");
  for i in 0..20 {
    s.push_str(&format!("  %v{} <- {}\n", i, 3 * i));
  }
  s.push_str("  rdi <- 1\n  call print 1\n  %acc <- 0\n");
  for i in 0..20 {
    s.push_str(&format!("  %acc += %v{}\n", i));
  }
  s.push_str("  rdi <- %acc\n  rdi <<= 1\n  rdi++\n  call print 1\n  return))\n");
  s
}

fn sources() -> Vec<Source> {
  vec![
    src(
      "no_vars",
      "(:main
        (:main 0
          rdi <- 11
          call print 1
          rax <- 0
          return))",
      &[],
      &["5"],
    ),
    src(
      "simple_loop",
      "(:main
        (:main 0
          %sum <- 0
          %i <- 1
          :loop
          %sum += %i
          %i++
          cjump %i <= 10 :loop
          rdi <- %sum
          rdi <<= 1
          rdi++
          call print 1
          return))",
      &[],
      &["55"],
    ),
    Source { name: "pressure", text: pressure(), input: &[], expected: &["0", "570"] },
    src(
      "calls",
      "(:main
        (:main 0
          %a <- 5
          %b <- 7
          rdi <- %a
          rsi <- %b
          rdx <- 100
          mem rsp -8 <- :ret1
          call :add3 3
          :ret1
          %r <- rax
          rdi <- %r
          rsi <- %a
          rdx <- %b
          mem rsp -8 <- :ret2
          call :add3 3
          :ret2
          rdi <- rax
          rdi <<= 1
          rdi++
          call print 1
          rdi <- %r
          rdi <<= 1
          rdi++
          call print 1
          return)
        (:add3 3
          %x <- rdi
          %x += rsi
          %x += rdx
          rax <- %x
          return))",
      &[],
      &["124", "112"],
    ),
    src(
      "stack_args",
      "(:main
        (:main 0
          rdi <- 1 rsi <- 2 rdx <- 3 rcx <- 4 r8 <- 5 r9 <- 6
          mem rsp -16 <- 7
          mem rsp -24 <- 8
          mem rsp -8 <- :ret
          call :sum8 8
          :ret
          rdi <- rax
          rdi <<= 1
          rdi++
          call print 1
          return)
        (:sum8 8
          %s <- rdi
          %s += rsi
          %s += rdx
          %s += rcx
          %s += r8
          %s += r9
          %a7 <- stack-arg 8
          %a8 <- stack-arg 0
          %s += %a7
          %s += %a8
          rax <- %s
          return))",
      &[],
      &["36"],
    ),
    src(
      "shifts",
      "(:main
        (:main 0
          %x <- 3
          %n <- 4
          %x <<= %n
          %y <- %x
          %y >>= 2
          rdi <- %x
          rdi += %y
          rdi <<= 1
          rdi++
          call print 1
          return))",
      &[],
      &["60"],
    ),
    src(
      "arrays",
      "(:main
        (:main 0
          rdi <- 9      // four elements
          rsi <- 1      // all zero
          call allocate 2
          %arr <- rax
          %i <- 0
          :fill
          %v <- %i
          %v <<= 1
          %v++
          %addr @ %arr %i 8
          mem %addr 8 <- %v
          %i++
          cjump %i < 4 :fill
          %p <- mem %arr 24
          %p += 2
          mem %arr 24 <- %p
          rdi <- %arr
          call print 1
          return))",
      &[],
      &["{s:4, 0, 1, 3, 3}"],
    ),
    src(
      "fib",
      "(:main
        (:main 0
          rdi <- 10
          mem rsp -8 <- :done
          call :fib 1
          :done
          rdi <- rax
          rdi <<= 1
          rdi++
          call print 1
          return)
        (:fib 1
          %n <- rdi
          cjump %n <= 1 :base
          rdi <- %n
          rdi--
          mem rsp -8 <- :r1
          call :fib 1
          :r1
          %a <- rax
          rdi <- %n
          rdi -= 2
          mem rsp -8 <- :r2
          call :fib 1
          :r2
          rax += %a
          return
          :base
          rax <- %n
          return))",
      &[],
      &["55"],
    ),
    src(
      "indirect",
      "(:main
        (:main 0
          %f <- :twice
          rdi <- 21
          mem rsp -8 <- :back
          call %f 1
          :back
          %r <- rax
          %c <- %r = 42
          %d <- %r < 10
          mem rsp -16 <- 0
          mem rsp -16 += %r
          mem rsp -16 -= 2
          %m <- mem rsp -16
          %m += %c
          %m += %d
          rdi <- %m
          rdi <<= 1
          rdi++
          call print 1
          return)
        (:twice 1
          %v <- rdi
          %v *= 2
          %v &= 255
          rax <- %v
          return))",
      &[],
      &["41"],
    ),
    src(
      "input",
      "(:main
        (:main 0
          call input 0
          %a <- rax
          call input 0
          %b <- rax
          %a >>= 1
          %b >>= 1
          %a *= %b
          %a <<= 1
          %a++
          rdi <- %a
          call print 1
          return))",
      &[6, 7],
      &["42"],
    ),
    src(
      "tensor_error",
      "(:main
        (:main 0
          %x <- 7
          rdi <- %x
          call print 1
          rdi <- %x
          rsi <- 5
          rdx <- 9
          call tensor-error 3
          return))",
      &[],
      &["3"],
    ),
  ]
}

pub fn case_names() -> Vec<&'static str> {
  sources().iter().map(|s| s.name).collect()
}

/// The named test case, or the names of all of them if there is no such
/// case.
pub fn find_case(name: &str) -> Result<TestCase, Vec<&'static str>> {
  let source = match sources().into_iter().find(|s| s.name == name) {
    Some(s) => s,
    None => return Err(case_names()),
  };
  let program = match parse_program(&source.text) {
    Ok(p) => p,
    Err(e) => panic!("find_case: built-in case '{}' does not parse: {}", name, e.to_string()),
  };
  Ok(TestCase {
    name: source.name,
    program,
    input: source.input.to_vec(),
    expected: source.expected.iter().map(|s| s.to_string()).collect(),
  })
}
