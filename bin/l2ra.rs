/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::Path;
use std::process;

use clap;
use log::{self, error, info};
use pretty_env_logger;

use l2ra::parser::{parse_function, parse_program, parse_spill, read_file, SpillRequest};
use l2ra::test_cases::find_case;
use l2ra::test_framework::{check_results, run_program, Program, DEFAULT_STEP_BUDGET};
use l2ra::validator::validate;
use l2regalloc::analysis::run_liveness;
use l2regalloc::interference::build_interference_graph;
use l2regalloc::spill::spill_variable;
use l2regalloc::{Options, RegUniverse};

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let matches = app().get_matches();
  if let Err(msg) = run(&matches) {
    error!("{}", msg);
    eprintln!("l2ra: {}", msg);
    process::exit(1);
  }
}

fn app() -> clap::App<'static> {
  clap::App::new("l2ra")
    .about("graph-colouring register allocation for L2 programs")
    .arg(
      clap::Arg::new("liveness")
        .short('l')
        .long("liveness")
        .conflicts_with_all(&["interference", "spill"])
        .help("read one function and print its IN/OUT sets"),
    )
    .arg(
      clap::Arg::new("interference")
        .short('i')
        .long("interference")
        .conflicts_with("spill")
        .help("read one function and print its interference graph"),
    )
    .arg(
      clap::Arg::new("spill")
        .short('s')
        .long("spill")
        .help("read a function, a variable and a prefix, and spill the variable"),
    )
    .arg(
      clap::Arg::new("run")
        .short('r')
        .long("run")
        .help("interpret the program before and after allocation and compare"),
    )
    .arg(
      clap::Arg::new("test")
        .short('t')
        .long("test")
        .takes_value(true)
        .conflicts_with("input")
        .help("allocate a built-in test case instead of reading a file"),
    )
    .arg(
      clap::Arg::new("no-checker")
        .long("no-checker")
        .help("skip verification of the allocated code"),
    )
    .arg(
      clap::Arg::new("output")
        .short('o')
        .takes_value(true)
        .help("write the result here instead of to stdout"),
    )
    .arg(
      clap::Arg::new("snapshot")
        .long("snapshot")
        .takes_value(true)
        .help("also write the allocated program here, bincode-encoded"),
    )
    .arg(clap::Arg::new("input").index(1).help("input file (stdin if absent)"))
}

fn run(matches: &clap::ArgMatches) -> Result<(), String> {
  let univ = RegUniverse::x86_64();
  let opts = Options { run_checker: !matches.is_present("no-checker") };

  let output = if matches.is_present("liveness") {
    let func = parse_function(&read_input(matches)?).map_err(|e| e.to_string())?;
    let liveness = run_liveness(&func, &univ).map_err(|e| e.to_string())?;
    liveness.render(&func)
  } else if matches.is_present("interference") {
    let func = parse_function(&read_input(matches)?).map_err(|e| e.to_string())?;
    let liveness = run_liveness(&func, &univ).map_err(|e| e.to_string())?;
    build_interference_graph(&func, &liveness, &univ).render(&func)
  } else if matches.is_present("spill") {
    let SpillRequest { mut func, var, prefix } =
      parse_spill(&read_input(matches)?).map_err(|e| e.to_string())?;
    match func.lookup_var(&var) {
      Some(ix) => {
        spill_variable(&mut func, ix, &prefix, &univ);
      }
      None => info!("main: '%{}' does not occur in ':{}'", var, func.name),
    }
    func.to_string()
  } else {
    let (mut prog, input) = load_program(matches)?;
    validate(&prog, &univ)?;
    let original = prog.clone();

    let stats = prog
      .allocate(&univ, opts)
      .map_err(|(func, e)| format!("allocating ':{}': {}", func, e.to_string()))?;
    for (func, s) in prog.functions.iter().zip(stats.iter()) {
      info!(
        "main: ':{}': {} spill rounds, spilled {:?}{}",
        func.name,
        s.spill_rounds,
        s.spilled,
        if s.fell_back { ", fell back to spilling everything" } else { "" }
      );
    }

    if matches.is_present("run") {
      compare_runs(&original, &prog, &univ, &input)?;
    }
    if let Some(path) = matches.value_of("snapshot") {
      write_snapshot(&prog, Path::new(path))?;
    }
    prog.emit_l1(&univ)
  };

  match matches.value_of("output") {
    Some(path) => fs::write(path, output)
      .map_err(|e| format!("can't write '{}': {}", path, e)),
    None => {
      print!("{}", output);
      Ok(())
    }
  }
}

fn read_input(matches: &clap::ArgMatches) -> Result<String, String> {
  match matches.value_of("input") {
    Some(path) => read_file(Path::new(path)).map_err(|e| e.to_string()),
    None => {
      let mut content = String::new();
      io::stdin()
        .read_to_string(&mut content)
        .map_err(|e| format!("can't read stdin: {}", e))?;
      Ok(content)
    }
  }
}

/// The program to allocate and the input to run it with.
fn load_program(matches: &clap::ArgMatches) -> Result<(Program, Vec<i64>), String> {
  match matches.value_of("test") {
    Some(name) => match find_case(name) {
      Ok(case) => Ok((case.program, case.input)),
      Err(names) => Err(format!(
        "can't find test case '{}'; available cases are: {}",
        name,
        names.join(", ")
      )),
    },
    None => {
      let prog = parse_program(&read_input(matches)?).map_err(|e| e.to_string())?;
      Ok((prog, Vec::new()))
    }
  }
}

fn compare_runs(
  original: &Program, allocated: &Program, univ: &RegUniverse, input: &[i64],
) -> Result<(), String> {
  let before = run_program(original, univ, input, DEFAULT_STEP_BUDGET);
  let after = run_program(allocated, univ, input, DEFAULT_STEP_BUDGET);
  for line in &after.output {
    eprintln!("{}", line);
  }
  check_results(&before, &after)?;
  info!(
    "main: runs agree, {} steps before and {} after allocation",
    before.num_steps, after.num_steps
  );
  Ok(())
}

fn write_snapshot(prog: &Program, path: &Path) -> Result<(), String> {
  let file = File::create(path)
    .map_err(|e| format!("can't create '{}': {}", path.display(), e))?;
  bincode::serialize_into(BufWriter::new(file), prog)
    .map_err(|e| format!("can't write snapshot '{}': {}", path.display(), e))
}

#[cfg(test)]
mod test {
  use super::*;
  use l2ra::test_cases::case_names;

  // Runs the case before and after allocation; both runs must print what
  // the case expects.
  fn check_case(name: &str) -> Program {
    let _ = pretty_env_logger::try_init();
    let univ = RegUniverse::x86_64();
    let case = find_case(name)
      .unwrap_or_else(|names| panic!("no case '{}'; have {:?}", name, names));
    assert_eq!(validate(&case.program, &univ), Ok(()));

    let before = run_program(&case.program, &univ, &case.input, DEFAULT_STEP_BUDGET);
    assert_eq!(before.output, case.expected);

    let mut prog = case.program.clone();
    prog
      .allocate(&univ, Options { run_checker: true })
      .unwrap_or_else(|(f, e)| panic!("allocating ':{}': {}", f, e.to_string()));
    let after = run_program(&prog, &univ, &case.input, DEFAULT_STEP_BUDGET);
    assert_eq!(check_results(&before, &after), Ok(()));
    assert_eq!(after.output, case.expected);
    prog
  }

  #[test]
  fn no_vars() {
    check_case("no_vars");
  }

  #[test]
  fn simple_loop() {
    check_case("simple_loop");
  }

  #[test]
  fn pressure() {
    let prog = check_case("pressure");
    assert!(prog.functions[0].num_locals > 0);
  }

  #[test]
  fn calls() {
    check_case("calls");
  }

  #[test]
  fn stack_args() {
    let prog = check_case("stack_args");
    let l1 = prog.emit_l1(&RegUniverse::x86_64());
    assert!(!l1.contains("stack-arg"));
    assert!(!l1.contains('%'));
  }

  #[test]
  fn shifts() {
    check_case("shifts");
  }

  #[test]
  fn arrays() {
    check_case("arrays");
  }

  #[test]
  fn fib() {
    check_case("fib");
  }

  #[test]
  fn indirect() {
    check_case("indirect");
  }

  #[test]
  fn input() {
    check_case("input");
  }

  #[test]
  fn tensor_error() {
    check_case("tensor_error");
  }

  #[test]
  fn cases_survive_a_trip_through_text() {
    for name in case_names() {
      let prog = find_case(name).unwrap_or_else(|_| panic!("no case '{}'", name)).program;
      let text = prog.to_string();
      let reparsed = parse_program(&text).unwrap_or_else(|e| panic!("{}", e.to_string()));
      assert_eq!(reparsed.to_string(), text, "case '{}'", name);
    }
  }

  #[test]
  fn snapshots_decode_to_the_same_program() {
    let prog = check_case("fib");
    let bytes = bincode::serialize(&prog).unwrap();
    let decoded: Program = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded.to_string(), prog.to_string());
  }

  #[test]
  fn inspection_modes_reach_the_stages() {
    let _ = pretty_env_logger::try_init();
    let univ = RegUniverse::x86_64();
    let text = "(:f 0 %x <- 1 rax <- %x return) %x %s";

    let SpillRequest { func, var, prefix } =
      parse_spill(text).unwrap_or_else(|e| panic!("{}", e.to_string()));
    let liveness = run_liveness(&func, &univ).unwrap();
    assert!(liveness.render(&func).starts_with("(\n(in\n"));
    let graph = build_interference_graph(&func, &liveness, &univ);
    assert!(graph.render(&func).contains("%x"));

    let mut spilled = func.clone();
    let x = spilled.lookup_var(&var).unwrap();
    let temps = spill_variable(&mut spilled, x, &prefix, &univ);
    assert_eq!(temps.len(), 2);
    assert_eq!(spilled.num_locals, 1);
    assert!(spilled.to_string().contains("mem rsp 0 <- %s0"));
  }
}
