// bog - A small embeddable scripting language written in Rust
// Copyright (c) 2025 Tom Waddington. MIT licensed.

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;
use std::rc::Rc;

use bog_vm::{value, Error, Module, Options, Vm};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() == 2 && (args[1] == "--version" || args[1] == "-v") {
        println!("Bog v0.1.0");
        return;
    }

    match args.get(1).map(String::as_str) {
        None => run_repl(),
        Some("compile") => {
            if args.len() != 4 {
                eprintln!("usage: bog compile <input.bog> <output.bogc>");
                process::exit(2);
            }
            compile_file(&args[2], &args[3]);
        }
        Some(path) => run_file(path),
    }
}

/// Process exit code for a failure kind.
fn exit_code(error: &Error) -> i32 {
    match error {
        Error::Tokenize => 1,
        Error::Parse => 2,
        Error::Compile => 3,
        Error::Runtime => 4,
        Error::MalformedByteCode => 5,
        Error::OutOfMemory => 6,
        Error::Io(_) => 7,
    }
}

fn read_source(path: &str) -> String {
    match fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error reading '{}': {}", path, e);
            process::exit(7);
        }
    }
}

/// Run a `.bog` source file or a compiled `.bogc` image.
fn run_file(path: &str) {
    let mut vm = Vm::with_options(Options {
        import_files: true,
        ..Options::default()
    });

    let (result, source) = if path.ends_with(".bogc") {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("error reading '{}': {}", path, e);
                process::exit(7);
            }
        };
        let module = match Module::read_bytes(path, &bytes) {
            Ok(module) => module,
            Err(e) => {
                eprintln!("{}: '{}'", e, path);
                process::exit(5);
            }
        };
        (vm.exec(Rc::new(module)), String::new())
    } else {
        let source = read_source(path);
        (vm.compile_and_run(&source, path), source)
    };

    match result {
        Ok(result) => {
            // A module-level err value is a failure the host surfaces.
            if matches!(vm.gc.get(result), bog_vm::Value::Err(_)) {
                eprintln!("{}", value::display(&vm.gc, result));
                process::exit(1);
            }
        }
        Err(e) => {
            let _ = vm.render_errors(&source, &mut io::stderr());
            process::exit(exit_code(&e));
        }
    }
}

/// Compile a source file to a `.bogc` image.
fn compile_file(input: &str, output: &str) {
    let source = read_source(input);
    let mut vm = Vm::new();
    let module = match vm.compile_source(&source, input) {
        Ok(module) => module,
        Err(e) => {
            let _ = vm.render_errors(&source, &mut io::stderr());
            process::exit(exit_code(&e));
        }
    };
    let mut out = match fs::File::create(output) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("error creating '{}': {}", output, e);
            process::exit(7);
        }
    };
    if let Err(e) = module.write_to(&mut out) {
        eprintln!("error writing '{}': {}", output, e);
        process::exit(7);
    }
}

/// Run the interactive REPL. Each line executes as its own module; imports
/// and registered natives persist across lines.
fn run_repl() {
    println!("Bog v0.1.0");
    let mut vm = Vm::with_options(Options {
        import_files: true,
        repl: true,
        ..Options::default()
    });

    let stdin = io::stdin();
    loop {
        print!(">> ");
        io::stdout().flush().unwrap();

        let mut input = String::new();
        match stdin.lock().read_line(&mut input) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                let line = input.trim();
                if line.is_empty() {
                    continue;
                }
                match vm.compile_and_run(line, "repl") {
                    Ok(result) => {
                        if !matches!(vm.gc.get(result), bog_vm::Value::None) {
                            println!("{}", value::display(&vm.gc, result));
                        }
                    }
                    Err(_) => {
                        let _ = vm.render_errors(line, &mut io::stderr());
                    }
                }
            }
            Err(e) => {
                eprintln!("error reading input: {}", e);
                break;
            }
        }
    }
}
