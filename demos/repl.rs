use glisp::Error;
use glisp::ast::Value;
use glisp::evaluator::{self, Environment};
use glisp::reader::{is_incomplete, parse_all};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::process;
use std::thread;

/// Room for `glisp::MAX_EVAL_DEPTH` levels of non-tail evaluation
const EVAL_STACK_SIZE: usize = 256 * 1024 * 1024;

fn main() {
    env_logger::init();

    let result = thread::Builder::new()
        .stack_size(EVAL_STACK_SIZE)
        .spawn(run_repl)
        .expect("Could not start the REPL thread")
        .join();

    if let Err(panic_info) = result {
        eprintln!("The REPL encountered an unexpected error and must exit.");

        if let Some(msg) = panic_info.downcast_ref::<&str>() {
            eprintln!("Error: {msg}");
        } else if let Some(msg) = panic_info.downcast_ref::<String>() {
            eprintln!("Error: {msg}");
        } else {
            eprintln!("Error: Unknown panic occurred");
        }

        process::exit(1);
    }
}

fn run_repl() {
    println!("Glisp evaluator");
    println!("Enter forms like: (let [x 2] (* x 21))");
    println!("Type :help for more commands, or Ctrl+C to exit.");
    println!();

    let mut rl = DefaultEditor::new().expect("Could not initialize REPL");
    let env = evaluator::create_global_env();

    // Callable from user code as (help)
    env.register_builtin_operation::<_, ()>("help", print_help);

    let mut annotate = false;
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "glisp> " } else { "  ...> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() {
                    match line.trim() {
                        "" => continue,
                        ":help" => {
                            _ = print_help().is_ok();
                            continue;
                        }
                        ":env" => {
                            print_environment(&env);
                            continue;
                        }
                        ":annotate" => {
                            annotate = !annotate;
                            if annotate {
                                println!("Annotation enabled: macro expansions are shown (→)");
                            } else {
                                println!("Annotation disabled");
                            }
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                }

                pending.push_str(&line);
                pending.push('\n');
                if is_incomplete(&pending) {
                    continue;
                }

                let input = std::mem::take(&mut pending);
                let _ = rl.add_history_entry(input.trim_end());
                run_input(&input, &env, annotate);
            }

            Err(ReadlineError::Interrupted) if !pending.is_empty() => {
                pending.clear();
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn run_input(input: &str, env: &Environment, annotate: bool) {
    let forms = match parse_all(input) {
        Ok(forms) => forms,
        Err(e) => {
            println!("Error: {e}");
            return;
        }
    };

    for form in forms {
        match evaluator::evaluate(&form, env, annotate) {
            Ok(result) => {
                if let Some(expansion) = form.metadata().and_then(|m| m.last_expansion()) {
                    println!("→ {expansion}");
                }
                println!("{result}");
            }
            Err(e) => {
                println!("Error: {e}");
                return;
            }
        }
    }
}

fn print_help() -> Result<Value, Error> {
    println!("Glisp evaluator:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show current environment bindings");
    println!("  :annotate  - Toggle evaluation metadata (shows macro expansions)");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+C     - Cancel a multi-line form, or exit");
    println!();
    println!("Special forms:");
    println!("  def let quote quasiquote macro macroexpand");
    println!("  try/catch do if fn eval-when-execute");
    println!();
    println!("Examples:");
    println!("  (def square (fn [x] (* x x)))");
    println!("  (macro unless [c a b] `(if ~c ~b ~a))");
    println!("  (try (throw {{:code 1}}) (catch e e))");
    println!();

    Ok(Value::Nil)
}

fn print_environment(env: &Environment) {
    let bindings = env.get_all_bindings();

    if bindings.is_empty() {
        println!("Environment is empty.");
        return;
    }

    println!("Environment bindings ({} total):", bindings.len());
    println!();

    // Separate built-in functions from user-defined values
    let mut builtins = Vec::new();
    let mut user_defined = Vec::new();

    for (name, value) in bindings {
        match value {
            Value::BuiltinFunction { .. } => builtins.push(name),
            _ => user_defined.push((name, value)),
        }
    }

    if !builtins.is_empty() {
        println!("Built-in functions ({}):", builtins.len());
        let mut col = 0;
        for name in builtins {
            print!("  {name:<15}");
            col += 1;
            if col % 4 == 0 {
                println!();
            }
        }
        if col % 4 != 0 {
            println!();
        }
        println!();
    }

    if !user_defined.is_empty() {
        println!("User-defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {value}");
        }
    }
}
