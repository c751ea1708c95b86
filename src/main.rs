use std::io::{self, Write};

use opal::error::OpalResult;
use opal::eval::Machine;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        let program = args.first().map(String::as_str).unwrap_or("opal");
        eprintln!("Usage: {} <source-path>", program);
        std::process::exit(1);
    }

    let source = match std::fs::read(&args[1]) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("cannot read {}: {}", args[1], e);
            std::process::exit(1);
        }
    };

    match run(&source) {
        Ok(rendered) => {
            let mut stdout = io::stdout();
            let written = stdout
                .write_all(b"<end-of-stdout>\n")
                .and_then(|_| stdout.write_all(&rendered))
                .and_then(|_| stdout.write_all(b"\n"))
                .and_then(|_| stdout.flush());
            if let Err(e) = written {
                eprintln!("cannot write result: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            if !e.trace.is_empty() {
                eprintln!("\n>>> stack trace printed below");
                for sl in &e.trace {
                    eprintln!("calling function body at {}", sl);
                }
            }
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

fn run(source: &[u8]) -> OpalResult<Vec<u8>> {
    let mut machine = Machine::new(source)?;
    machine.execute()?;
    Ok(machine.render_result())
}
