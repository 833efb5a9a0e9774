use bytevm::assembler;
use bytevm::disasm;
use bytevm::interpreter::Interpreter;
use bytevm::machine::Machine;
use log::{debug, info};
use std::env;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::time::Instant;

/// Default amount of memory for the program image plus stack.
const DEFAULT_MEMORY_SIZE: usize = 65536;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    // Display help information if no program file provided
    // Exit with success status since user is requesting help, not encountering an error
    if args.len() < 2 {
        println!("bytevm - byte-oriented stack machine with assembler");
        println!();
        println!(
            "Usage: {} <program.asm|program.avm> [-c] [-r] [-p] [-d]",
            args[0]
        );
        println!();
        println!("  .asm sources are assembled; .avm images are loaded directly");
        println!("  -c   write the assembled image next to the source as <name>.avm");
        println!("       (without -r the program is not executed)");
        println!("  -r   run after writing the image (with -c)");
        println!("  -p   profile the run and print per-opcode execution counts");
        println!("  -d   print a disassembly listing instead of running");
        println!();
        println!("Persistent NVRAM lives next to the program as <name>_nvram.bin");
        return Ok(());
    }

    let program_path = &args[1];
    let compile_only = args.iter().any(|a| a == "-c");
    let run_after_compile = args.iter().any(|a| a == "-r");
    let profile = args.iter().any(|a| a == "-p");
    let listing = args.iter().any(|a| a == "-d");

    let path = Path::new(program_path);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    // Load the program file with user-friendly error handling
    // Use explicit match instead of ? operator to provide clean, formatted error
    // messages that guide users to solve common problems like incorrect paths
    debug!("Loading program: {}", program_path);
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            match e.kind() {
                std::io::ErrorKind::NotFound => {
                    eprintln!("Error: Program file not found: {}", program_path);
                    eprintln!();
                    eprintln!("Please check:");
                    eprintln!("• File path is correct");
                    eprintln!("• You're running from the right directory");
                    eprintln!("• File exists and is readable");
                }
                std::io::ErrorKind::PermissionDenied => {
                    eprintln!(
                        "Error: Permission denied accessing program file: {}",
                        program_path
                    );
                    eprintln!();
                    eprintln!("Please check file permissions.");
                }
                _ => {
                    eprintln!("Error: Cannot open program file '{}': {}", program_path, e);
                }
            }
            std::process::exit(1);
        }
    };

    let program = match extension.as_str() {
        "asm" => {
            let mut source = String::new();
            if let Err(e) = file.read_to_string(&mut source) {
                eprintln!("Error: Cannot read program file '{}': {}", program_path, e);
                std::process::exit(1);
            }
            let image = assembler::assemble(&source)?;
            info!("assembled {} into {} bytes", program_path, image.len());
            if compile_only {
                let out_path = path.with_extension("avm");
                std::fs::write(&out_path, &image)
                    .map_err(|e| format!("Cannot write image {}: {}", out_path.display(), e))?;
                println!("Wrote {} ({} bytes)", out_path.display(), image.len());
                if !run_after_compile {
                    return Ok(());
                }
            }
            image
        }
        "avm" => {
            let mut image = Vec::new();
            if let Err(e) = file.read_to_end(&mut image) {
                eprintln!("Error: Cannot read program file '{}': {}", program_path, e);
                std::process::exit(1);
            }
            image
        }
        other => {
            eprintln!(
                "Error: Unknown program extension '{}' (expected .asm or .avm)",
                other
            );
            std::process::exit(1);
        }
    };

    if listing {
        print!("{}", disasm::disassemble(&program));
        return Ok(());
    }

    // NVRAM sits next to the program so each program keeps its own store.
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("program");
    let nvram_path = path.with_file_name(format!("{}_nvram.bin", stem));

    let machine = Machine::load(&program, DEFAULT_MEMORY_SIZE, nvram_path);
    let mut interpreter = Interpreter::new(machine);

    let started = Instant::now();
    let result = if profile {
        match interpreter.run_profiled() {
            Ok(report) => {
                println!();
                println!("--- profile ---");
                for (op, count) in &report.counts {
                    println!("{:>10}  {}", count, op);
                }
                println!("instructions executed: {}", report.executed_instructions);
                println!("max stack pointer:     {}", report.max_stack_pointer);
                Ok(())
            }
            Err(e) => Err(e),
        }
    } else {
        interpreter.run()
    };
    info!("execution took {} ms", started.elapsed().as_millis());

    match result {
        Ok(()) => {
            debug!("program halted normally");
            Ok(())
        }
        Err(e) => {
            eprintln!("\nError during execution: {e}");
            Err(Box::new(std::io::Error::other(e)) as Box<dyn std::error::Error>)
        }
    }
}
