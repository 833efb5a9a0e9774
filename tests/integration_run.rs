//! Full-pipeline tests: assemble source text, load it, run it to HALT.
use bytevm::assembler::assemble;
use bytevm::disasm::disassemble;
use bytevm::interpreter::Interpreter;
use bytevm::machine::Machine;
use std::path::PathBuf;

fn nvram_path(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("bytevm-it-{}-{}.bin", name, std::process::id()));
    p
}

#[test]
fn countdown_loop_terminates_with_an_empty_stack() {
    let program = assemble(
        r#"
        ; count 10 down to 0 in a frame local
        CALL @countdown
        HALT
        :countdown
        PUSHN 1
        MACRO_SET_LOCAL 10 0
        :loop
        MACRO_DEC_LOCAL 0
        LOAD_LOCAL 0
        JT @loop
        RET
        "#,
    )
    .unwrap();
    let machine = Machine::load(&program, 4096, nvram_path("countdown"));
    let mut interpreter = Interpreter::new(machine);
    interpreter.run().unwrap();

    assert_eq!(interpreter.machine.sp(), interpreter.machine.stack_start());
    assert!(interpreter.machine.executed_instruction_count() > 30);
}

#[test]
fn fibonacci_with_recursive_calls() {
    // fib(n) with n passed as the single byte argument and the result
    // stored back over it.
    let program = assemble(
        r#"
        PUSH 10
        CALL @fib
        HALT
        :fib
        LOAD_ARG 1
        PUSH 2
        LESS_OR_EQ      ; 2 <= n ?
        JT_REL @recurse
        RET             ; fib(0)=0, fib(1)=1: argument already correct
        :recurse
        LOAD_ARG 1
        SUBC 1
        CALL @fib
        LOAD_ARG 1
        SUBC 2
        CALL @fib
        ADD
        STORE_ARG 1
        RET
        "#,
    )
    .unwrap();
    let machine = Machine::load(&program, 8192, nvram_path("fib"));
    let mut interpreter = Interpreter::new(machine);
    interpreter.run().unwrap();

    assert_eq!(interpreter.machine.pop(), 55);
    assert_eq!(interpreter.machine.sp(), interpreter.machine.stack_start());
}

#[test]
fn nvram_state_survives_separate_machines() {
    let path = nvram_path("persist");
    let _ = std::fs::remove_file(&path);

    let writer = assemble("PUSH 123 PUSH16 #42 STORE_NVRAM").unwrap();
    let mut w = Interpreter::new(Machine::load(&writer, 1024, &path));
    w.run().unwrap();

    let reader = assemble("PUSH16 #42 LOAD_NVRAM").unwrap();
    let mut r = Interpreter::new(Machine::load(&reader, 1024, &path));
    r.run().unwrap();

    assert_eq!(r.machine.pop(), 123);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn disassembly_of_an_assembled_program_reassembles_meaningfully() {
    let program = assemble("PUSH 1 PUSH 2 ADD SYSCALL STD.PrintInt").unwrap();
    let listing = disassemble(&program);
    // One line per instruction plus the implicit trailing HALT.
    assert_eq!(listing.lines().count(), 5);
}

#[test]
fn profiled_run_accounts_for_every_instruction() {
    let program = assemble(
        r#"
        PUSH 5
        :loop
        DEC
        DUP
        JT @loop
        "#,
    )
    .unwrap();
    let machine = Machine::load(&program, 1024, nvram_path("profile"));
    let mut interpreter = Interpreter::new(machine);
    let report = interpreter.run_profiled().unwrap();

    let total: u64 = report.counts.values().sum();
    assert_eq!(total, report.executed_instructions);
    assert_eq!(report.counts[&bytevm::opcodes::Opcode::Dec], 5);
}
