//! End-to-end execution tests driving assembled programs.
use crate::assembler::assemble;
use crate::interpreter::{Interpreter, StepResult};
use crate::machine::Machine;
use crate::opcodes::Opcode;
use std::path::PathBuf;
use test_log::test;

const UNUSED_NVRAM: &str = "/tmp/bytevm-interp-test-unused.bin";

fn interpreter_for(source: &str) -> Interpreter {
    let program = assemble(source).unwrap();
    Interpreter::new(Machine::load(&program, 4096, UNUSED_NVRAM))
}

fn run_asm(source: &str) -> Interpreter {
    let mut i = interpreter_for(source);
    i.run().unwrap();
    i
}

#[test]
fn push_add_leaves_the_sum_on_top() {
    let mut i = run_asm("PUSH 5 PUSH 3 ADD");
    assert_eq!(i.machine.pop(), 8);
    assert_eq!(i.machine.sp(), i.machine.stack_start());
}

#[test]
fn add_overflow_wraps_and_sets_carry() {
    let mut i = run_asm("PUSH 200 PUSH 100 ADD PUSH_CARRY");
    assert_eq!(i.machine.pop(), 1);
    assert_eq!(i.machine.pop(), 44);
}

#[test]
fn sub_takes_the_subtrahend_from_the_top() {
    let mut i = run_asm("PUSH 10 PUSH 3 SUB PUSH_CARRY");
    assert_eq!(i.machine.pop(), 0);
    assert_eq!(i.machine.pop(), 7);
}

#[test]
fn sub_underflow_wraps_and_sets_carry() {
    let mut i = run_asm("PUSH 3 PUSH 10 SUB PUSH_CARRY");
    assert_eq!(i.machine.pop(), 1);
    assert_eq!(i.machine.pop(), 249);
}

#[test]
fn sub2_reverses_the_operand_order() {
    let mut i = run_asm("PUSH 3 PUSH 10 SUB2 PUSH_CARRY");
    assert_eq!(i.machine.pop(), 0);
    assert_eq!(i.machine.pop(), 7);
}

#[test]
fn division_by_zero_without_handler_interrupts_the_run() {
    let mut i = interpreter_for("PUSH 5 PUSH 0 DIV");
    let err = i.run().unwrap_err();
    assert!(err.contains("DivisionByZeroError"), "got: {}", err);
}

#[test]
fn division_by_zero_with_handler_resumes_after_the_fault() {
    let i = run_asm(
        r#"
        JMP @main
        :flag
        0
        :main
        INTERRUPT_HANDLER INT.DivisionByZeroError @handler
        PUSH 9
        PUSH 0
        DIV
        HALT
        :handler
        PUSH 1
        PUSH16 @flag
        STORE_GLOBAL
        RET
        "#,
    );
    assert_eq!(i.machine.read_memory(3), 1);
    assert_eq!(i.machine.sp(), i.machine.stack_start());
}

#[test]
fn uninstalling_a_handler_restores_the_default_termination() {
    let mut i = interpreter_for(
        r#"
        INTERRUPT_HANDLER INT.DivisionByZeroError @handler
        INTERRUPT_HANDLER INT.DivisionByZeroError #0
        PUSH 1
        PUSH 0
        DIV
        HALT
        :handler
        RET
        "#,
    );
    let err = i.run().unwrap_err();
    assert!(err.contains("DivisionByZeroError"), "got: {}", err);
}

#[test]
fn sixteen_bit_values_round_trip_through_the_stack() {
    for value in [0u16, 255, 256, 65535] {
        let mut i = run_asm(&format!("PUSH16 #{}", value));
        assert_eq!(i.machine.pop_addr(), value);
    }
}

#[test]
fn division_direction_puts_the_divisor_on_top() {
    let mut i = run_asm("PUSH 10 PUSH 2 DIV");
    assert_eq!(i.machine.pop(), 5);
    let mut i = run_asm("PUSH 2 PUSH 10 DIV2");
    assert_eq!(i.machine.pop(), 5);
}

#[test]
fn mod_matches_div_direction() {
    let mut i = run_asm("PUSH 10 PUSH 3 MOD");
    assert_eq!(i.machine.pop(), 1);
}

#[test]
fn comparisons_compare_top_against_second() {
    // LESS pushes (top < second).
    let mut i = run_asm("PUSH 10 PUSH 3 LESS");
    assert_eq!(i.machine.pop(), 1);
    let mut i = run_asm("PUSH 3 PUSH 10 LESS");
    assert_eq!(i.machine.pop(), 0);
    let mut i = run_asm("PUSH 7 PUSH 7 EQ");
    assert_eq!(i.machine.pop(), 1);
}

#[test]
fn shift_amount_comes_from_the_top_and_saturates() {
    let mut i = run_asm("PUSH 1 PUSH 3 LSH");
    assert_eq!(i.machine.pop(), 8);
    let mut i = run_asm("PUSH 1 PUSH 8 LSH");
    assert_eq!(i.machine.pop(), 0);
    let mut i = run_asm("PUSH16 #1 PUSH16 #15 LSH16");
    assert_eq!(i.machine.pop_addr(), 0x8000);
    let mut i = run_asm("PUSH16 #1 PUSH16 #16 LSH16");
    assert_eq!(i.machine.pop_addr(), 0);
}

#[test]
fn roll3_rotates_the_top_three_bytes() {
    // ABC becomes BCA, with B the new top.
    let mut i = run_asm("PUSH 1 PUSH 2 PUSH 3 ROLL3");
    assert_eq!(i.machine.pop(), 2);
    assert_eq!(i.machine.pop(), 1);
    assert_eq!(i.machine.pop(), 3);
}

#[test]
fn extend_and_downcast_convert_widths() {
    let mut i = run_asm("PUSH 200 EXTEND");
    assert_eq!(i.machine.pop_addr(), 200);
    let mut i = run_asm("PUSH16 #300 DOWNCAST");
    assert_eq!(i.machine.pop(), 255);
    let mut i = run_asm("PUSH16 #99 DOWNCAST");
    assert_eq!(i.machine.pop(), 99);
}

#[test]
fn relative_jumps_survive_relocation() {
    let body = r#"
        JMP_REL @over
        PUSH 99
        :over
        PUSH 7
    "#;
    let padded = format!("NOP NOP NOP NOP\n{}", body);

    let mut a = run_asm(body);
    let mut b = run_asm(&padded);
    assert_eq!(a.machine.pop(), 7);
    assert_eq!(b.machine.pop(), 7);
    assert_eq!(a.machine.sp() - a.machine.stack_start(), 0);
    assert_eq!(b.machine.sp() - b.machine.stack_start(), 0);
}

#[test]
fn case_rel_dispatch_matches_and_falls_through() {
    let source = r#"
        PUSH 2
        CASE_REL 1 @one
        CASE_REL 2 @two
        PUSH 0
        HALT
        :one
        PUSH 11
        HALT
        :two
        PUSH 22
    "#;
    let mut i = run_asm(source);
    // A taken case consumes the scrutinee.
    assert_eq!(i.machine.pop(), 22);
    assert_eq!(i.machine.sp(), i.machine.stack_start());
}

#[test]
fn else_pops_the_scrutinee_and_jumps() {
    let mut i = run_asm(
        r#"
        PUSH 9
        CASE 1 @one
        ELSE @other
        :one
        PUSH 11
        HALT
        :other
        PUSH 33
        "#,
    );
    assert_eq!(i.machine.pop(), 33);
    assert_eq!(i.machine.sp(), i.machine.stack_start());
}

#[test]
fn globals_update_the_pointer_register() {
    let i = run_asm(
        r#"
        JMP @main
        :cell
        0
        :main
        PUSH 55
        PUSH16 @cell
        STORE_GLOBAL
        LOAD_GLOBAL_PTR
        "#,
    );
    // The pointer register remembers the store address, so the bare
    // pointer load sees the value just written.
    assert_eq!(i.machine.peek(), 55);
    assert_eq!(i.machine.pointer, 3);
}

#[test]
fn global_var_macros_address_from_stack_start() {
    let mut i = run_asm(
        r#"
        PUSHN 2              ; reserve two global bytes at stack start
        PUSH 8
        PUSH_STACK_START
        STORE_GLOBAL
        MACRO_LOAD_GLOBAL_VAR #0
        "#,
    );
    assert_eq!(i.machine.pop(), 8);
    assert_eq!(i.machine.pointer, i.machine.stack_start());
}

#[test]
fn macro_x2_matches_push_mul() {
    let mut a = run_asm("PUSH 70 MACRO_X2 PUSH_CARRY");
    let mut b = run_asm("PUSH 70 PUSH 2 MUL PUSH_CARRY");
    assert_eq!(a.machine.pop(), b.machine.pop());
    assert_eq!(a.machine.pop(), b.machine.pop());

    let mut a = run_asm("PUSH 200 MACRO_X2 PUSH_CARRY");
    assert_eq!(a.machine.pop(), 1);
    assert_eq!(a.machine.pop(), 144);
}

#[test]
fn macro_div_matches_push_div() {
    let mut a = run_asm("PUSH 9 MACRO_DIV2");
    assert_eq!(a.machine.pop(), 4);
    let mut a = run_asm("PUSH 9 MACRO_DIV3");
    assert_eq!(a.machine.pop(), 3);
}

#[test]
fn macro_conditional_jf_jumps_when_false() {
    let mut i = run_asm(
        r#"
        PUSH 3
        PUSH 3
        MACRO_CONDITIONAL_JF 0 @notequal
        PUSH 1
        HALT
        :notequal
        PUSH 0
        "#,
    );
    assert_eq!(i.machine.pop(), 1);

    let mut i = run_asm(
        r#"
        PUSH 3
        PUSH 4
        MACRO_CONDITIONAL_JF 0 @notequal
        PUSH 1
        HALT
        :notequal
        PUSH 0
        "#,
    );
    assert_eq!(i.machine.pop(), 0);
}

#[test]
fn macro_indexed_load_scales_and_fetches() {
    let mut i = run_asm(
        r#"
        JMP @main
        :table
        10 0 20 0 30 0
        :main
        PUSH16 @table
        PUSH 2
        MACRO_POP_EXT_X2_ADD16_LG16
        "#,
    );
    // Entry 2 of the 16-bit table.
    assert_eq!(i.machine.pop_addr(), 30);
}

#[test]
fn store_local_keep_leaves_the_value_on_the_stack() {
    let i = run_asm(
        r#"
        JMP @main
        :out
        0
        :main
        CALL @f
        HALT
        :f
        PUSHN 1
        PUSH 77
        STORE_LOCAL_KEEP 0   ; writes local 0 without consuming the value
        LOAD_LOCAL 0
        ADD
        PUSH16 @out
        STORE_GLOBAL
        RET
        "#,
    );
    assert_eq!(i.machine.read_memory(3), 154);
}

#[test]
fn nvram_bytes_survive_within_a_run() {
    let mut path = PathBuf::from(std::env::temp_dir());
    path.push(format!("bytevm-interp-nvram-{}.bin", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let program = assemble(
        r#"
        PUSH 99
        PUSH16 #5
        STORE_NVRAM
        PUSH16 #5
        LOAD_NVRAM
        "#,
    )
    .unwrap();
    let machine = Machine::load(&program, 4096, &path);
    let mut i = Interpreter::new(machine);
    i.run().unwrap();

    assert_eq!(i.machine.pop(), 99);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 65536);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn unknown_opcode_is_fatal() {
    let machine = Machine::load(&[250], 64, UNUSED_NVRAM);
    let mut i = Interpreter::new(machine);
    let err = i.run().unwrap_err();
    assert!(err.contains("250"), "got: {}", err);
}

#[test]
fn single_stepping_reports_each_instruction() {
    let program = assemble("PUSH 1 PUSH 2 ADD").unwrap();
    let mut i = Interpreter::new(Machine::load(&program, 4096, UNUSED_NVRAM));
    assert_eq!(i.step().unwrap(), StepResult::Executed(Opcode::Push));
    assert_eq!(i.step().unwrap(), StepResult::Executed(Opcode::Push));
    assert_eq!(i.step().unwrap(), StepResult::Executed(Opcode::Add));
    assert_eq!(i.step().unwrap(), StepResult::Halted);
    assert_eq!(i.machine.peek(), 3);
}

#[test]
fn profiler_counts_opcodes_and_stack_usage() {
    let program = assemble("PUSH 1 PUSH 2 PUSH 3 ADD ADD").unwrap();
    let mut i = Interpreter::new(Machine::load(&program, 4096, UNUSED_NVRAM));
    let report = i.run_profiled().unwrap();

    assert_eq!(report.counts[&Opcode::Push], 3);
    assert_eq!(report.counts[&Opcode::Add], 2);
    assert_eq!(report.counts[&Opcode::Halt], 1);
    assert_eq!(report.executed_instructions, 6);
    assert_eq!(
        report.max_stack_pointer,
        i.machine.stack_start() + 3
    );
    // Counts are reported most-frequent first.
    let counts: Vec<u64> = report.counts.values().copied().collect();
    let mut sorted = counts.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(counts, sorted);
}

#[test]
fn register_transfer_round_trips_through_the_stack() {
    let mut i = run_asm("PUSH_REG 2");
    let fp = i.machine.fp();
    assert_eq!(i.machine.pop_addr(), fp);
}

#[test]
fn invalid_register_selector_is_fatal() {
    let mut i = interpreter_for("PUSH_REG 7");
    let err = i.run().unwrap_err();
    assert!(err.contains("register"), "got: {}", err);
}
