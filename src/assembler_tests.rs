//! Byte-level assembler tests.
use crate::assembler::assemble;
use crate::opcodes::{Interrupt, Opcode, SyscallNumber};
use test_log::test;

const HALT: u8 = Opcode::Halt as u8;

#[test]
fn assembles_simple_instructions_to_exact_bytes() {
    let program = assemble("PUSH 5 PUSH 3 ADD").unwrap();
    assert_eq!(
        program,
        vec![
            Opcode::Push as u8,
            5,
            Opcode::Push as u8,
            3,
            Opcode::Add as u8,
            HALT,
        ]
    );
}

#[test]
fn a_trailing_halt_is_always_appended() {
    assert_eq!(assemble("").unwrap(), vec![HALT]);
    assert_eq!(assemble("NOP").unwrap(), vec![Opcode::Nop as u8, HALT]);
}

#[test]
fn mnemonics_are_case_insensitive() {
    let a = assemble("push 1 load_global16").unwrap();
    let b = assemble("PUSH 1 LOAD_GLOBAL16").unwrap();
    assert_eq!(a, b);
}

#[test]
fn comments_are_stripped() {
    let a = assemble("PUSH 1 ; a semicolon comment\nPUSH 2 // slashes too").unwrap();
    let b = assemble("PUSH 1\nPUSH 2").unwrap();
    assert_eq!(a, b);
}

#[test]
fn hash_numbers_emit_two_little_endian_bytes() {
    let program = assemble("PUSH16 #4660").unwrap();
    assert_eq!(program, vec![Opcode::Push16 as u8, 0x34, 0x12, HALT]);
}

#[test]
fn bare_integers_wrap_to_one_byte() {
    let program = assemble("PUSH 300").unwrap();
    assert_eq!(program[1], 44);
}

#[test]
fn backward_label_reference_is_patched_absolute() {
    let program = assemble(":start NOP JMP @start").unwrap();
    // NOP at 0, JMP at 1, operand at 2..4 pointing back to 0.
    assert_eq!(program, vec![Opcode::Nop as u8, Opcode::Jmp as u8, 0, 0, HALT]);
}

#[test]
fn forward_label_reference_is_patched_absolute() {
    let program = assemble("JMP @end PUSH 1 :end NOP").unwrap();
    // JMP at 0, operand 2 bytes, PUSH+arg, :end at 5.
    assert_eq!(
        program,
        vec![
            Opcode::Jmp as u8,
            5,
            0,
            Opcode::Push as u8,
            1,
            Opcode::Nop as u8,
            HALT,
        ]
    );
}

#[test]
fn rel_mnemonic_arms_a_relative_fixup() {
    let program = assemble("JMP_REL @end PUSH 1 :end NOP").unwrap();
    // Fixup slot at 1; target at 5; stored displacement is
    // target - fixup_address + 1 = 5.
    assert_eq!(program[0], Opcode::JmpRel as u8);
    assert_eq!(program[1], 5);
    assert_eq!(program[2], 0);
}

#[test]
fn relative_mode_is_consumed_by_the_first_label_use() {
    // The second label reference on the line gets an absolute patch.
    let program = assemble("JMP_REL @a JMP @a :a NOP").unwrap();
    let target = 6u16;
    // Relative slot at 1.
    assert_eq!(
        u16::from_le_bytes([program[1], program[2]]),
        target - 1 + 1
    );
    // Absolute slot at 4.
    assert_eq!(u16::from_le_bytes([program[4], program[5]]), target);
}

#[test]
fn negative_relative_displacements_encode_as_signed() {
    let program = assemble(":top NOP NOP JMP_REL @top").unwrap();
    // Fixup slot at 3, target 0: displacement -2 as little-endian i16.
    let offset = i16::from_le_bytes([program[3], program[4]]);
    assert_eq!(offset, -2);
}

#[test]
fn duplicate_label_reports_the_line() {
    let err = assemble(":here NOP\n:here NOP").unwrap_err();
    assert!(err.contains("here") && err.contains("line 2"), "got: {}", err);
}

#[test]
fn unknown_label_reports_the_referencing_line() {
    let err = assemble("NOP\nJMP @nowhere").unwrap_err();
    assert!(
        err.contains("nowhere") && err.contains("line 2"),
        "got: {}",
        err
    );
}

#[test]
fn invalid_token_reports_the_line() {
    let err = assemble("PUSH 1\nFROBNICATE").unwrap_err();
    assert!(
        err.contains("FROBNICATE") && err.contains("line 2"),
        "got: {}",
        err
    );
}

#[test]
fn const_definitions_expand_to_bytes() {
    let program = assemble("CONST Speed 17\nPUSH CONST.Speed").unwrap();
    assert_eq!(program, vec![Opcode::Push as u8, 17, HALT]);
}

#[test]
fn const_names_are_case_sensitive() {
    let err = assemble("CONST Speed 17\nPUSH CONST.speed").unwrap_err();
    assert!(err.contains("speed"), "got: {}", err);
}

#[test]
fn const_redefinition_takes_the_latest_value() {
    let program = assemble("CONST X 1\nCONST X 2\nPUSH CONST.X").unwrap();
    assert_eq!(program[1], 2);
}

#[test]
fn const16_reference_emits_a_single_byte() {
    // A 16-bit constant reference contributes one byte to the stream.
    let program = assemble("CONST16 Big 258\nPUSH CONST16.Big").unwrap();
    assert_eq!(program, vec![Opcode::Push as u8, 2, HALT]);
}

#[test]
fn interrupt_and_syscall_names_resolve() {
    let program = assemble("INTERRUPT_HANDLER INT.DivisionByZeroError #9\nSYSCALL STD.PrintInt")
        .unwrap();
    assert_eq!(
        program,
        vec![
            Opcode::InterruptHandler as u8,
            Interrupt::DivisionByZeroError as u8,
            9,
            0,
            Opcode::Syscall as u8,
            SyscallNumber::PrintInt as u8,
            HALT,
        ]
    );
}

#[test]
fn int_and_std_names_are_case_insensitive() {
    let a = assemble("SYSCALL std.printint").unwrap();
    let b = assemble("SYSCALL STD.PrintInt").unwrap();
    assert_eq!(a, b);
}

#[test]
fn string_lines_emit_bytes_and_a_terminator() {
    let program = assemble("\"hi\"").unwrap();
    assert_eq!(program, vec![b'h', b'i', 0, HALT]);
}

#[test]
fn string_escapes_are_decoded() {
    let program = assemble("\"a\\n\\t\\r\\0b\"").unwrap();
    assert_eq!(program, vec![b'a', b'\n', b'\t', b'\r', 0, b'b', 0, HALT]);
}

#[test]
fn leading_bang_in_a_string_is_consumed() {
    // The marker itself is not emitted; the terminator still is.
    let program = assemble("\"!hi\"").unwrap();
    assert_eq!(program, vec![b'h', b'i', 0, HALT]);
}

#[test]
fn comment_markers_inside_strings_are_preserved() {
    let program = assemble("\"a;b//c\"").unwrap();
    assert_eq!(program, vec![b'a', b';', b'b', b'/', b'/', b'c', 0, HALT]);
}

#[test]
fn labels_address_string_data() {
    let program = assemble("JMP @main\n:msg\n\"ok\"\n:main NOP").unwrap();
    // msg at 3, main at 6.
    assert_eq!(u16::from_le_bytes([program[1], program[2]]), 6);
    assert_eq!(&program[3..6], b"ok\0");
}

#[test]
fn relocated_relative_code_keeps_identical_displacements() {
    let body = "JMP_REL @end PUSH 1 :end NOP";
    let plain = assemble(body).unwrap();
    let padded = assemble(&format!("NOP NOP NOP {}", body)).unwrap();
    // Same encoded displacement bytes regardless of load position.
    assert_eq!(plain[1..3], padded[4..6]);
}
