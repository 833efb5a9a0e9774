//! Flat listing disassembler for assembled images.
//!
//! Walks the byte stream by declared operand lengths; bytes that decode to
//! no known opcode are shown as data. Output is one instruction per line
//! with the absolute address in front, suitable for eyeballing fixups.
use crate::opcodes::{Interrupt, Opcode, SyscallNumber};

pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut at = 0usize;
    while at < code.len() {
        let byte = code[at];
        match Opcode::from_byte(byte) {
            Some(op) => {
                let len = 1 + op.operand_len() as usize;
                let operands = &code[(at + 1).min(code.len())..(at + len).min(code.len())];
                out.push_str(&format_instruction(at, op, operands));
                at += len;
            }
            None => {
                out.push_str(&format!("{:5}  DATA {}\n", at, byte));
                at += 1;
            }
        }
    }
    out
}

fn format_instruction(at: usize, op: Opcode, operands: &[u8]) -> String {
    let text = render(op, operands);
    format!("{:5}  {}\n", at, text)
}

fn render(op: Opcode, operands: &[u8]) -> String {
    match (op, operands) {
        (Opcode::Syscall, [n]) => match SyscallNumber::from_byte(*n) {
            Some(service) => format!("{} STD.{}", op, service),
            None => format!("{} {}", op, n),
        },
        (Opcode::InterruptHandler, [code, lo, hi]) => {
            let address = u16::from_le_bytes([*lo, *hi]);
            match Interrupt::from_byte(*code) {
                Some(int) => format!("{} INT.{} #{}", op, int, address),
                None => format!("{} {} #{}", op, code, address),
            }
        }
        (_, []) => format!("{}", op),
        (_, [a]) => format!("{} {}", op, a),
        (_, [lo, hi]) => format!("{} #{}", op, u16::from_le_bytes([*lo, *hi])),
        (_, [a, lo, hi]) => format!("{} {} #{}", op, a, u16::from_le_bytes([*lo, *hi])),
        _ => format!("{}", op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;

    #[test]
    fn listing_shows_mnemonics_and_operands() {
        let program = assemble("PUSH 5 PUSH16 #300 ADD16").unwrap();
        let listing = disassemble(&program);
        assert!(listing.contains("PUSH 5"));
        assert!(listing.contains("PUSH16 #300"));
        assert!(listing.contains("ADD16"));
        assert!(listing.contains("HALT"));
    }

    #[test]
    fn syscalls_and_interrupts_decode_symbolically() {
        let program =
            assemble("SYSCALL STD.PrintNewLine INTERRUPT_HANDLER INT.ParseError #7").unwrap();
        let listing = disassemble(&program);
        assert!(listing.contains("STD.PrintNewLine"));
        assert!(listing.contains("INT.ParseError #7"));
    }

    #[test]
    fn bytes_without_an_opcode_decode_as_data() {
        let listing = disassemble(&[250]);
        assert!(listing.contains("DATA 250"));
    }
}
