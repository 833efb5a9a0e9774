//! Line-oriented assembler for the textual instruction format.
//!
//! Single pass over the source with a fixup list: label uses emit a 2-byte
//! placeholder and are patched once all label definitions are known. A
//! mnemonic ending in `_REL` arms relative mode for the next label use on
//! the line; the fixup then stores a signed displacement instead of an
//! absolute address. Every error carries the 1-based source line number.
use crate::machine::{Addr, PROGRAM_BEGIN};
use crate::opcodes::{Interrupt, Opcode, SyscallNumber};
use log::{debug, info};
use std::collections::HashMap;

struct Fixup {
    /// Program offset of the 2-byte placeholder.
    at: Addr,
    label: String,
    line: usize,
    relative: bool,
}

struct Assembler {
    program: Vec<u8>,
    labels: HashMap<String, Addr>,
    fixups: Vec<Fixup>,
    constants: HashMap<String, i64>,
    constants16: HashMap<String, u16>,
    /// Armed by a `_REL` mnemonic, consumed by the next label use.
    relative_mode: bool,
}

/// Assemble source text into an executable image. A trailing HALT is
/// always appended so control cannot run off the end of the program.
pub fn assemble(source: &str) -> Result<Vec<u8>, String> {
    let mut asm = Assembler {
        program: Vec::new(),
        labels: HashMap::new(),
        fixups: Vec::new(),
        constants: HashMap::new(),
        constants16: HashMap::new(),
        relative_mode: false,
    };

    for (index, raw_line) in source.lines().enumerate() {
        asm.assemble_line(raw_line, index + 1)?;
    }
    asm.resolve_fixups()?;
    asm.program.push(Opcode::Halt as u8);

    info!(
        "assembled {} bytes, {} labels",
        asm.program.len(),
        asm.labels.len()
    );
    Ok(asm.program)
}

impl Assembler {
    fn address(&self) -> Addr {
        PROGRAM_BEGIN + self.program.len() as Addr
    }

    fn assemble_line(&mut self, raw_line: &str, line: usize) -> Result<(), String> {
        // String lines are handled before comment stripping so literal `;`
        // and `//` bytes survive.
        if raw_line.trim_start().starts_with('"') {
            return self.emit_string(raw_line.trim(), line);
        }

        let stripped = strip_comment(raw_line);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("CONST16 ") {
            return self.define_const16(trimmed, line);
        }
        if upper.starts_with("CONST ") {
            return self.define_const(trimmed, line);
        }
        for token in trimmed.split_whitespace() {
            self.assemble_token(token, line)?;
        }
        Ok(())
    }

    fn define_const(&mut self, line_text: &str, line: usize) -> Result<(), String> {
        let parts: Vec<&str> = line_text.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(format!("Malformed CONST at line {}", line));
        }
        let value: i64 = parts[2]
            .parse()
            .map_err(|_| format!("Invalid CONST value {} at line {}", parts[2], line))?;
        self.constants.insert(parts[1].to_string(), value);
        Ok(())
    }

    fn define_const16(&mut self, line_text: &str, line: usize) -> Result<(), String> {
        let parts: Vec<&str> = line_text.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(format!("Malformed CONST16 at line {}", line));
        }
        let value: u16 = parts[2]
            .parse()
            .map_err(|_| format!("Invalid CONST16 value {} at line {}", parts[2], line))?;
        self.constants16.insert(parts[1].to_string(), value);
        Ok(())
    }

    /// A quoted string line becomes raw bytes plus a zero terminator. A
    /// leading `!` inside the quotes is consumed without being emitted;
    /// the terminator is still appended.
    fn emit_string(&mut self, line_text: &str, line: usize) -> Result<(), String> {
        let closing = line_text[1..]
            .find('"')
            .ok_or_else(|| format!("Unterminated string at line {}", line))?;
        let mut content = &line_text[1..closing + 1];
        if let Some(rest) = content.strip_prefix('!') {
            content = rest;
        }
        let decoded = decode_escapes(content);
        self.program.extend(decoded.bytes());
        self.program.push(0);
        Ok(())
    }

    fn assemble_token(&mut self, token: &str, line: usize) -> Result<(), String> {
        if let Some(name) = token.strip_prefix(':') {
            if self.labels.contains_key(name) {
                return Err(format!("Duplicate label {} at line {}", name, line));
            }
            let address = self.address();
            debug!("label {} at {}", name, address);
            self.labels.insert(name.to_string(), address);
            return Ok(());
        }

        if let Some(name) = token.strip_prefix('@') {
            self.fixups.push(Fixup {
                at: self.address(),
                label: name.to_string(),
                line,
                relative: self.relative_mode,
            });
            self.relative_mode = false;
            self.program.extend_from_slice(&[0, 0]);
            return Ok(());
        }

        let upper = token.to_ascii_uppercase();

        if let Some(name) = upper.strip_prefix("INT.") {
            let code = Interrupt::from_name(name)
                .ok_or_else(|| format!("Invalid interrupt code {} at line {}", token, line))?;
            self.program.push(code as u8);
            return Ok(());
        }
        if let Some(name) = upper.strip_prefix("STD.") {
            let number = SyscallNumber::from_name(name)
                .ok_or_else(|| format!("Invalid syscall name {} at line {}", token, line))?;
            self.program.push(number as u8);
            return Ok(());
        }
        // Constant names keep the case they were defined with.
        if upper.starts_with("CONST16.") {
            let name = &token[8..];
            let value = *self
                .constants16
                .get(name)
                .ok_or_else(|| format!("Unknown constant {} at line {}", name, line))?;
            // One emitted byte, same as an 8-bit constant reference. 16-bit
            // constants are for PUSH16-style operands that read two source
            // tokens; a lone reference only contributes the low byte.
            self.program.push(value as u8);
            return Ok(());
        }
        if upper.starts_with("CONST.") {
            let name = &token[6..];
            let value = *self
                .constants
                .get(name)
                .ok_or_else(|| format!("Unknown constant {} at line {}", name, line))?;
            self.program.push(value as u8);
            return Ok(());
        }

        if let Some(digits) = token.strip_prefix('#') {
            let value: u16 = digits
                .parse()
                .map_err(|_| format!("Invalid number {} at line {}", token, line))?;
            self.program.extend_from_slice(&value.to_le_bytes());
            return Ok(());
        }

        if let Ok(value) = token.parse::<i64>() {
            self.program.push(value as u8);
            return Ok(());
        }

        if let Some(op) = Opcode::from_mnemonic(token) {
            self.program.push(op as u8);
            if upper.ends_with("_REL") {
                self.relative_mode = true;
            }
            return Ok(());
        }

        Err(format!("Invalid code {} at line {}", token, line))
    }

    /// Patch every label placeholder. Relative fixups store the signed
    /// displacement to the target measured from the byte preceding the
    /// fixup slot (the opcode byte, for the jump family).
    fn resolve_fixups(&mut self) -> Result<(), String> {
        for fixup in &self.fixups {
            let target = *self.labels.get(&fixup.label).ok_or_else(|| {
                format!(
                    "Unknown label {} referenced at line {}",
                    fixup.label, fixup.line
                )
            })?;
            let at = (fixup.at - PROGRAM_BEGIN) as usize;
            let value = if fixup.relative {
                (i32::from(target) - i32::from(fixup.at) + 1) as i16 as u16
            } else {
                target
            };
            self.program[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }
}

/// Everything before the first `;` or `//` comment marker.
fn strip_comment(line: &str) -> &str {
    let semi = line.find(';').unwrap_or(line.len());
    let slashes = line.find("//").unwrap_or(line.len());
    &line[..semi.min(slashes)]
}

fn decode_escapes(s: &str) -> String {
    s.replace("\\n", "\n")
        .replace("\\r", "\r")
        .replace("\\t", "\t")
        .replace("\\0", "\0")
}
