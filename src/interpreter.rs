//! The fetch-decode-execute loop.
//!
//! Each step reads one opcode at IP, executes its effect on the machine
//! image, then advances IP by the opcode's fixed encoded length unless the
//! instruction wrote IP itself (control transfers set `skip` to zero).
//! Recoverable faults are typed values inspected right here in the loop:
//! an installed handler gets a CALL-style transfer, anything else ends the
//! run with a diagnostic naming the fault.
use crate::machine::{Addr, Machine, Word, ADDRESS_SIZE, FP_REGISTER, IP_REGISTER, SP_REGISTER};
use crate::opcodes::{Interrupt, Opcode};
use indexmap::IndexMap;
use log::{debug, info};

/// Error channel of a single instruction's execution.
///
/// `Fault` is recoverable through the interrupt subsystem; `Fatal` always
/// terminates the run (corrupt image, invalid syscall number, and so on).
#[derive(Debug)]
pub enum VmError {
    Fault(Interrupt),
    Fatal(String),
}

impl From<String> for VmError {
    fn from(message: String) -> Self {
        VmError::Fatal(message)
    }
}

/// Outcome of a single interpreter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Instruction executed (faults routed to a handler land here too).
    Executed(Opcode),
    /// HALT reached; the machine is done.
    Halted,
    /// A fault was raised with no handler installed for it.
    Interrupted(Interrupt),
}

/// Per-opcode execution counts and stack usage from a profiled run.
#[derive(Debug)]
pub struct ProfileReport {
    /// Executed count per opcode, descending.
    pub counts: IndexMap<Opcode, u64>,
    /// Highest stack address reached.
    pub max_stack_pointer: Addr,
    /// Total instructions executed.
    pub executed_instructions: u64,
}

/// The interpreter driving one machine to completion.
pub struct Interpreter {
    pub machine: Machine,
    /// Whitespace-delimited tokens buffered from stdin for ReadString.
    pub(crate) pending_input: Vec<String>,
}

impl Interpreter {
    pub fn new(machine: Machine) -> Self {
        Interpreter {
            machine,
            pending_input: Vec::new(),
        }
    }

    /// Run until HALT or an unhandled fault.
    ///
    /// Every exit path, including fatal decode errors, releases the NVRAM
    /// handle before returning.
    pub fn run(&mut self) -> Result<(), String> {
        info!("starting execution at IP {}", self.machine.ip());
        let result = self.run_loop();
        self.machine.release_nvram();
        result
    }

    fn run_loop(&mut self) -> Result<(), String> {
        loop {
            match self.step()? {
                StepResult::Executed(_) => {}
                StepResult::Halted => return Ok(()),
                StepResult::Interrupted(code) => {
                    return Err(format!("Program interrupted: {}", code));
                }
            }
        }
    }

    /// Run to completion while counting executed opcodes.
    pub fn run_profiled(&mut self) -> Result<ProfileReport, String> {
        let mut counts: IndexMap<Opcode, u64> = IndexMap::new();
        let result = loop {
            match self.step() {
                Ok(StepResult::Executed(op)) => *counts.entry(op).or_insert(0) += 1,
                Ok(StepResult::Halted) => {
                    *counts.entry(Opcode::Halt).or_insert(0) += 1;
                    break Ok(());
                }
                Ok(StepResult::Interrupted(code)) => {
                    break Err(format!("Program interrupted: {}", code));
                }
                Err(e) => break Err(e),
            }
        };
        self.machine.release_nvram();
        result?;

        counts.sort_by(|_, a, _, b| b.cmp(a));
        Ok(ProfileReport {
            counts,
            max_stack_pointer: self.machine.max_stack_pointer(),
            executed_instructions: self.machine.executed_instruction_count(),
        })
    }

    /// Execute exactly one instruction.
    ///
    /// Public so embedders can single-step; `run` is a loop over this.
    pub fn step(&mut self) -> Result<StepResult, String> {
        let ip = self.machine.ip();
        let byte = self.machine.read_memory(ip);
        let op = Opcode::from_byte(byte)
            .ok_or_else(|| format!("Instruction not implemented: {} at address {}", byte, ip))?;
        self.machine.count_instruction();

        // Total encoded length; control transfers zero this out themselves.
        let mut skip = 1 + op.operand_len();

        match self.execute(op, &mut skip) {
            Ok(()) => {}
            Err(VmError::Fault(code)) => {
                if let Some(&handler) = self.machine.handlers.get(&code) {
                    debug!("fault {} routed to handler at {}", code, handler);
                    // The faulting instruction has no CALL operand bytes to
                    // step over on return, so the saved IP is biased back by
                    // one address size: handler RET resumes at fault IP + 1.
                    self.call(handler, -(i32::from(ADDRESS_SIZE)));
                    self.machine.count_instruction();
                    skip = 0;
                } else {
                    self.machine.release_nvram();
                    return Ok(StepResult::Interrupted(code));
                }
            }
            Err(VmError::Fatal(message)) => return Err(message),
        }

        if op == Opcode::Halt {
            self.machine.release_nvram();
            return Ok(StepResult::Halted);
        }

        self.machine.add_to_register(IP_REGISTER, i32::from(skip));
        Ok(StepResult::Executed(op))
    }

    /// CALL transfer: push the raw IP (plus `bias`), push FP, jump, and open
    /// the new frame at the current SP. RET compensates for the CALL
    /// instruction's operand bytes by resuming at saved IP + 3.
    fn call(&mut self, address: Addr, bias: i32) {
        let return_ip = (i32::from(self.machine.ip()) + bias) as Addr;
        self.machine.push_addr(return_ip);
        let fp = self.machine.fp();
        self.machine.push_addr(fp);
        self.machine.write_register(IP_REGISTER, address);
        let sp = self.machine.sp();
        self.machine.write_register(FP_REGISTER, sp);
    }

    /// Push an 8-bit arithmetic result, recording overflow/underflow in the
    /// carry flag. The stored result wraps to the low byte.
    fn push_with_carry(&mut self, value: i32) {
        self.machine.carry = !(0..=0xFF).contains(&value);
        self.machine.push(value as Word);
    }

    /// 16-bit counterpart of `push_with_carry`.
    fn push_addr_with_carry(&mut self, value: i64) {
        self.machine.carry = !(0..=0xFFFF).contains(&value);
        self.machine.push_addr(value as Addr);
    }

    /// Address of a frame local: locals grow forward from FP.
    fn local_addr(&self, offset: Word) -> Addr {
        self.machine.fp().wrapping_add(Addr::from(offset))
    }

    /// Address of a call argument: backward from FP, past the two
    /// address-sized linkage slots the CALL pushed.
    fn arg_addr(&self, offset: Word) -> Addr {
        self.machine
            .fp()
            .wrapping_sub(Addr::from(offset) + 2 * ADDRESS_SIZE)
    }

    /// Condition codes for MACRO_CONDITIONAL_JF; pop behavior matches the
    /// comparison primitive each code names.
    fn eval_condition(&mut self, cond: Word) -> Result<bool, VmError> {
        let m = &mut self.machine;
        Ok(match cond {
            0 => {
                let (a, b) = (m.pop(), m.pop());
                a == b
            }
            1 => {
                let (a, b) = (m.pop(), m.pop());
                a != b
            }
            2 => {
                let (a, b) = (m.pop(), m.pop());
                a < b
            }
            3 => {
                let (a, b) = (m.pop(), m.pop());
                a <= b
            }
            4 => {
                let (a, b) = (m.pop(), m.pop());
                a > b
            }
            5 => {
                let (a, b) = (m.pop(), m.pop());
                a >= b
            }
            6 => m.pop() == 0,
            7 => m.pop() != 0,
            _ => return Err(VmError::Fatal(format!("Invalid condition code: {}", cond))),
        })
    }

    /// All opcode semantics live in this one dispatch match.
    fn execute(&mut self, op: Opcode, skip: &mut u16) -> Result<(), VmError> {
        use Opcode::*;
        match op {
            Nop => {}
            Halt => {}

            // ---- stack ----
            Push => {
                let arg = self.machine.program_byte(1);
                self.machine.push(arg);
            }
            PushN => {
                let n = self.machine.program_byte(1);
                self.machine.add_to_register(SP_REGISTER, i32::from(n));
                self.machine.note_sp_high_water();
            }
            PushN2 => {
                let n = self.machine.pop();
                self.machine.add_to_register(SP_REGISTER, i32::from(n));
                self.machine.note_sp_high_water();
            }
            Pop => {
                self.machine.pop();
            }
            PopN => {
                let n = self.machine.program_byte(1);
                self.machine.add_to_register(SP_REGISTER, -i32::from(n));
            }
            PopN2 => {
                let n = self.machine.pop();
                self.machine.add_to_register(SP_REGISTER, -i32::from(n));
            }
            Swap => {
                let sp = self.machine.sp() as usize;
                self.machine.memory.swap(sp - 1, sp - 2);
            }
            Swap16 => {
                let sp = self.machine.sp();
                let low = self.machine.read16(sp - 2 * ADDRESS_SIZE);
                let high = self.machine.read16(sp - ADDRESS_SIZE);
                self.machine.write16(sp - 2 * ADDRESS_SIZE, high);
                self.machine.write16(sp - ADDRESS_SIZE, low);
            }
            Dup => {
                let v = self.machine.peek();
                self.machine.push(v);
            }
            Dup16 => {
                let v = self.machine.peek_addr();
                self.machine.push_addr(v);
            }
            Roll3 => {
                let a = self.machine.pop();
                let b = self.machine.pop();
                let c = self.machine.pop();
                self.machine.push(a);
                self.machine.push(c);
                self.machine.push(b);
            }
            PushNextSp => {
                let sp = self.machine.sp();
                self.machine.push_addr(sp.wrapping_add(ADDRESS_SIZE));
            }
            PushStackStart => {
                let start = self.machine.stack_start();
                self.machine.push_addr(start);
            }
            Push16 => {
                let v = self.machine.program_addr(1);
                self.machine.push_addr(v);
            }
            Push16Rel => {
                let offset = self.machine.program_offs(1);
                let address = (i32::from(self.machine.ip()) + i32::from(offset)) as Addr;
                self.machine.push_addr(address);
            }
            PushCarry => {
                let carry = self.machine.carry;
                self.machine.push(Word::from(carry));
            }

            // ---- register transfer ----
            PushReg => {
                let r = self.machine.program_byte(1);
                if r > 2 {
                    return Err(VmError::Fatal(format!("Invalid register selector: {}", r)));
                }
                let v = self.machine.read_register(r as usize);
                self.machine.push_addr(v);
            }
            PopReg => {
                let r = self.machine.program_byte(1);
                if r > 2 {
                    return Err(VmError::Fatal(format!("Invalid register selector: {}", r)));
                }
                let v = self.machine.pop_addr();
                self.machine.write_register(r as usize, v);
            }

            // ---- 8-bit arithmetic ----
            Add => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.push_with_carry(i32::from(a) + i32::from(b));
            }
            AddC => {
                let c = self.machine.program_byte(1);
                let a = self.machine.pop();
                self.push_with_carry(i32::from(a) + i32::from(c));
            }
            // SUB pops the subtrahend first: second pop minus top of stack.
            Sub => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.push_with_carry(i32::from(a) - i32::from(b));
            }
            Sub2 => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.push_with_carry(i32::from(b) - i32::from(a));
            }
            SubC => {
                let c = self.machine.program_byte(1);
                let a = self.machine.pop();
                self.push_with_carry(i32::from(a) - i32::from(c));
            }
            Mul => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.push_with_carry(i32::from(a) * i32::from(b));
            }
            MulC => {
                let c = self.machine.program_byte(1);
                let a = self.machine.pop();
                self.push_with_carry(i32::from(a) * i32::from(c));
            }
            // The divisor is on top of the stack; checked before dividing.
            Div => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                if b == 0 {
                    return Err(VmError::Fault(Interrupt::DivisionByZeroError));
                }
                self.machine.push(a / b);
            }
            Div2 => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                if a == 0 {
                    return Err(VmError::Fault(Interrupt::DivisionByZeroError));
                }
                self.machine.push(b / a);
            }
            Mod => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                if b == 0 {
                    return Err(VmError::Fault(Interrupt::DivisionByZeroError));
                }
                self.machine.push(a % b);
            }
            Inc => {
                let sp = self.machine.sp() as usize;
                self.machine.memory[sp - 1] = self.machine.memory[sp - 1].wrapping_add(1);
            }
            Dec => {
                let sp = self.machine.sp() as usize;
                self.machine.memory[sp - 1] = self.machine.memory[sp - 1].wrapping_sub(1);
            }
            Neg => {
                let v = self.machine.pop();
                self.machine.push(0u8.wrapping_sub(v));
            }

            // ---- 8-bit bitwise and logical ----
            And => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.machine.push(a & b);
            }
            Or => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.machine.push(a | b);
            }
            Xor => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.machine.push(a ^ b);
            }
            LAnd => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a != 0 && b != 0));
            }
            LOr => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a != 0 || b != 0));
            }
            Flip => {
                let v = self.machine.pop();
                self.machine.push(!v);
            }
            Not => {
                let sp = self.machine.sp() as usize;
                self.machine.memory[sp - 1] = Word::from(self.machine.memory[sp - 1] == 0);
            }
            // Shift amount is on top of the stack; over-wide shifts yield 0.
            Lsh => {
                let (shift, value) = (self.machine.pop(), self.machine.pop());
                self.machine
                    .push(if shift >= 8 { 0 } else { value << shift });
            }
            Rsh => {
                let (shift, value) = (self.machine.pop(), self.machine.pop());
                self.machine
                    .push(if shift >= 8 { 0 } else { value >> shift });
            }

            // ---- 8-bit comparisons ----
            Eq => {
                let (a, b) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a == b));
            }
            Ne => {
                let (a, b) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a != b));
            }
            Less => {
                let (a, b) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a < b));
            }
            LessOrEq => {
                let (a, b) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a <= b));
            }
            Greater => {
                let (a, b) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a > b));
            }
            GreaterOrEq => {
                let (a, b) = (self.machine.pop(), self.machine.pop());
                self.machine.push(Word::from(a >= b));
            }
            Zero => {
                let sp = self.machine.sp() as usize;
                self.machine.memory[sp - 1] = Word::from(self.machine.memory[sp - 1] == 0);
            }
            NZero => {
                let sp = self.machine.sp() as usize;
                self.machine.memory[sp - 1] = Word::from(self.machine.memory[sp - 1] != 0);
            }

            // ---- 16-bit arithmetic ----
            Add16 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.push_addr_with_carry(i64::from(a) + i64::from(b));
            }
            Add16C => {
                let c = self.machine.program_addr(1);
                let a = self.machine.pop_addr();
                self.push_addr_with_carry(i64::from(a) + i64::from(c));
            }
            Sub16 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.push_addr_with_carry(i64::from(a) - i64::from(b));
            }
            Sub216 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.push_addr_with_carry(i64::from(b) - i64::from(a));
            }
            Sub16C => {
                let c = self.machine.program_addr(1);
                let a = self.machine.pop_addr();
                self.push_addr_with_carry(i64::from(a) - i64::from(c));
            }
            Mul16 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.push_addr_with_carry(i64::from(a) * i64::from(b));
            }
            Mul16C => {
                let c = self.machine.program_addr(1);
                let a = self.machine.pop_addr();
                self.push_addr_with_carry(i64::from(a) * i64::from(c));
            }
            Div216 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                if a == 0 {
                    return Err(VmError::Fault(Interrupt::DivisionByZeroError));
                }
                self.machine.push_addr(b / a);
            }
            Mod16 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                if b == 0 {
                    return Err(VmError::Fault(Interrupt::DivisionByZeroError));
                }
                self.machine.push_addr(a % b);
            }
            Inc16 => {
                let at = self.machine.sp() - ADDRESS_SIZE;
                let v = self.machine.read16(at);
                self.machine.write16(at, v.wrapping_add(1));
            }
            Dec16 => {
                let at = self.machine.sp() - ADDRESS_SIZE;
                let v = self.machine.read16(at);
                self.machine.write16(at, v.wrapping_sub(1));
            }
            Extend => {
                let v = self.machine.pop();
                self.machine.push_addr(Addr::from(v));
            }
            Downcast => {
                let v = self.machine.pop_addr();
                self.machine.push(if v > 0xFF { 0xFF } else { v as Word });
            }

            // ---- 16-bit bitwise ----
            And16 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push_addr(a & b);
            }
            Or16 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push_addr(a | b);
            }
            Xor16 => {
                let (b, a) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push_addr(a ^ b);
            }
            Flip16 => {
                let v = self.machine.pop_addr();
                self.machine.push_addr(!v);
            }
            Lsh16 => {
                let (shift, value) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine
                    .push_addr(if shift >= 16 { 0 } else { value << shift });
            }
            Rsh16 => {
                let (shift, value) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine
                    .push_addr(if shift >= 16 { 0 } else { value >> shift });
            }

            // ---- 16-bit comparisons ----
            Eq16 => {
                let (a, b) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push(Word::from(a == b));
            }
            Ne16 => {
                let (a, b) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push(Word::from(a != b));
            }
            Less16 => {
                let (a, b) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push(Word::from(a < b));
            }
            LessOrEq16 => {
                let (a, b) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push(Word::from(a <= b));
            }
            Greater16 => {
                let (a, b) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push(Word::from(a > b));
            }
            GreaterOrEq16 => {
                let (a, b) = (self.machine.pop_addr(), self.machine.pop_addr());
                self.machine.push(Word::from(a >= b));
            }
            Zero16 => {
                let v = self.machine.pop_addr();
                self.machine.push(Word::from(v == 0));
            }
            NZero16 => {
                let v = self.machine.pop_addr();
                self.machine.push(Word::from(v != 0));
            }

            // ---- control flow ----
            Jmp => {
                let address = self.machine.program_addr(1);
                self.machine.write_register(IP_REGISTER, address);
                *skip = 0;
            }
            Jmp2 => {
                let address = self.machine.pop_addr();
                self.machine.write_register(IP_REGISTER, address);
                *skip = 0;
            }
            Jf => {
                let address = self.machine.program_addr(1);
                if self.machine.pop() == 0 {
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            Jt => {
                let address = self.machine.program_addr(1);
                if self.machine.pop() != 0 {
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            Jf2 => {
                let address = self.machine.pop_addr();
                if self.machine.pop() == 0 {
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            Jt2 => {
                let address = self.machine.pop_addr();
                if self.machine.pop() != 0 {
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            Jf16 => {
                let address = self.machine.program_addr(1);
                if self.machine.pop_addr() == 0 {
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            Jt16 => {
                let address = self.machine.program_addr(1);
                if self.machine.pop_addr() != 0 {
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            JmpRel => {
                let offset = self.machine.program_offs(1);
                self.machine.add_to_register(IP_REGISTER, i32::from(offset));
                *skip = 0;
            }
            JfRel => {
                let offset = self.machine.program_offs(1);
                if self.machine.pop() == 0 {
                    self.machine.add_to_register(IP_REGISTER, i32::from(offset));
                    *skip = 0;
                }
            }
            JtRel => {
                let offset = self.machine.program_offs(1);
                if self.machine.pop() != 0 {
                    self.machine.add_to_register(IP_REGISTER, i32::from(offset));
                    *skip = 0;
                }
            }
            Case => {
                let arg = self.machine.program_byte(1);
                let address = self.machine.program_addr(2);
                if self.machine.peek() == arg {
                    self.machine.pop();
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            // Relative displacements are measured from the byte before the
            // fixup slot; here that is the value operand rather than the
            // opcode, so a taken case compensates with +1.
            CaseRel => {
                let arg = self.machine.program_byte(1);
                let offset = self.machine.program_offs(2);
                if self.machine.peek() == arg {
                    self.machine.pop();
                    self.machine
                        .add_to_register(IP_REGISTER, i32::from(offset) + 1);
                    *skip = 0;
                }
            }
            Else => {
                self.machine.pop();
                let address = self.machine.program_addr(1);
                self.machine.write_register(IP_REGISTER, address);
                *skip = 0;
            }
            ElseRel => {
                self.machine.pop();
                let offset = self.machine.program_offs(1);
                self.machine.add_to_register(IP_REGISTER, i32::from(offset));
                *skip = 0;
            }

            // ---- calls ----
            Call => {
                let address = self.machine.program_addr(1);
                self.call(address, 0);
                *skip = 0;
            }
            Call2 => {
                let address = self.machine.pop_addr();
                self.call(address, 0);
                *skip = 0;
            }
            CallRel => {
                let offset = self.machine.program_offs(1);
                let address = (i32::from(self.machine.ip()) + i32::from(offset)) as Addr;
                self.call(address, 0);
                *skip = 0;
            }
            Ret => {
                // Discard locals, restore FP, resume past the CALL encoding.
                let fp = self.machine.fp();
                self.machine.write_register(SP_REGISTER, fp);
                let saved_fp = self.machine.pop_addr();
                self.machine.write_register(FP_REGISTER, saved_fp);
                let return_ip = self.machine.pop_addr();
                self.machine
                    .write_register(IP_REGISTER, return_ip.wrapping_add(ADDRESS_SIZE + 1));
                *skip = 0;
            }

            // ---- global access ----
            LoadGlobal => {
                let address = self.machine.pop_addr();
                self.machine.pointer = address;
                let v = self.machine.read_memory(address);
                self.machine.push(v);
            }
            StoreGlobal => {
                let address = self.machine.pop_addr();
                let value = self.machine.pop();
                self.machine.pointer = address;
                self.machine.memory[address as usize] = value;
            }
            StoreGlobal2 => {
                let value = self.machine.pop();
                let address = self.machine.pop_addr();
                self.machine.pointer = address;
                self.machine.memory[address as usize] = value;
            }
            LoadGlobal16 => {
                let address = self.machine.pop_addr();
                self.machine.pointer = address;
                let v = self.machine.read16(address);
                self.machine.push_addr(v);
            }
            StoreGlobal16 => {
                let address = self.machine.pop_addr();
                let value = self.machine.pop_addr();
                self.machine.pointer = address;
                self.machine.write16(address, value);
            }
            StoreGlobal216 => {
                let value = self.machine.pop_addr();
                let address = self.machine.pop_addr();
                self.machine.pointer = address;
                self.machine.write16(address, value);
            }
            GetPtr => {
                let p = self.machine.pointer;
                self.machine.push_addr(p);
            }
            LoadGlobalPtr => {
                let v = self.machine.read_memory(self.machine.pointer);
                self.machine.push(v);
            }
            LoadGlobalPtr16 => {
                let v = self.machine.read16(self.machine.pointer);
                self.machine.push_addr(v);
            }
            StoreGlobalPtr => {
                let value = self.machine.pop();
                let p = self.machine.pointer;
                self.machine.memory[p as usize] = value;
            }
            StoreGlobalPtr16 => {
                let value = self.machine.pop_addr();
                let p = self.machine.pointer;
                self.machine.write16(p, value);
            }

            // ---- frame-relative access ----
            LoadLocal => {
                let offset = self.machine.program_byte(1);
                let v = self.machine.read_memory(self.local_addr(offset));
                self.machine.push(v);
            }
            LoadArg => {
                let offset = self.machine.program_byte(1);
                let v = self.machine.read_memory(self.arg_addr(offset));
                self.machine.push(v);
            }
            LoadLocal16 => {
                let offset = self.machine.program_byte(1);
                let v = self.machine.read16(self.local_addr(offset));
                self.machine.push_addr(v);
            }
            LoadArg16 => {
                let offset = self.machine.program_byte(1);
                let v = self.machine.read16(self.arg_addr(offset));
                self.machine.push_addr(v);
            }
            StoreLocal => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset);
                let value = self.machine.pop();
                self.machine.memory[address as usize] = value;
            }
            StoreArg => {
                let offset = self.machine.program_byte(1);
                let address = self.arg_addr(offset);
                let value = self.machine.pop();
                self.machine.memory[address as usize] = value;
            }
            StoreLocal16 => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset);
                let value = self.machine.pop_addr();
                self.machine.write16(address, value);
            }
            StoreArg16 => {
                let offset = self.machine.program_byte(1);
                let address = self.arg_addr(offset);
                let value = self.machine.pop_addr();
                self.machine.write16(address, value);
            }
            StoreLocalKeep => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset);
                self.machine.memory[address as usize] = self.machine.peek();
            }
            StoreLocalKeep16 => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset);
                let value = self.machine.peek_addr();
                self.machine.write16(address, value);
            }

            // ---- NVRAM ----
            LoadNvram => {
                let address = self.machine.pop_addr();
                let v = self
                    .machine
                    .nvram()
                    .and_then(|n| n.read_byte(address))
                    .map_err(VmError::Fatal)?;
                self.machine.push(v);
            }
            StoreNvram => {
                let address = self.machine.pop_addr();
                let value = self.machine.pop();
                self.machine
                    .nvram()
                    .and_then(|n| n.write_byte(address, value))
                    .map_err(VmError::Fatal)?;
            }

            // ---- system ----
            InterruptHandler => {
                let code_byte = self.machine.program_byte(1);
                let address = self.machine.program_addr(2);
                let code = Interrupt::from_byte(code_byte).ok_or_else(|| {
                    VmError::Fatal(format!("Invalid interrupt code: {}", code_byte))
                })?;
                if address > 0 {
                    self.machine.handlers.insert(code, address);
                } else {
                    self.machine.handlers.remove(&code);
                }
            }
            Syscall => {
                let number = self.machine.program_byte(1);
                self.syscall(number)?;
            }
            Syscall2 => {
                let number = self.machine.pop();
                self.syscall(number)?;
            }
            Debugger => {
                debug!(
                    "DEBUGGER opcode at {}; backtrace: {:?}",
                    self.machine.ip(),
                    self.machine.backtrace()
                );
            }

            // ---- fused macros ----

            // EXTEND, PUSH16 #2, MUL16, ADD16
            MacroPopExtX2Add16 => {
                let index = Addr::from(self.machine.pop());
                let base = self.machine.pop_addr();
                self.push_addr_with_carry(i64::from(base) + i64::from(index) * 2);
            }
            // EXTEND, PUSH16 #2, MUL16, ADD16, LOAD_GLOBAL16
            MacroPopExtX2Add16Lg16 => {
                let index = Addr::from(self.machine.pop());
                let base = self.machine.pop_addr();
                let sum = i64::from(base) + i64::from(index) * 2;
                self.machine.carry = sum > 0xFFFF;
                let address = sum as Addr;
                self.machine.pointer = address;
                let v = self.machine.read16(address);
                self.machine.push_addr(v);
            }
            // EXTEND, PUSH16 #2, MUL16, ADD16, LOAD_GLOBAL16, LOAD_LOCAL16 x
            MacroPopExtX2Add16Lg16Ll16 => {
                let local_offset = self.machine.program_byte(1);
                let index = Addr::from(self.machine.pop());
                let base = self.machine.pop_addr();
                let sum = i64::from(base) + i64::from(index) * 2;
                self.machine.carry = sum > 0xFFFF;
                let address = sum as Addr;
                self.machine.pointer = address;
                let v = self.machine.read16(address);
                self.machine.push_addr(v);
                let local = self.machine.read16(self.local_addr(local_offset));
                self.machine.push_addr(local);
            }
            // EXTEND, ADD16 with the 8-bit operand on top
            MacroAdd8To16 => {
                let b = Addr::from(self.machine.pop());
                let a = self.machine.pop_addr();
                self.push_addr_with_carry(i64::from(a) + i64::from(b));
            }
            // EXTEND, ADD16 with the 16-bit operand on top
            MacroAdd16To8 => {
                let b = self.machine.pop_addr();
                let a = Addr::from(self.machine.pop());
                self.push_addr_with_carry(i64::from(a) + i64::from(b));
            }
            // AND, EXTEND
            MacroAndX => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.machine.push_addr(Addr::from(a & b));
            }
            // OR, EXTEND
            MacroOrX => {
                let (b, a) = (self.machine.pop(), self.machine.pop());
                self.machine.push_addr(Addr::from(a | b));
            }
            // EXTEND, LSH16
            MacroLsh16By8 => {
                let shift = self.machine.pop();
                let value = self.machine.pop_addr();
                self.machine
                    .push_addr(if shift >= 16 { 0 } else { value << shift });
            }
            // LOAD_LOCAL x, INC, STORE_LOCAL x
            MacroIncLocal => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset) as usize;
                self.machine.memory[address] = self.machine.memory[address].wrapping_add(1);
            }
            MacroDecLocal => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset) as usize;
                self.machine.memory[address] = self.machine.memory[address].wrapping_sub(1);
            }
            // LOAD_LOCAL16 x, INC16, STORE_LOCAL16 x
            MacroIncLocal16 => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset);
                let v = self.machine.read16(address);
                self.machine.write16(address, v.wrapping_add(1));
            }
            MacroDecLocal16 => {
                let offset = self.machine.program_byte(1);
                let address = self.local_addr(offset);
                let v = self.machine.read16(address);
                self.machine.write16(address, v.wrapping_sub(1));
            }
            // PUSH 2, MUL
            MacroX2 => {
                let v = self.machine.pop();
                self.push_with_carry(i32::from(v) * 2);
            }
            // PUSH16 #2, MUL16
            MacroX216 => {
                let v = self.machine.pop_addr();
                self.push_addr_with_carry(i64::from(v) * 2);
            }
            // PUSH 3, MUL
            MacroX3 => {
                let v = self.machine.pop();
                self.push_with_carry(i32::from(v) * 3);
            }
            // PUSH 2, DIV
            MacroDiv2 => {
                let v = self.machine.pop();
                self.machine.push(v / 2);
            }
            // PUSH 3, DIV
            MacroDiv3 => {
                let v = self.machine.pop();
                self.machine.push(v / 3);
            }
            // <comparison>, JF
            MacroConditionalJf => {
                let cond = self.machine.program_byte(1);
                let address = self.machine.program_addr(2);
                if !self.eval_condition(cond)? {
                    self.machine.write_register(IP_REGISTER, address);
                    *skip = 0;
                }
            }
            // PUSH x, STORE_LOCAL y
            MacroSetLocal => {
                let value = self.machine.program_byte(1);
                let offset = self.machine.program_byte(2);
                let address = self.local_addr(offset);
                self.machine.memory[address as usize] = value;
            }
            // PUSH16 #x, STORE_LOCAL16 y
            MacroSetLocal16 => {
                let value = self.machine.program_addr(1);
                let offset = self.machine.program_byte(3);
                let address = self.local_addr(offset);
                self.machine.write16(address, value);
            }
            // PUSH_STACK_START, PUSH16 #x, ADD16, LOAD_GLOBAL16
            MacroLoadGlobalVar16 => {
                let offset = self.machine.program_addr(1);
                let address = self.machine.stack_start().wrapping_add(offset);
                self.machine.pointer = address;
                let v = self.machine.read16(address);
                self.machine.push_addr(v);
            }
            // PUSH_STACK_START, PUSH16 #x, ADD16, LOAD_GLOBAL
            MacroLoadGlobalVar => {
                let offset = self.machine.program_addr(1);
                let address = self.machine.stack_start().wrapping_add(offset);
                self.machine.pointer = address;
                let v = self.machine.read_memory(address);
                self.machine.push(v);
            }
        }
        Ok(())
    }
}
