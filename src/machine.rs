//! Machine image and register state.
//!
//! One contiguous byte array holds the loaded program (from address 0) and
//! the runtime stack (immediately after the program, growing upward). There
//! is no separate data segment; globals live at fixed addresses inside the
//! same array. All multi-byte values are little-endian, always.
use crate::nvram::Nvram;
use crate::opcodes::Interrupt;
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::PathBuf;

/// The VM's storage unit.
pub type Word = u8;
/// A byte position in the flat memory.
pub type Addr = u16;
/// Signed delta added to IP by position-independent control transfers.
pub type Offs = i16;

/// Size in bytes of an address on the stack and in the program stream.
pub const ADDRESS_SIZE: u16 = 2;
/// Where programs are loaded.
pub const PROGRAM_BEGIN: u16 = 0;

pub const IP_REGISTER: usize = 0;
pub const SP_REGISTER: usize = 1;
pub const FP_REGISTER: usize = 2;

/// Complete mutable state of one loaded machine.
pub struct Machine {
    /// Code, then stack, in one flat address space.
    pub memory: Vec<Word>,
    /// IP, SP, FP.
    registers: [Addr; 3],
    /// Overflow/underflow of the most recent arithmetic instruction.
    pub carry: bool,
    /// Last address touched by a global load/store, for the PTR access family.
    pub pointer: Addr,
    /// First address past the loaded program; the stack begins here.
    stack_start: Addr,
    /// High-water mark of SP, for the profiler.
    max_sp: Addr,
    /// Executed instruction count.
    xic: u64,
    /// Fault code -> handler address.
    pub(crate) handlers: HashMap<Interrupt, Addr>,
    /// Lazily opened persistent store; None until first NVRAM access.
    pub(crate) nvram: Option<Nvram>,
    nvram_path: PathBuf,
    /// Process-lifetime random generator for the GetRandomNumber syscall.
    pub(crate) rng: StdRng,
}

impl Machine {
    /// Load a program image into a fresh machine.
    ///
    /// `memory_size` is grown to fit the program plus a few spare control
    /// bytes if the caller asked for less. IP starts at [`PROGRAM_BEGIN`],
    /// SP and FP at the first byte past the program.
    pub fn load(program: &[Word], memory_size: usize, nvram_path: impl Into<PathBuf>) -> Machine {
        let memory_size = memory_size.max(program.len() + 3);
        let mut memory = vec![0; memory_size];
        memory[PROGRAM_BEGIN as usize..PROGRAM_BEGIN as usize + program.len()]
            .copy_from_slice(program);

        let stack_start = PROGRAM_BEGIN + program.len() as Addr;
        debug!(
            "loaded {} program bytes, memory size {}, stack starts at {}",
            program.len(),
            memory_size,
            stack_start
        );

        Machine {
            memory,
            registers: [PROGRAM_BEGIN, stack_start, stack_start],
            carry: false,
            pointer: 0,
            stack_start,
            max_sp: stack_start,
            xic: 0,
            handlers: HashMap::new(),
            nvram: None,
            nvram_path: nvram_path.into(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Replace the random generator with a seeded one, for deterministic runs.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    // ---- registers ----

    pub fn read_register(&self, r: usize) -> Addr {
        self.registers[r]
    }

    pub fn write_register(&mut self, r: usize, value: Addr) {
        self.registers[r] = value;
    }

    pub fn add_to_register(&mut self, r: usize, delta: i32) {
        self.registers[r] = (self.registers[r] as i32).wrapping_add(delta) as Addr;
    }

    pub fn ip(&self) -> Addr {
        self.registers[IP_REGISTER]
    }

    pub fn sp(&self) -> Addr {
        self.registers[SP_REGISTER]
    }

    pub fn fp(&self) -> Addr {
        self.registers[FP_REGISTER]
    }

    /// First address past the loaded program.
    pub fn stack_start(&self) -> Addr {
        self.stack_start
    }

    // ---- little-endian 16-bit access ----

    /// Read a 2-byte little-endian value at `pos`.
    pub fn read16(&self, pos: Addr) -> Addr {
        let p = pos as usize;
        u16::from(self.memory[p + 1]) << 8 | u16::from(self.memory[p])
    }

    /// Write a 2-byte little-endian value at `pos`.
    pub fn write16(&mut self, pos: Addr, value: Addr) {
        let p = pos as usize;
        self.memory[p] = value as Word;
        self.memory[p + 1] = (value >> 8) as Word;
    }

    /// Read a signed 16-bit offset at `pos` (same wire format as `read16`).
    pub fn read_offs(&self, pos: Addr) -> Offs {
        self.read16(pos) as Offs
    }

    // ---- stack primitives ----

    pub fn push(&mut self, value: Word) {
        let sp = self.sp();
        self.memory[sp as usize] = value;
        self.add_to_register(SP_REGISTER, 1);
        if sp + 1 > self.max_sp {
            self.max_sp = sp + 1;
        }
    }

    pub fn push_addr(&mut self, value: Addr) {
        let sp = self.sp();
        self.write16(sp, value);
        self.add_to_register(SP_REGISTER, ADDRESS_SIZE as i32);
        if sp + ADDRESS_SIZE > self.max_sp {
            self.max_sp = sp + ADDRESS_SIZE;
        }
    }

    pub fn pop(&mut self) -> Word {
        let sp = self.sp();
        let value = self.memory[sp as usize - 1];
        self.add_to_register(SP_REGISTER, -1);
        value
    }

    pub fn pop_addr(&mut self) -> Addr {
        let sp = self.sp();
        let value = self.read16(sp - ADDRESS_SIZE);
        self.add_to_register(SP_REGISTER, -(ADDRESS_SIZE as i32));
        value
    }

    /// Byte just below SP without consuming it.
    pub fn peek(&self) -> Word {
        self.memory[self.sp() as usize - 1]
    }

    /// 16-bit value just below SP without consuming it.
    pub fn peek_addr(&self) -> Addr {
        self.read16(self.sp() - ADDRESS_SIZE)
    }

    /// Record the high-water mark after a direct SP adjustment (PUSHN family).
    pub(crate) fn note_sp_high_water(&mut self) {
        let sp = self.sp();
        if sp > self.max_sp {
            self.max_sp = sp;
        }
    }

    // ---- program stream reads, relative to the current IP ----

    /// Operand byte at IP + `offset`.
    pub fn program_byte(&self, offset: u16) -> Word {
        self.memory[(self.ip() + offset) as usize]
    }

    /// 16-bit operand at IP + `offset`.
    pub fn program_addr(&self, offset: u16) -> Addr {
        self.read16(self.ip() + offset)
    }

    /// Signed 16-bit operand at IP + `offset`.
    pub fn program_offs(&self, offset: u16) -> Offs {
        self.read_offs(self.ip() + offset)
    }

    // ---- bookkeeping and inspection hooks ----

    pub(crate) fn count_instruction(&mut self) {
        self.xic += 1;
    }

    /// How far the stack grew during execution.
    pub fn max_stack_pointer(&self) -> Addr {
        self.max_sp
    }

    /// Total executed instruction count.
    pub fn executed_instruction_count(&self) -> u64 {
        self.xic
    }

    pub fn read_memory(&self, address: Addr) -> Word {
        self.memory[address as usize]
    }

    pub fn read_memory_range(&self, address: Addr, length: usize) -> &[Word] {
        &self.memory[address as usize..address as usize + length]
    }

    /// Instruction pointers on the call stack, innermost first, recovered by
    /// walking the saved FP/IP linkage slots below each frame pointer.
    pub fn backtrace(&self) -> Vec<Addr> {
        let mut trace = vec![self.ip()];
        let mut fp = self.fp();
        while fp > self.stack_start {
            let ip = self.read16(fp - 2 * ADDRESS_SIZE);
            fp = self.read16(fp - ADDRESS_SIZE);
            if ip > 0 {
                trace.push(ip);
            }
        }
        trace
    }

    // ---- NVRAM ----

    /// The lazily-opened backing store, created and zero-filled on first use.
    pub(crate) fn nvram(&mut self) -> Result<&mut Nvram, String> {
        if self.nvram.is_none() {
            self.nvram = Some(Nvram::open(&self.nvram_path)?);
        }
        Ok(self.nvram.as_mut().unwrap())
    }

    /// Flush and drop the NVRAM handle. Safe to call on every exit path;
    /// does nothing when the program never touched NVRAM.
    pub fn release_nvram(&mut self) {
        if let Some(nvram) = self.nvram.take() {
            if let Err(e) = nvram.close() {
                debug!("NVRAM close failed: {}", e);
            }
        }
    }
}
