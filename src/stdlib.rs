//! Built-in services reached through the SYSCALL opcodes.
//!
//! Arguments travel on the machine stack; each service documents its own
//! pop order. Console output goes straight to stdout with ANSI escape
//! sequences for cursor, color, and clearing, matching what the console
//! syscalls promise to any terminal that understands VT sequences.
use crate::interpreter::{Interpreter, VmError};
use crate::machine::{Addr, Word};
use crate::opcodes::{Color, Interrupt, SyscallNumber};
use atty::Stream;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use log::debug;
use rand::Rng;
use std::io::{self, BufRead, Write as IoWrite};
use std::time::Duration;

impl Interpreter {
    /// Dispatch one syscall by number. Unknown numbers are fatal.
    pub(crate) fn syscall(&mut self, number: Word) -> Result<(), VmError> {
        let service = SyscallNumber::from_byte(number)
            .ok_or_else(|| VmError::Fatal(format!("Syscall not implemented: {}", number)))?;
        debug!("syscall {}", service);

        match service {
            // Non-destructive: prints the top of stack, leaves it there.
            SyscallNumber::PrintInt => {
                print!("{}", self.machine.peek());
            }
            SyscallNumber::PrintInt16 => {
                print!("{}", self.machine.peek_addr());
            }
            SyscallNumber::PrintChar => {
                print!("{}", self.machine.peek() as char);
            }
            SyscallNumber::PrintCharPop => {
                let c = self.machine.pop();
                print!("{}", c as char);
            }
            SyscallNumber::PrintNewLine => {
                println!();
            }
            // Pops a string address; prints bytes up to the terminator.
            SyscallNumber::PrintString => {
                let address = self.machine.pop_addr();
                let s = self.read_string_from_memory(address);
                print!("{}", s);
            }
            SyscallNumber::ReadString => {
                let max_len = self.machine.pop();
                let address = self.machine.pop_addr();
                let token = self.read_input_token().map_err(VmError::Fatal)?;
                self.write_string_to_memory(&token, address, max_len);
            }
            SyscallNumber::ReadKey => {
                let key = self.poll_key().map_err(VmError::Fatal)?;
                self.machine.push(key);
            }
            SyscallNumber::ConsoleClear => {
                print!("\x1b[2J\x1b[H");
                let _ = io::stdout().flush();
            }
            // Pops row then column, both zero-based.
            SyscallNumber::SetConsoleCursorPosition => {
                let row = self.machine.pop() as u16 + 1;
                let col = self.machine.pop() as u16 + 1;
                print!("\x1b[{};{}H", row, col);
                let _ = io::stdout().flush();
            }
            // Pops foreground then background color codes.
            SyscallNumber::SetConsoleColors => {
                let fg = Color::from_byte(self.machine.pop()).unwrap_or(Color::White);
                let bg = Color::from_byte(self.machine.pop()).unwrap_or(Color::Black);
                print!("\x1b[{};{}m", bg.bg_sgr(), fg.fg_sgr());
                let _ = io::stdout().flush();
            }
            // Pops a flag: nonzero shows the cursor, zero hides it.
            SyscallNumber::ShowConsoleCursor => {
                let visible = self.machine.pop();
                print!("{}", if visible != 0 { "\x1b[?25h" } else { "\x1b[?25l" });
                let _ = io::stdout().flush();
            }
            SyscallNumber::IntToString => {
                let value = self.machine.pop();
                let max_len = self.machine.pop();
                let address = self.machine.pop_addr();
                self.write_string_to_memory(&value.to_string(), address, max_len);
            }
            SyscallNumber::StringToInt => {
                let address = self.machine.pop_addr();
                let s = self.read_string_from_memory(address);
                match s.trim().parse::<i64>() {
                    Ok(v) => self.machine.push(v as Word),
                    Err(_) => return Err(VmError::Fault(Interrupt::ParseError)),
                }
            }
            SyscallNumber::MemCpy => {
                let length = self.machine.pop();
                let target = self.machine.pop_addr();
                let source = self.machine.pop_addr();
                for i in 0..Addr::from(length) {
                    let v = self.machine.read_memory(source.wrapping_add(i));
                    self.machine.memory[target.wrapping_add(i) as usize] = v;
                }
            }
            // Length is 16-bit here; the fill loops over a whole region.
            SyscallNumber::MemSet => {
                let value = self.machine.pop();
                let length = self.machine.pop_addr();
                let address = self.machine.pop_addr();
                for i in 0..length {
                    self.machine.memory[address.wrapping_add(i) as usize] = value;
                }
            }
            SyscallNumber::MemSwap => {
                let length = self.machine.pop();
                let target = self.machine.pop_addr();
                let source = self.machine.pop_addr();
                for i in 0..Addr::from(length) {
                    let s = source.wrapping_add(i) as usize;
                    let t = target.wrapping_add(i) as usize;
                    self.machine.memory.swap(s, t);
                }
            }
            // Pushes the address of the first mismatch inside the first
            // chunk, or 0 when the regions are equal.
            SyscallNumber::MemCmp => {
                let length = self.machine.pop();
                let target = self.machine.pop_addr();
                let source = self.machine.pop_addr();
                let mut result: Addr = 0;
                for i in 0..Addr::from(length) {
                    let s = self.machine.read_memory(source.wrapping_add(i));
                    let t = self.machine.read_memory(target.wrapping_add(i));
                    if s != t {
                        result = source.wrapping_add(i);
                        break;
                    }
                }
                self.machine.push_addr(result);
            }
            SyscallNumber::Strlen => {
                let address = self.machine.pop_addr();
                let mut length: Addr = 0;
                while self.machine.read_memory(address.wrapping_add(length)) != 0 {
                    length += 1;
                }
                self.machine.push_addr(length);
            }
            SyscallNumber::Sleep => {
                let ms = self.machine.pop_addr();
                let _ = io::stdout().flush();
                std::thread::sleep(Duration::from_millis(u64::from(ms)));
            }
            // Pops max then min; the result is inclusive on both ends.
            SyscallNumber::GetRandomNumber => {
                let max = self.machine.pop();
                let min = self.machine.pop();
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                let v = self.machine.rng.gen_range(lo..=hi);
                self.machine.push(v);
            }
        }
        Ok(())
    }

    /// Bytes at `address` up to (not including) the zero terminator.
    fn read_string_from_memory(&self, address: Addr) -> String {
        let mut out = String::new();
        let mut at = address;
        loop {
            let byte = self.machine.read_memory(at);
            if byte == 0 {
                break;
            }
            out.push(byte as char);
            at = at.wrapping_add(1);
        }
        out
    }

    /// Copy `s` into memory at `address`, truncated to `max_len - 1` bytes,
    /// always zero-terminated.
    fn write_string_to_memory(&mut self, s: &str, address: Addr, max_len: Word) {
        let length = s.len().min(usize::from(max_len).saturating_sub(1));
        for (i, byte) in s.bytes().take(length).enumerate() {
            self.machine.memory[address as usize + i] = byte;
        }
        self.machine.memory[address as usize + length] = 0;
    }

    /// Next whitespace-delimited token from stdin. A full line is read and
    /// split at once; leftover tokens feed subsequent calls.
    fn read_input_token(&mut self) -> Result<String, String> {
        loop {
            if !self.pending_input.is_empty() {
                return Ok(self.pending_input.remove(0));
            }
            let _ = io::stdout().flush();
            let mut line = String::new();
            let n = io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(|e| format!("Cannot read from stdin: {}", e))?;
            if n == 0 {
                return Ok(String::new());
            }
            self.pending_input
                .extend(line.split_whitespace().map(str::to_string));
        }
    }

    /// Non-blocking key poll; pushes 0 when no key is pending or stdin is
    /// not a terminal. Raw mode is entered only for the duration of the poll.
    fn poll_key(&mut self) -> Result<Word, String> {
        if !atty::is(Stream::Stdin) {
            return Ok(0);
        }
        terminal::enable_raw_mode().map_err(|e| format!("Cannot enter raw mode: {}", e))?;
        let key = self.poll_key_raw();
        terminal::disable_raw_mode().map_err(|e| format!("Cannot leave raw mode: {}", e))?;
        key
    }

    fn poll_key_raw(&mut self) -> Result<Word, String> {
        if !event::poll(Duration::from_millis(0)).map_err(|e| format!("Key poll failed: {}", e))? {
            return Ok(0);
        }
        let ev = event::read().map_err(|e| format!("Key read failed: {}", e))?;
        if let Event::Key(key) = ev {
            if key.kind == KeyEventKind::Press {
                return Ok(match key.code {
                    KeyCode::Char(c) => c as Word,
                    KeyCode::Enter => b'\n',
                    KeyCode::Tab => b'\t',
                    KeyCode::Backspace => 0x08,
                    KeyCode::Esc => 0x1b,
                    _ => 0,
                });
            }
        }
        Ok(0)
    }
}
