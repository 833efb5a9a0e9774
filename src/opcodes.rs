//! Instruction set, interrupt codes, syscall numbers and console colors.
//!
//! Opcode numbering is positional and fixed: the byte value of an opcode is
//! its position in the `opcodes!` list below. Reordering this list changes
//! the binary encoding of every assembled program, so new opcodes go at the
//! end only.
use std::collections::HashMap;
use std::fmt;

macro_rules! opcodes {
    ($($variant:ident => $mnemonic:literal),* $(,)?) => {
        /// A single VM instruction. The discriminant is the encoded byte.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant),*
        }

        impl Opcode {
            /// Every opcode, ordered by byte value.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            /// The assembler-facing mnemonic for this opcode.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $mnemonic),*
                }
            }
        }
    };
}

opcodes! {
    Nop => "NOP",

    // Stack operations
    Push => "PUSH",
    PushN => "PUSHN",
    PushN2 => "PUSHN2",
    Pop => "POP",
    PopN => "POPN",
    PopN2 => "POPN2",
    Swap => "SWAP",
    Dup => "DUP",

    // Direct register transfer (selector 0=IP, 1=SP, 2=FP)
    PushReg => "PUSH_REG",
    PopReg => "POP_REG",

    // 8-bit arithmetic
    Add => "ADD",
    AddC => "ADDC",
    SubC => "SUBC",
    Sub => "SUB",
    Sub2 => "SUB2",
    Mul => "MUL",
    MulC => "MULC",
    Div => "DIV",
    Div2 => "DIV2",
    Div216 => "DIV216",
    Mod => "MOD",
    Inc => "INC",
    Dec => "DEC",

    // 8-bit bitwise and logical
    And => "AND",
    Or => "OR",
    LAnd => "LAND",
    LOr => "LOR",
    Flip => "FLIP",
    Not => "NOT",
    Xor => "XOR",
    Lsh => "LSH",
    Rsh => "RSH",

    // 8-bit comparisons, result is one byte 0/1
    Eq => "EQ",
    Ne => "NE",
    Less => "LESS",
    LessOrEq => "LESS_OR_EQ",
    Greater => "GREATER",
    GreaterOrEq => "GREATER_OR_EQ",
    Zero => "ZERO",
    NZero => "NZERO",

    // Control flow (absolute)
    Jmp => "JMP",
    Jmp2 => "JMP2",
    Jf => "JF",
    Jf2 => "JF2",
    Jt => "JT",
    Jt2 => "JT2",
    Case => "CASE",
    Else => "ELSE",

    // Function calls
    Call => "CALL",
    Ret => "RET",
    Call2 => "CALL2",

    // Global (pointer) access; every one of these updates the pointer register
    LoadGlobal => "LOAD_GLOBAL",
    StoreGlobal => "STORE_GLOBAL",
    LoadGlobal16 => "LOAD_GLOBAL16",
    StoreGlobal16 => "STORE_GLOBAL16",

    // Frame-relative access. LOCAL offsets count forward from FP; ARG offsets
    // count backward past the two call-linkage slots.
    LoadLocal => "LOAD_LOCAL",
    LoadArg => "LOAD_ARG",
    LoadLocal16 => "LOAD_LOCAL16",
    LoadArg16 => "LOAD_ARG16",
    StoreLocal => "STORE_LOCAL",
    StoreArg => "STORE_ARG",
    StoreLocal16 => "STORE_LOCAL16",
    StoreArg16 => "STORE_ARG16",

    InterruptHandler => "INTERRUPT_HANDLER",
    Syscall => "SYSCALL",
    Syscall2 => "SYSCALL2",
    Debugger => "DEBUGGER",

    // 16-bit instruction set
    PushNextSp => "PUSH_NEXT_SP",
    Push16 => "PUSH16",
    Add16 => "ADD16",
    Add16C => "ADD16C",
    Sub16C => "SUB16C",
    Mod16 => "MOD16",
    Sub16 => "SUB16",
    Sub216 => "SUB216",
    Mul16 => "MUL16",
    Mul16C => "MUL16C",
    Inc16 => "INC16",
    Dec16 => "DEC16",
    Extend => "EXTEND",
    Downcast => "DOWNCAST",
    Less16 => "LESS16",
    LessOrEq16 => "LESS_OR_EQ16",
    Greater16 => "GREATER16",
    GreaterOrEq16 => "GREATER_OR_EQ16",
    Zero16 => "ZERO16",
    NZero16 => "NZERO16",
    Eq16 => "EQ16",
    Ne16 => "NE16",
    Dup16 => "DUP16",
    Swap16 => "SWAP16",

    // NVRAM interface
    LoadNvram => "LOAD_NVRAM",
    StoreNvram => "STORE_NVRAM",

    // Position-independent code
    Push16Rel => "PUSH16_REL",
    JmpRel => "JMP_REL",
    JfRel => "JF_REL",
    JtRel => "JT_REL",
    CaseRel => "CASE_REL",
    ElseRel => "ELSE_REL",
    CallRel => "CALL_REL",

    PushStackStart => "PUSH_STACK_START",
    Roll3 => "ROLL3",
    Neg => "NEG",
    StoreGlobal2 => "STORE_GLOBAL2",
    StoreGlobal216 => "STORE_GLOBAL216",
    Halt => "HALT",

    // 16-bit bitwise
    And16 => "AND16",
    Or16 => "OR16",
    Xor16 => "XOR16",
    Flip16 => "FLIP16",
    Lsh16 => "LSH16",
    Rsh16 => "RSH16",

    // Conditional jumps testing a 16-bit value
    Jt16 => "JT16",
    Jf16 => "JF16",

    // Fused macro instructions. Each is semantically identical to the
    // primitive sequence named in the interpreter's dispatch arm.
    MacroPopExtX2Add16 => "MACRO_POP_EXT_X2_ADD16",
    MacroPopExtX2Add16Lg16 => "MACRO_POP_EXT_X2_ADD16_LG16",
    MacroPopExtX2Add16Lg16Ll16 => "MACRO_POP_EXT_X2_ADD16_LG16_LL16",
    MacroAdd8To16 => "MACRO_ADD8_TO_16",
    MacroAdd16To8 => "MACRO_ADD16_TO_8",
    MacroAndX => "MACRO_ANDX",
    MacroOrX => "MACRO_ORX",
    MacroLsh16By8 => "MACRO_LSH16_BY8",
    MacroIncLocal => "MACRO_INC_LOCAL",
    MacroDecLocal => "MACRO_DEC_LOCAL",
    MacroIncLocal16 => "MACRO_INC_LOCAL16",
    MacroDecLocal16 => "MACRO_DEC_LOCAL16",
    MacroX2 => "MACRO_X2",
    MacroX216 => "MACRO_X216",
    MacroX3 => "MACRO_X3",
    MacroDiv2 => "MACRO_DIV2",
    MacroDiv3 => "MACRO_DIV3",

    // Pointer register access (set by the global load/store family)
    GetPtr => "GET_PTR",
    LoadGlobalPtr => "LOAD_GLOBAL_PTR",
    LoadGlobalPtr16 => "LOAD_GLOBAL_PTR16",
    StoreGlobalPtr => "STORE_GLOBAL_PTR",
    StoreGlobalPtr16 => "STORE_GLOBAL_PTR16",

    MacroConditionalJf => "MACRO_CONDITIONAL_JF",
    MacroSetLocal => "MACRO_SET_LOCAL",
    MacroSetLocal16 => "MACRO_SET_LOCAL16",
    StoreLocalKeep => "STORE_LOCAL_KEEP",
    StoreLocalKeep16 => "STORE_LOCAL_KEEP16",
    MacroLoadGlobalVar16 => "MACRO_LOAD_GLOBAL_VAR16",
    MacroLoadGlobalVar => "MACRO_LOAD_GLOBAL_VAR",

    // Pushes the carry flag as 0/1 without consuming anything
    PushCarry => "PUSH_CARRY",
}

lazy_static! {
    static ref MNEMONIC_TABLE: HashMap<&'static str, Opcode> = {
        let mut m = HashMap::new();
        for &op in Opcode::ALL {
            m.insert(op.mnemonic(), op);
        }
        m
    };
}

impl Opcode {
    /// Decode a raw byte into an opcode, if the byte is mapped.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Opcode::ALL.get(byte as usize).copied()
    }

    /// Case-insensitive mnemonic lookup, as the assembler sees tokens.
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        MNEMONIC_TABLE
            .get(name.to_ascii_uppercase().as_str())
            .copied()
    }

    /// How many operand bytes follow this opcode in the program stream.
    ///
    /// Lengths are fixed per opcode, not self-describing; the interpreter and
    /// the disassembler both depend on this exact table.
    pub fn operand_len(self) -> u16 {
        use Opcode::*;
        match self {
            Push | PushN | PopN | PushReg | PopReg | AddC | SubC | MulC | LoadLocal | LoadArg
            | LoadLocal16 | LoadArg16 | StoreLocal | StoreArg | StoreLocal16 | StoreArg16
            | Syscall | MacroIncLocal | MacroDecLocal | MacroIncLocal16 | MacroDecLocal16
            | StoreLocalKeep | StoreLocalKeep16 | MacroPopExtX2Add16Lg16Ll16 => 1,
            Push16 | Jmp | Jt | Jf | Call | Add16C | Sub16C | Mul16C | Else | Push16Rel
            | JmpRel | JfRel | JtRel | ElseRel | CallRel | Jt16 | Jf16 | MacroLoadGlobalVar
            | MacroLoadGlobalVar16 | MacroSetLocal => 2,
            Case | CaseRel | InterruptHandler | MacroConditionalJf | MacroSetLocal16 => 3,
            _ => 0,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Recoverable fault codes routable to user-installed handler bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Interrupt {
    NoError = 0,
    DivisionByZeroError = 1,
    ParseError = 2,
}

impl Interrupt {
    pub const ALL: &'static [Interrupt] = &[
        Interrupt::NoError,
        Interrupt::DivisionByZeroError,
        Interrupt::ParseError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Interrupt::NoError => "NoError",
            Interrupt::DivisionByZeroError => "DivisionByZeroError",
            Interrupt::ParseError => "ParseError",
        }
    }

    pub fn from_byte(byte: u8) -> Option<Interrupt> {
        Interrupt::ALL.get(byte as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<Interrupt> {
        Interrupt::ALL
            .iter()
            .find(|i| i.name().eq_ignore_ascii_case(name))
            .copied()
    }
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Standard library call numbers. Referenced from assembly as `STD.<name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyscallNumber {
    PrintInt = 0,
    PrintInt16 = 1,
    PrintChar = 2,
    PrintCharPop = 3,
    PrintString = 4,
    PrintNewLine = 5,
    ReadString = 6,
    ReadKey = 7,
    SetConsoleCursorPosition = 8,
    ShowConsoleCursor = 9,
    SetConsoleColors = 10,
    ConsoleClear = 11,
    StringToInt = 12,
    IntToString = 13,
    MemCpy = 14,
    MemSet = 15,
    MemSwap = 16,
    MemCmp = 17,
    Strlen = 18,
    Sleep = 19,
    GetRandomNumber = 20,
}

impl SyscallNumber {
    pub const ALL: &'static [SyscallNumber] = &[
        SyscallNumber::PrintInt,
        SyscallNumber::PrintInt16,
        SyscallNumber::PrintChar,
        SyscallNumber::PrintCharPop,
        SyscallNumber::PrintString,
        SyscallNumber::PrintNewLine,
        SyscallNumber::ReadString,
        SyscallNumber::ReadKey,
        SyscallNumber::SetConsoleCursorPosition,
        SyscallNumber::ShowConsoleCursor,
        SyscallNumber::SetConsoleColors,
        SyscallNumber::ConsoleClear,
        SyscallNumber::StringToInt,
        SyscallNumber::IntToString,
        SyscallNumber::MemCpy,
        SyscallNumber::MemSet,
        SyscallNumber::MemSwap,
        SyscallNumber::MemCmp,
        SyscallNumber::Strlen,
        SyscallNumber::Sleep,
        SyscallNumber::GetRandomNumber,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SyscallNumber::PrintInt => "PrintInt",
            SyscallNumber::PrintInt16 => "PrintInt16",
            SyscallNumber::PrintChar => "PrintChar",
            SyscallNumber::PrintCharPop => "PrintCharPop",
            SyscallNumber::PrintString => "PrintString",
            SyscallNumber::PrintNewLine => "PrintNewLine",
            SyscallNumber::ReadString => "ReadString",
            SyscallNumber::ReadKey => "ReadKey",
            SyscallNumber::SetConsoleCursorPosition => "SetConsoleCursorPosition",
            SyscallNumber::ShowConsoleCursor => "ShowConsoleCursor",
            SyscallNumber::SetConsoleColors => "SetConsoleColors",
            SyscallNumber::ConsoleClear => "ConsoleClear",
            SyscallNumber::StringToInt => "StringToInt",
            SyscallNumber::IntToString => "IntToString",
            SyscallNumber::MemCpy => "MemCpy",
            SyscallNumber::MemSet => "MemSet",
            SyscallNumber::MemSwap => "MemSwap",
            SyscallNumber::MemCmp => "MemCmp",
            SyscallNumber::Strlen => "Strlen",
            SyscallNumber::Sleep => "Sleep",
            SyscallNumber::GetRandomNumber => "GetRandomNumber",
        }
    }

    pub fn from_byte(byte: u8) -> Option<SyscallNumber> {
        SyscallNumber::ALL.get(byte as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<SyscallNumber> {
        SyscallNumber::ALL
            .iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .copied()
    }
}

impl fmt::Display for SyscallNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Console palette exposed to bytecode via the SetConsoleColors syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    Black = 0,
    Red = 1,
    Green = 2,
    Yellow = 3,
    Blue = 4,
    Magenta = 5,
    Cyan = 6,
    White = 7,
    BrightBlack = 8,
    BrightRed = 9,
    BrightGreen = 10,
    BrightYellow = 11,
    BrightBlue = 12,
    BrightMagenta = 13,
    BrightCyan = 14,
    BrightWhite = 15,
    Gray = 16,
    BrightGray = 17,
}

impl Color {
    pub const ALL: &'static [Color] = &[
        Color::Black,
        Color::Red,
        Color::Green,
        Color::Yellow,
        Color::Blue,
        Color::Magenta,
        Color::Cyan,
        Color::White,
        Color::BrightBlack,
        Color::BrightRed,
        Color::BrightGreen,
        Color::BrightYellow,
        Color::BrightBlue,
        Color::BrightMagenta,
        Color::BrightCyan,
        Color::BrightWhite,
        Color::Gray,
        Color::BrightGray,
    ];

    pub fn from_byte(byte: u8) -> Option<Color> {
        Color::ALL.get(byte as usize).copied()
    }

    /// SGR foreground parameter: 30-37 for the base palette, 90-97 bright.
    /// Gray and BrightGray have no SGR slot of their own and fall back to
    /// non-bright white.
    pub fn fg_sgr(self) -> u8 {
        match self {
            Color::Gray | Color::BrightGray => 37,
            c if (c as u8) < 8 => 30 + c as u8,
            c => 90 + (c as u8 - 8),
        }
    }

    /// SGR background parameter: 40-47 base, 100-107 bright, white fallback
    /// for the two gray aliases.
    pub fn bg_sgr(self) -> u8 {
        match self {
            Color::Gray | Color::BrightGray => 47,
            c if (c as u8) < 8 => 40 + c as u8,
            c => 100 + (c as u8 - 8),
        }
    }
}
