#![crate_name = "bytevm"]

#[macro_use]
extern crate lazy_static;

pub mod assembler;
pub mod disasm;
pub mod interpreter;
pub mod machine;
pub mod nvram;
pub mod opcodes;
pub mod stdlib;

#[cfg(test)]
mod assembler_tests;
#[cfg(test)]
mod interpreter_tests;

/*
Memory layout of a loaded machine

0                program image (entry point at address 0)
stack_start      runtime stack, growing upward
                 frame: args, saved IP, saved FP, locals (FP points here)
memory_size      end of addressable memory

NVRAM is a separate 65536-byte file, not part of this address space.
*/
