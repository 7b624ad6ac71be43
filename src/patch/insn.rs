//! Instruction access-size resolution.
//!
//! When a read traps on the watched frame, the engine must answer with
//! exactly as many emulated bytes as the reader asked for. The instruction
//! length is useless for this; what matters is the width of the destination
//! operand of the faulting instruction. This module decodes the 15-byte
//! window at the fault-time RIP with `iced-x86` and extracts that width.
//!
//! # Supported instructions
//!
//! Only the move family is supported: plain `MOV`, zero-extending `MOVZX`,
//! and the widening sign-extension `MOVSXD`. Everything else is reported as
//! unsupported, with its Intel-syntax rendering attached for diagnostics.
//! Getting a width wrong would hand the reader a torn value and break the
//! stealth illusion, so the closed set errs on the side of refusing.
//!
//! All failures here are non-fatal by contract: the caller answers the
//! event with a no-op and the real access proceeds unmodified.

use iced_x86::{
    Decoder, DecoderOptions, Formatter, Instruction, InstructionInfoFactory, IntelFormatter,
    Mnemonic, OpAccess,
};
use thiserror::Error;

/// Maximum length of an x86 instruction, and the size of the byte window
/// read at the faulting RIP.
pub const MAX_INSN_LEN: usize = 15;

/// Processor mode the faulting vCPU executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 32-bit protected mode.
    Bits32,
    /// 64-bit long mode.
    Bits64,
}

impl Mode {
    fn bitness(self) -> u32 {
        match self {
            Mode::Bits32 => 32,
            Mode::Bits64 => 64,
        }
    }
}

/// Byte width of a memory read, as seen by the reader.
///
/// These are the only widths a supported move can read, and `Qword` is the
/// widest substitution the emulation response can carry, so the builder's
/// width precondition holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSize {
    /// 1 byte.
    Byte,
    /// 2 bytes.
    Word,
    /// 4 bytes.
    Dword,
    /// 8 bytes.
    Qword,
}

impl AccessSize {
    /// Width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Word => 2,
            AccessSize::Dword => 4,
            AccessSize::Qword => 8,
        }
    }

    fn from_bytes(n: usize) -> Option<Self> {
        match n {
            1 => Some(AccessSize::Byte),
            2 => Some(AccessSize::Word),
            4 => Some(AccessSize::Dword),
            8 => Some(AccessSize::Qword),
            _ => None,
        }
    }
}

/// Why an access could not be sized.
///
/// None of these are fatal to the event loop; they all degrade to a no-op
/// response and the reader sees the real memory contents.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The byte window did not decode to a valid instruction.
    #[error("failed to decode instruction bytes")]
    DecodeFailed,

    /// The instruction decoded, but its memory access has no read
    /// component.
    #[error("instruction access is not a read")]
    NotAReadAccess,

    /// The instruction reads memory but is outside the supported move
    /// family. Carries the disassembly for the operator.
    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(String),
}

/// Determine the byte width of the memory read performed by the
/// instruction at the start of `bytes`, decoded in `mode`.
///
/// Pure function of its inputs. Trailing bytes after the first instruction
/// are ignored, so callers can pass the full 15-byte RIP window.
pub fn access_size(bytes: &[u8], mode: Mode) -> Result<AccessSize, ResolveError> {
    let mut decoder = Decoder::new(mode.bitness(), bytes, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return Err(ResolveError::DecodeFailed);
    }

    // Reject anything whose memory semantics lack a read before looking at
    // the mnemonic, so a non-read MOV is reported as not-a-read rather
    // than mis-sized.
    let mut info_factory = InstructionInfoFactory::new();
    let info = info_factory.info(&instruction);
    let reads_memory = info.used_memory().iter().any(|mem| {
        matches!(
            mem.access(),
            OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
        )
    });
    if !reads_memory {
        return Err(ResolveError::NotAReadAccess);
    }

    match instruction.mnemonic() {
        Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsxd => {
            // The width to emulate is the destination operand's width, not
            // the width of the memory operand (MOVZX/MOVSXD widen).
            let width = instruction.op0_register().size();
            AccessSize::from_bytes(width)
                .ok_or_else(|| ResolveError::UnsupportedInstruction(render(&instruction)))
        }
        _ => Err(ResolveError::UnsupportedInstruction(render(&instruction))),
    }
}

/// Intel-syntax rendering for diagnostics.
fn render(instruction: &Instruction) -> String {
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    formatter.format(instruction, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve64(bytes: &[u8]) -> Result<AccessSize, ResolveError> {
        access_size(bytes, Mode::Bits64)
    }

    fn resolve32(bytes: &[u8]) -> Result<AccessSize, ResolveError> {
        access_size(bytes, Mode::Bits32)
    }

    #[test]
    fn test_mov_widths_64bit() {
        // mov al, [rax]
        assert_eq!(resolve64(&[0x8a, 0x00]).unwrap(), AccessSize::Byte);
        // mov ax, [rax]
        assert_eq!(resolve64(&[0x66, 0x8b, 0x00]).unwrap(), AccessSize::Word);
        // mov eax, [rax]
        assert_eq!(resolve64(&[0x8b, 0x00]).unwrap(), AccessSize::Dword);
        // mov rax, [rax]
        assert_eq!(resolve64(&[0x48, 0x8b, 0x00]).unwrap(), AccessSize::Qword);
    }

    #[test]
    fn test_mov_widths_32bit() {
        // mov al, [eax]
        assert_eq!(resolve32(&[0x8a, 0x00]).unwrap(), AccessSize::Byte);
        // mov eax, moffs32
        assert_eq!(
            resolve32(&[0xa1, 0x00, 0x10, 0x00, 0x00]).unwrap(),
            AccessSize::Dword
        );
    }

    #[test]
    fn test_zero_extending_moves_report_destination_width() {
        // movzx eax, byte [rax]: reads 1 byte, destination is 4 bytes
        assert_eq!(resolve64(&[0x0f, 0xb6, 0x00]).unwrap(), AccessSize::Dword);
        // movzx rax, word [rax]
        assert_eq!(
            resolve64(&[0x48, 0x0f, 0xb7, 0x00]).unwrap(),
            AccessSize::Qword
        );
    }

    #[test]
    fn test_sign_extending_widening_move() {
        // movsxd rax, dword [rax]
        assert_eq!(resolve64(&[0x48, 0x63, 0x00]).unwrap(), AccessSize::Qword);
    }

    #[test]
    fn test_trailing_window_bytes_are_ignored() {
        let mut window = [0xffu8; MAX_INSN_LEN];
        window[0] = 0x8b;
        window[1] = 0x00;
        assert_eq!(resolve64(&window).unwrap(), AccessSize::Dword);
    }

    #[test]
    fn test_movsx_is_unsupported() {
        // movsx eax, byte [rax]: sign-extends but is not in the closed set
        assert!(matches!(
            resolve64(&[0x0f, 0xbe, 0x00]),
            Err(ResolveError::UnsupportedInstruction(_))
        ));
    }

    #[test]
    fn test_reading_non_move_is_unsupported_with_disassembly() {
        // add eax, [rax]: a read, but not a move
        match resolve64(&[0x03, 0x00]) {
            Err(ResolveError::UnsupportedInstruction(text)) => {
                assert!(text.contains("add"), "disassembly was {text:?}");
            }
            other => panic!("expected UnsupportedInstruction, got {other:?}"),
        }
        // pop rax: reads the stack, still unsupported
        assert!(matches!(
            resolve64(&[0x58]),
            Err(ResolveError::UnsupportedInstruction(_))
        ));
    }

    #[test]
    fn test_non_reads_are_rejected_regardless_of_mnemonic() {
        // mov [rax], eax: memory write
        assert!(matches!(
            resolve64(&[0x89, 0x00]),
            Err(ResolveError::NotAReadAccess)
        ));
        // mov eax, ebx: no memory access at all
        assert!(matches!(
            resolve64(&[0x89, 0xd8]),
            Err(ResolveError::NotAReadAccess)
        ));
        // push rax: stack write only
        assert!(matches!(
            resolve64(&[0x50]),
            Err(ResolveError::NotAReadAccess)
        ));
    }

    #[test]
    fn test_malformed_bytes_fail_decode() {
        // 0x06 (push es) is invalid in 64-bit mode
        assert!(matches!(
            resolve64(&[0x06]),
            Err(ResolveError::DecodeFailed)
        ));
        assert!(matches!(resolve64(&[]), Err(ResolveError::DecodeFailed)));
    }
}
