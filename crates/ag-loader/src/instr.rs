//! Allegrex instruction encodings written into import stubs

/// Primary opcodes
const OP_SPECIAL: u32 = 0x00;
const OP_J: u32 = 0x02;

/// SPECIAL function codes
const FN_SYSCALL: u32 = 0x0C;
const FN_ADDU: u32 = 0x21;

/// Syscall code planted in stubs that have not been resolved yet
pub const UNRESOLVED_SYSCALL_CODE: u32 = 0xFFFFF;

pub const NOP: u32 = 0;

/// `j target`
pub fn jump(target: u32) -> u32 {
    (OP_J << 26) | ((target >> 2) & 0x03FF_FFFF)
}

/// `syscall code`
pub fn syscall(code: u32) -> u32 {
    (OP_SPECIAL << 26) | ((code & 0x000F_FFFF) << 6) | FN_SYSCALL
}

/// `addu rd, rs, rt`
pub fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    (OP_SPECIAL << 26) | ((rs & 0x1F) << 21) | ((rt & 0x1F) << 16) | ((rd & 0x1F) << 11) | FN_ADDU
}

/// `addu $v0, $zero, $zero`: makes an ignored import return 0
pub fn clear_v0() -> u32 {
    addu(2, 0, 0)
}

/// Trap left in the delay slot until the import is resolved
pub fn unresolved_trap() -> u32 {
    syscall(UNRESOLVED_SYSCALL_CODE)
}
