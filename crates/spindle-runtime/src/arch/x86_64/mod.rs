//! x86_64 context switching implementation
//!
//! Uses naked-function inline assembly, stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register file per the System V AMD64 ABI, plus the stack
/// and instruction pointers.
///
/// Field order is load-bearing: the assembly below addresses this struct
/// by fixed byte offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh fiber context
///
/// Sets up `regs` so that the first `context_switch` into it begins
/// execution at the entry trampoline, which tail-calls `entry_fn`.
///
/// # Safety
///
/// `regs` must point to valid SavedRegs memory and `stack_top` must be the
/// top of a live, writable stack.
#[inline]
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry_fn: usize) {
    let sp = stack_top as usize;

    // 16-byte aligned at trampoline entry; the trampoline's `call` then
    // leaves the entry function with the ABI-conformant rsp % 16 == 8.
    let aligned_sp = sp & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = fiber_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // entry function, consumed by the trampoline
    regs.r13 = 0;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First instruction every fiber executes: call the entry function left in
/// r12 by `init_context`. The entry function never returns (it terminates
/// with a final context switch), so anything past the call is unreachable.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!("call r12", "ud2");
}

/// Perform a context switch
///
/// Saves the callee-saved registers and a resume point into `old_regs`,
/// then restores from `new_regs` and jumps. Returns when some later switch
/// restores `old_regs`.
///
/// # Safety
///
/// `old_regs` must be writable; `new_regs` must contain a context produced
/// by `init_context` or a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_regs: *mut SavedRegs, _new_regs: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
