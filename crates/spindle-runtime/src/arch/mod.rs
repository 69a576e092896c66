//! Architecture-specific context switching
//!
//! Each architecture module provides the same three items:
//!
//! - `SavedRegs` - the callee-saved register file plus stack and instruction
//!   pointers, written by one switch and consumed by the next
//! - `init_context` - prime a fresh stack so the first switch lands in the
//!   fiber entry trampoline
//! - `context_switch` - save the current execution into `old`, restore from
//!   `new`, and jump

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, SavedRegs};
    }
}
