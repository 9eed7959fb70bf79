//! Remote-call interrupt entry.
//!
//! The stub saves the caller-saved registers, calls into Rust and returns
//! with `iretq`. It is an interrupt gate, so interrupts stay disabled for the
//! whole handler and the pending-call slot cannot be re-entered on this CPU.

use core::arch::global_asm;

extern "C" {
    fn smp_ipi_entry();
}

global_asm!(
    r#"
    .pushsection .text.smp_ipi_entry, "ax"
    .global smp_ipi_entry
    .balign 16
smp_ipi_entry:
    push rax
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    cld
    call {dispatch}
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rax
    iretq
    .popsection
"#,
    dispatch = sym smp_ipi_dispatch,
);

// The 5-word interrupt frame plus 9 saved registers keeps RSP 16-byte
// aligned at the call.
extern "C" fn smp_ipi_dispatch() {
    super::smp().handle_ipi();
}

/// Address to install in the IDT for the remote-call vector.
pub fn entry_address() -> u64 {
    smp_ipi_entry as usize as u64
}
