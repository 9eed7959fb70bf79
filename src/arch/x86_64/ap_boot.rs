//! AP trampoline image and long-mode entry.
//!
//! `ap_trampoline_start..ap_trampoline_end` is linked into the kernel but
//! only ever executes as a copy at `TRAMPOLINE_BASE`, so every absolute
//! address in it is computed against that base. It reads its parameters from
//! the page footer:
//!
//! 1. real mode: load either its own GDT or the call-gate GDT from the page,
//!    set CR0.PE, far jump to 32-bit code
//! 2. protected mode: PAE, CR3 from the footer, EFER.LME, CR0.PG
//! 3. compatibility mode: far jump (direct) or far call through the gate
//!    (call gate) into `ap_start64`
//!
//! `ap_start64` picks this CPU's stack by APIC id and calls [`ap_entry`],
//! which moves onto the primary's GDT and IDT (through `ap_online`) before
//! enabling interrupts.

use core::arch::global_asm;
use core::cell::UnsafeCell;
use core::ptr::addr_of;

use spin::Once;
use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::instructions::{hlt, interrupts, tables};
use x86_64::registers::control::Cr3;
use x86_64::structures::gdt::{DescriptorFlags, SegmentSelector};
use x86_64::structures::DescriptorTablePointer;

use crate::smp::trampoline::{
    FOOTER_ADDR, FOOTER_ENTRY, FOOTER_GATE_SELECTOR, FOOTER_GDT_LIMIT, FOOTER_GDT_OFFSET,
    FOOTER_KIND, FOOTER_PAGE_TABLE, FOOTER_STACK_BASE, FOOTER_STACK_SIZE,
};
use crate::smp::types::TRAMPOLINE_SCRATCH;
use crate::smp::{
    InterruptController, TrampolineKind, TrampolineSource, AP_STACK_SIZE, MAX_CPUS, TRAMPOLINE_BASE,
};

extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
    fn ap_start64();
}

global_asm!(
    r#"
    .pushsection .text.ap_trampoline, "ax"
    .balign 16
    .global ap_trampoline_start
    .global ap_trampoline_end

    .code16
ap_trampoline_start:
    cli
    cld
    xorw %ax, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss

    cmpl ${callgate}, ({footer_kind})
    je 6f
    lgdtl (AP_TRAMP_GDT_PTR)
    jmp 2f
6:
    movw ({footer_gdt_limit}), %ax
    movw %ax, (AP_TRAMP_SCRATCH_PTR)
    movl ({footer_gdt_offset}), %eax
    addl ${base}, %eax
    movl %eax, (AP_TRAMP_SCRATCH_PTR + 2)
    lgdtl (AP_TRAMP_SCRATCH_PTR)
2:
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl ${code32}, $AP_TRAMP_START32

    .code32
ap_trampoline_start32:
    movw ${data32}, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %fs
    movw %ax, %gs
    movw %ax, %ss
    movl $AP_TRAMP_STACK_TOP, %esp

    movl %cr4, %eax
    orl $(1 << 5), %eax
    movl %eax, %cr4
    movl ({footer_page_table}), %eax
    movl %eax, %cr3
    movl $0xC0000080, %ecx
    rdmsr
    orl $(1 << 8), %eax
    wrmsr
    movl %cr0, %eax
    orl $(1 << 31), %eax
    movl %eax, %cr0

    cmpl ${callgate}, ({footer_kind})
    je 3f
    movl ({footer_entry}), %eax
    movl %eax, (AP_TRAMP_FAR_TARGET)
    movw ${code64}, (AP_TRAMP_FAR_TARGET + 4)
    ljmpl *(AP_TRAMP_FAR_TARGET)
3:
    movl $0, (AP_TRAMP_FAR_TARGET)
    movw ({footer_gate_selector}), %ax
    movw %ax, (AP_TRAMP_FAR_TARGET + 4)
    lcalll *(AP_TRAMP_FAR_TARGET)
4:
    hlt
    jmp 4b

    .balign 8
ap_trampoline_gdt:
    .quad 0
    .quad {gdt_code32}
    .quad {gdt_data32}
    .quad {gdt_code64}
ap_trampoline_gdt_ptr:
    .word ap_trampoline_gdt_ptr - ap_trampoline_gdt - 1
    .long {base} + (ap_trampoline_gdt - ap_trampoline_start)
ap_trampoline_scratch_ptr:
    .word 0
    .long 0
ap_trampoline_far_target:
    .long 0
    .word 0
ap_trampoline_end:

    .set AP_TRAMP_GDT_PTR, {base} + (ap_trampoline_gdt_ptr - ap_trampoline_start)
    .set AP_TRAMP_SCRATCH_PTR, {base} + (ap_trampoline_scratch_ptr - ap_trampoline_start)
    .set AP_TRAMP_FAR_TARGET, {base} + (ap_trampoline_far_target - ap_trampoline_start)
    .set AP_TRAMP_START32, {base} + (ap_trampoline_start32 - ap_trampoline_start)
    .set AP_TRAMP_STACK_TOP, {base} + (ap_trampoline_end - ap_trampoline_start) + {scratch}

    .code64
    .popsection

    .pushsection .text.ap_start64, "ax"
    .global ap_start64
    .balign 16
ap_start64:
    xorw %ax, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movl $1, %eax
    cpuid
    shrl $24, %ebx
    leaq 1(%rbx), %rax
    imulq ({footer_stack_size}), %rax
    addq ({footer_stack_base}), %rax
    andq $-16, %rax
    movq %rax, %rsp
    xorl %ebp, %ebp
    call {ap_entry}
5:
    hlt
    jmp 5b
    .popsection
"#,
    base = const TRAMPOLINE_BASE,
    scratch = const TRAMPOLINE_SCRATCH,
    callgate = const TrampolineKind::CallGate as u32,
    footer_kind = const FOOTER_ADDR + FOOTER_KIND as u64,
    footer_page_table = const FOOTER_ADDR + FOOTER_PAGE_TABLE as u64,
    footer_entry = const FOOTER_ADDR + FOOTER_ENTRY as u64,
    footer_stack_base = const FOOTER_ADDR + FOOTER_STACK_BASE as u64,
    footer_stack_size = const FOOTER_ADDR + FOOTER_STACK_SIZE as u64,
    footer_gdt_offset = const FOOTER_ADDR + FOOTER_GDT_OFFSET as u64,
    footer_gdt_limit = const FOOTER_ADDR + FOOTER_GDT_LIMIT as u64,
    footer_gate_selector = const FOOTER_ADDR + FOOTER_GATE_SELECTOR as u64,
    code32 = const crate::smp::trampoline::CODE32_SELECTOR,
    data32 = const crate::smp::trampoline::DATA32_SELECTOR,
    code64 = const crate::smp::trampoline::CODE64_SELECTOR,
    gdt_code32 = const DescriptorFlags::KERNEL_CODE32.bits(),
    gdt_data32 = const DescriptorFlags::KERNEL_DATA.bits(),
    gdt_code64 = const DescriptorFlags::KERNEL_CODE64.bits(),
    ap_entry = sym ap_entry,
    options(att_syntax)
);

#[repr(C, align(16))]
struct ApStacks(UnsafeCell<[[u8; AP_STACK_SIZE]; MAX_CPUS]>);

// SAFETY: only ever touched through the raw base handed to the trampoline;
// each AP owns the slot of its APIC id.
unsafe impl Sync for ApStacks {}

/// Indexed by APIC id, which must stay below `MAX_CPUS`.
static AP_STACKS: ApStacks = ApStacks(UnsafeCell::new([[0; AP_STACK_SIZE]; MAX_CPUS]));

/// The primary's descriptor tables and kernel selectors, shared by every AP.
/// The trampoline GDT only lives long enough to reach `ap_start64`.
#[derive(Clone, Copy)]
struct BootTables {
    gdt: DescriptorTablePointer,
    idt: DescriptorTablePointer,
    code: SegmentSelector,
    data: SegmentSelector,
}

static BOOT_TABLES: Once<BootTables> = Once::new();

pub fn trampoline_source() -> TrampolineSource {
    BOOT_TABLES.call_once(|| BootTables {
        gdt: tables::sgdt(),
        idt: tables::sidt(),
        code: CS::get_reg(),
        data: SS::get_reg(),
    });

    // SAFETY: linker-provided bounds of the assembled image.
    let image = unsafe {
        let start = addr_of!(ap_trampoline_start);
        let end = addr_of!(ap_trampoline_end);
        core::slice::from_raw_parts(start, end as usize - start as usize)
    };

    TrampolineSource {
        image,
        entry: ap_start64 as usize as u64,
        page_table: Cr3::read().0.start_address().as_u64(),
        stack_base: AP_STACKS.0.get() as u64,
        stack_size: AP_STACK_SIZE as u64,
    }
}

/// Switches the calling AP to the primary's GDT and IDT. Until this runs,
/// CS still selects the trampoline's code64 entry, which the IDT gates know
/// nothing about.
pub fn load_boot_descriptors() {
    let Some(boot) = BOOT_TABLES.get() else {
        crate::kfatal!("SMP: AP started before the boot descriptor tables were recorded");
        panic!("SMP: AP started before the boot descriptor tables were recorded");
    };

    // SAFETY: both tables belong to the kernel and live for the whole run;
    // the selectors were read from the primary while it ran on that GDT.
    // GS is left alone so the CPU-local base survives.
    unsafe {
        tables::lgdt(&boot.gdt);
        CS::set_reg(boot.code);
        DS::set_reg(boot.data);
        ES::set_reg(boot.data);
        SS::set_reg(boot.data);
        tables::lidt(&boot.idt);
    }
}

extern "C" fn ap_entry() -> ! {
    let smp = super::smp();
    smp.platform().reset();
    smp.ap_online();

    interrupts::enable();
    loop {
        hlt();
    }
}
