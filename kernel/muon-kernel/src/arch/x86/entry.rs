//! Interrupt entry stubs and the context-switch primitive.
//!
//! Every vector funnels through `vector_common`, which completes the
//! [`TrapFrame`] layout the hardware began: the stub pushes a zero error
//! code where the CPU did not, then the vector number; the common path
//! pushes the general-purpose registers and the data segment, loads the
//! kernel data selectors, and calls [`dispatch_trap`] with `esp` as the
//! frame pointer. The unwind path (also used by [`switch_to_frame`])
//! reverses it: pop `ds`, `popad`, discard the vector/error slots,
//! `iretd`.
//!
//! [`TrapFrame`]: muon_core::arch::x86::TrapFrame
//! [`dispatch_trap`]: super::interrupts::dispatch_trap

use muon_core::arch::x86::TrapFrame;

// Exception vectors 8, 10-14, and 17 push a hardware error code; every
// other stub pushes a zero placeholder so the frame layout is uniform.
core::arch::global_asm!(
    r#"
.macro vector_noerr num
    .global vector_stub_\num
vector_stub_\num:
    push 0
    push \num
    jmp vector_common
.endm

.macro vector_err num
    .global vector_stub_\num
vector_stub_\num:
    push \num
    jmp vector_common
.endm

vector_noerr 0
vector_noerr 1
vector_noerr 2
vector_noerr 3
vector_noerr 4
vector_noerr 5
vector_noerr 6
vector_noerr 7
vector_err   8
vector_noerr 9
vector_err   10
vector_err   11
vector_err   12
vector_err   13
vector_err   14
vector_noerr 15
vector_noerr 16
vector_err   17
vector_noerr 18
vector_noerr 19
vector_noerr 20
vector_noerr 21
vector_noerr 22
vector_noerr 23
vector_noerr 24
vector_noerr 25
vector_noerr 26
vector_noerr 27
vector_noerr 28
vector_noerr 29
vector_noerr 30
vector_noerr 31
vector_noerr 32
vector_noerr 33
vector_noerr 34
vector_noerr 35
vector_noerr 36
vector_noerr 37
vector_noerr 38
vector_noerr 39
vector_noerr 40
vector_noerr 41
vector_noerr 42
vector_noerr 43
vector_noerr 44
vector_noerr 45
vector_noerr 46
vector_noerr 47
vector_noerr 128

vector_common:
    pushad
    push ds
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    push esp
    call {dispatch}
    add esp, 4
    pop ds
    popad
    add esp, 8
    iretd

// Address table consumed by the IDT builder: vectors 0..=47 in order.
.global vector_stub_table
vector_stub_table:
    .long vector_stub_0,  vector_stub_1,  vector_stub_2,  vector_stub_3
    .long vector_stub_4,  vector_stub_5,  vector_stub_6,  vector_stub_7
    .long vector_stub_8,  vector_stub_9,  vector_stub_10, vector_stub_11
    .long vector_stub_12, vector_stub_13, vector_stub_14, vector_stub_15
    .long vector_stub_16, vector_stub_17, vector_stub_18, vector_stub_19
    .long vector_stub_20, vector_stub_21, vector_stub_22, vector_stub_23
    .long vector_stub_24, vector_stub_25, vector_stub_26, vector_stub_27
    .long vector_stub_28, vector_stub_29, vector_stub_30, vector_stub_31
    .long vector_stub_32, vector_stub_33, vector_stub_34, vector_stub_35
    .long vector_stub_36, vector_stub_37, vector_stub_38, vector_stub_39
    .long vector_stub_40, vector_stub_41, vector_stub_42, vector_stub_43
    .long vector_stub_44, vector_stub_45, vector_stub_46, vector_stub_47
"#,
    dispatch = sym super::interrupts::dispatch_trap,
);

unsafe extern "C" {
    #[allow(non_upper_case_globals)]
    static vector_stub_table: [u32; 48];
    fn vector_stub_128();
}

/// Entry-stub addresses for vectors 0..=47, in order.
#[must_use]
pub fn vector_stubs() -> &'static [u32; 48] {
    // SAFETY: The table is emitted by the global_asm block above.
    unsafe { &vector_stub_table }
}

/// Entry-stub address for the system-call vector (0x80).
#[must_use]
pub fn syscall_stub() -> u32 {
    vector_stub_128 as usize as u32
}

/// Switches to a thread by unwinding its saved trap frame.
///
/// Loads the frame pointer into `esp` and runs the common restore path:
/// pop `ds`, `popad`, discard the vector/error slots, `iretd`. Never
/// returns; the caller must already have updated TSS `esp0` and, if the
/// process changed, CR3.
///
/// # Safety
///
/// `frame` must point to a complete, valid [`TrapFrame`] whose code
/// segment and stack are consistent with the current page directory.
pub unsafe fn switch_to_frame(frame: *const TrapFrame) -> ! {
    // SAFETY: Caller contract; the sequence mirrors the interrupt unwind
    // path exactly.
    unsafe {
        core::arch::asm!(
            "mov esp, {frame}",
            "pop ds",
            "popad",
            "add esp, 8",
            "iretd",
            frame = in(reg) frame,
            options(noreturn),
        )
    }
}
