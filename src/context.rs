//! Machine context save/restore.
//!
//! Two primitives, semantically identical to `setjmp`/`longjmp` restricted
//! to the callee-saved register set: `save_context` captures just enough of
//! the current call frame to resume it later from anywhere, and
//! `restore_context` jumps back into a previously saved frame as if
//! `save_context` had just returned a caller-chosen nonzero value. No
//! floating-point or vector state is preserved: fibers must not carry FP
//! state across a yield.
//!
//! The register set is architecture-specific, so the two primitives are
//! implemented once per supported ABI and nowhere else in the crate branches
//! on `target_arch`.

#[cfg(target_arch = "x86_64")]
mod arch {
    /// Callee-saved registers plus the instruction and stack pointers, in
    /// the order the System V x86-64 ABI requires a callee to preserve them.
    #[repr(C)]
    #[derive(Default)]
    pub struct Context {
        pub rbx: u64,
        pub r12: u64,
        pub r13: u64,
        pub r14: u64,
        pub r15: u64,
        pub rbp: u64,
        pub rsp: u64,
        pub rip: u64,
    }

    std::arch::global_asm!(
        ".global lwt_save_context",
        "lwt_save_context:",
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], r12",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r14",
        "mov [rdi + 0x20], r15",
        "mov [rdi + 0x28], rbp",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x30], rax",
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax",
        "xor eax, eax",
        "ret",
    );

    std::arch::global_asm!(
        ".global lwt_restore_context",
        "lwt_restore_context:",
        "mov rbx, [rdi + 0x00]",
        "mov r12, [rdi + 0x08]",
        "mov r13, [rdi + 0x10]",
        "mov r14, [rdi + 0x18]",
        "mov r15, [rdi + 0x20]",
        "mov rbp, [rdi + 0x28]",
        "mov rsp, [rdi + 0x30]",
        "mov rax, rsi",
        "jmp qword ptr [rdi + 0x38]",
    );

    std::arch::global_asm!(
        ".global lwt_switch_stack_and_call",
        "lwt_switch_stack_and_call:",
        // rdi = new stack top, rsi = arg1, rdx = arg2, rcx = entry fn ptr
        "mov rsp, rdi",
        "sub rsp, 8",
        "mov qword ptr [rsp], 0",
        "mov rdi, rsi",
        "mov rsi, rdx",
        "jmp rcx",
    );

    extern "C" {
        pub fn lwt_save_context(ctx: *mut Context) -> usize;
        pub fn lwt_restore_context(ctx: *const Context, retval: usize) -> !;
        pub fn lwt_switch_stack_and_call(new_sp: usize, arg1: usize, arg2: usize, entry: usize) -> !;
    }
}

#[cfg(target_arch = "x86")]
mod arch {
    #[repr(C)]
    #[derive(Default)]
    pub struct Context {
        pub ebx: u32,
        pub esi: u32,
        pub edi: u32,
        pub ebp: u32,
        pub esp: u32,
        pub eip: u32,
    }

    std::arch::global_asm!(
        ".global lwt_save_context",
        "lwt_save_context:",
        "mov eax, [esp + 4]",
        "mov [eax + 0x00], ebx",
        "mov [eax + 0x04], esi",
        "mov [eax + 0x08], edi",
        "mov [eax + 0x0c], ebp",
        "lea ecx, [esp + 4]",
        "mov [eax + 0x10], ecx",
        "mov ecx, [esp]",
        "mov [eax + 0x14], ecx",
        "xor eax, eax",
        "ret",
    );

    std::arch::global_asm!(
        ".global lwt_restore_context",
        "lwt_restore_context:",
        "mov eax, [esp + 4]",
        "mov edx, [esp + 8]",
        "mov ebx, [eax + 0x00]",
        "mov esi, [eax + 0x04]",
        "mov edi, [eax + 0x08]",
        "mov ebp, [eax + 0x0c]",
        "mov esp, [eax + 0x10]",
        "mov eax, edx",
        "jmp dword ptr [eax + 0x14]",
    );

    std::arch::global_asm!(
        ".global lwt_switch_stack_and_call",
        "lwt_switch_stack_and_call:",
        // cdecl: [esp+4]=new_sp, [esp+8]=arg1, [esp+12]=arg2, [esp+16]=entry
        "mov eax, [esp + 4]",
        "mov ecx, [esp + 8]",
        "mov edx, [esp + 12]",
        "mov ebx, [esp + 16]",
        "mov esp, eax",
        "sub esp, 16",
        "mov [esp], edx",
        "mov [esp + 4], ecx",
        "jmp ebx",
    );

    extern "C" {
        pub fn lwt_save_context(ctx: *mut Context) -> usize;
        pub fn lwt_restore_context(ctx: *const Context, retval: usize) -> !;
        pub fn lwt_switch_stack_and_call(new_sp: usize, arg1: usize, arg2: usize, entry: usize) -> !;
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("this runtime's context switch is only implemented for x86 and x86_64, per its explicit portability non-goal");

pub use arch::Context;

/// Saves the current call frame into `ctx`. Returns `0` on the direct
/// return from this call; returns the nonzero `retval` that some later
/// `restore_context(ctx, retval)` passed, as if this call had returned that
/// value instead. `retval` passed to `restore_context` must never be zero.
#[inline(always)]
pub fn save_context(ctx: &mut Context) -> usize {
    unsafe { arch::lwt_save_context(ctx as *mut Context) }
}

/// Resumes a context previously captured by [`save_context`], making that
/// call site return `retval`. Never returns. `retval` must be nonzero.
#[inline(always)]
pub fn restore_context(ctx: &Context, retval: usize) -> ! {
    debug_assert_ne!(retval, 0, "retval=0 is reserved for a direct save_context return");
    unsafe { arch::lwt_restore_context(ctx as *const Context, retval) }
}

/// One-time bootstrap: switches the stack pointer to `new_sp` (the top of a
/// freshly acquired fiber stack) and jumps into `entry(arg1, arg2)`, which
/// must never return. This is the only place the crate moves to a stack
/// that wasn't given to it by the OS at thread start.
///
/// # Safety
/// `new_sp` must be the top of a valid, sufficiently large stack region
/// that nothing else is using.
#[inline(always)]
pub unsafe fn switch_stack_and_call(
    new_sp: usize,
    arg1: usize,
    arg2: usize,
    entry: extern "C" fn(usize, usize) -> !,
) -> ! {
    arch::lwt_switch_stack_and_call(new_sp, arg1, arg2, entry as usize)
}
