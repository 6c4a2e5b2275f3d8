//! Context switch primitive for x86_64
//!
//! Saves the callee-saved register file and FPU state on the outgoing
//! task's kernel stack, parks the stack pointer in the outgoing task
//! record, then restores the incoming task symmetrically. Execution
//! resumes in the incoming task's saved frame when `ret` pops its
//! return address.
//!
//! The frame layout (top of stack downward) is:
//!
//! ```text
//!   return address        (pushed by the call)
//!   rbp rbx r12 r13 r14 r15 rax
//!   512-byte fxsave area  (16-byte aligned)
//! ```
//!
//! The extra rax push keeps rsp 16-byte aligned for fxsave/fxrstor.
//! New tasks are given a hand-built frame of this exact shape (see the
//! scheduler's stack bootstrap).

/// Size of the fxsave area
pub const FXSAVE_AREA_SIZE: usize = 512;

/// Number of general-purpose registers in the switch frame
pub const SAVED_GPR_COUNT: usize = 7;

/// Total bytes the switch frame occupies below the return address
pub const SWITCH_FRAME_SIZE: usize = FXSAVE_AREA_SIZE + SAVED_GPR_COUNT * 8;

#[cfg(not(test))]
core::arch::global_asm!(
    r#"
    .global kestrel_context_switch
    kestrel_context_switch:
        push rbp
        push rbx
        push r12
        push r13
        push r14
        push r15
        push rax
        sub rsp, 512
        fxsave [rsp]
        mov [rdi], rsp
        mov rsp, [rsi]
        fxrstor [rsp]
        add rsp, 512
        pop rax
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbx
        pop rbp
        ret
    "#
);

#[cfg(not(test))]
extern "C" {
    fn kestrel_context_switch(old_rsp_slot: *mut u64, new_rsp_slot: *const u64);
}

/// Switch from the current task to the one whose stack pointer is in
/// `new_rsp_slot`, saving the current stack pointer into
/// `old_rsp_slot`.
///
/// # Safety
/// Both slots must point at valid task records, and the incoming
/// task's saved stack must carry a well-formed switch frame.
pub unsafe fn context_switch(old_rsp_slot: *mut u64, new_rsp_slot: *const u64) {
    #[cfg(not(test))]
    kestrel_context_switch(old_rsp_slot, new_rsp_slot);

    #[cfg(test)]
    {
        // Host tests exercise scheduler bookkeeping only; the switch
        // itself is a no-op.
        let _ = (old_rsp_slot, new_rsp_slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constants() {
        // fxrstor demands 16-byte alignment; a page-aligned stack top
        // minus the frame must stay aligned.
        assert_eq!((SWITCH_FRAME_SIZE + 8) % 16, 0);
        assert_eq!(SWITCH_FRAME_SIZE, 512 + 56);
    }
}
