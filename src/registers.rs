/// A snapshot of the guest general purpose registers.
///
/// RAX, RSP, RIP and RFLAGS live in the VMCB state-save area and are written
/// by hardware on a world switch; they are mirrored here around each guest
/// entry so that this structure is always complete for exit handlers.
///
/// The layout is fixed because the guest-entry routine indexes into it.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub rip: u64,
}
const _: () = assert!(core::mem::size_of::<Registers>() == 0x90);
