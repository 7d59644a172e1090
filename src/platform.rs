//! The privileged-instruction seam.
//!
//! Everything that touches processor state goes through the [`Platform`]
//! trait: feature identification, MSR access, global interrupt flag control,
//! the guest-entry instruction and TLB invalidation. The embedder injects an
//! implementation at initialization instead of the core reaching for ambient
//! globals, which also makes every component of this crate testable against a
//! scripted double.

use x86::cpuid::CpuIdResult;

use crate::{registers::Registers, vmcb::VmcbRaw};

/// Access to privileged processor operations for one logical processor.
pub trait Platform {
    /// Executes CPUID for `leaf`.
    fn cpuid(&self, leaf: u32) -> CpuIdResult;

    /// Reads an MSR.
    fn rdmsr(&self, msr: u32) -> u64;

    /// Writes a value to an MSR.
    fn wrmsr(&mut self, msr: u32, value: u64);

    /// Reads the time-stamp counter.
    fn rdtsc(&self) -> u64;

    /// Clears the global interrupt flag. While clear, no interrupt may be
    /// delivered to the host; the caller must re-enable with [`Self::stgi`]
    /// immediately after the guest-entry instruction returns.
    fn clgi(&mut self);

    /// Sets the global interrupt flag.
    fn stgi(&mut self);

    /// Runs the guest described by `vmcb` until #VMEXIT, exchanging the
    /// general purpose registers in `registers` with the guest's.
    ///
    /// RAX, RSP, RIP and RFLAGS are transferred through the VMCB state-save
    /// area by hardware; the caller synchronizes them with `registers` around
    /// this call.
    fn run_guest(&mut self, vmcb: &mut VmcbRaw, registers: &mut Registers);

    /// Invalidates the TLB entry for `va` tagged with `asid`.
    fn invlpga(&mut self, va: u64, asid: u32);

    /// Returns the physical address of a linear address.
    fn pa(&self, va: *const core::ffi::c_void) -> u64;

    /// Reads `buf.len()` bytes of host physical memory, for diagnostics only.
    fn read_host(&self, pa: u64, buf: &mut [u8]);
}

#[cfg(target_arch = "x86_64")]
pub use hardware::HardwarePlatform;

/// [`Platform`] implementation for an identity-mapped bare-metal host.
#[cfg(target_arch = "x86_64")]
mod hardware {
    use core::arch::{asm, global_asm};

    use alloc::boxed::Box;
    use x86::cpuid::{CpuIdResult, cpuid};

    use crate::{
        error::SvmError, platform::Platform, registers::Registers, support::try_zeroed_box,
        vmcb::VmcbRaw,
    };

    /// Drives the real processor. Linear and physical addresses are assumed
    /// to be identical; hosts that run with a non-identity page table must
    /// provide their own [`Platform`] with a real translation.
    #[derive(Debug)]
    pub struct HardwarePlatform {
        /// VMCB whose state-save area holds host state across VMRUN. The
        /// guest-entry routine runs VMSAVE against it before entering the
        /// guest and VMLOAD after #VMEXIT.
        host_vmcb: Box<VmcbRaw>,
    }

    impl HardwarePlatform {
        pub fn new() -> Result<Self, SvmError> {
            Ok(Self {
                host_vmcb: try_zeroed_box::<VmcbRaw>()?,
            })
        }
    }

    impl Platform for HardwarePlatform {
        fn cpuid(&self, leaf: u32) -> CpuIdResult {
            cpuid!(leaf)
        }

        fn rdmsr(&self, msr: u32) -> u64 {
            unsafe { x86::msr::rdmsr(msr) }
        }

        fn wrmsr(&mut self, msr: u32, value: u64) {
            unsafe { x86::msr::wrmsr(msr, value) };
        }

        fn rdtsc(&self) -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }

        fn clgi(&mut self) {
            unsafe { asm!("clgi", options(nomem, nostack, preserves_flags)) };
        }

        fn stgi(&mut self) {
            unsafe { asm!("stgi", options(nomem, nostack, preserves_flags)) };
        }

        fn run_guest(&mut self, vmcb: &mut VmcbRaw, registers: &mut Registers) {
            let vmcb_pa = self.pa(core::ptr::from_mut(vmcb).cast());
            let host_vmcb_pa = self.pa(core::ptr::from_ref(self.host_vmcb.as_ref()).cast());
            unsafe { svm_launch(registers, vmcb_pa, host_vmcb_pa) };
        }

        fn invlpga(&mut self, va: u64, asid: u32) {
            // INVLPGA takes its operands implicitly: rAX holds the linear
            // address and ECX the ASID.
            unsafe {
                asm!(
                    "invlpga rax, ecx",
                    in("rax") va,
                    in("ecx") asid,
                    options(nostack, preserves_flags),
                )
            };
        }

        fn pa(&self, va: *const core::ffi::c_void) -> u64 {
            va as u64
        }

        fn read_host(&self, pa: u64, buf: &mut [u8]) {
            unsafe { core::ptr::copy_nonoverlapping(pa as *const u8, buf.as_mut_ptr(), buf.len()) };
        }
    }

    unsafe extern "C" {
        /// Runs the guest until #VMEXIT occurs.
        ///
        /// The offsets into `registers` are those asserted by the
        /// [`Registers`] layout check.
        fn svm_launch(registers: *mut Registers, vmcb_pa: u64, host_vmcb_pa: u64);
    }

    global_asm!(
        r#"
.global svm_launch
svm_launch:
    push    rbx
    push    rbp
    push    r12
    push    r13
    push    r14
    push    r15
    push    rdx             // host VMCB PA
    push    rdi             // registers

    // Host FS/GS/TR and syscall state into the host VMCB, guest's out of the
    // guest VMCB. VMRUN itself covers only a subset of the state-save area.
    mov     rax, rdx
    vmsave  rax
    mov     rax, rsi
    vmload  rax

    // Load the guest GPRs. RAX/RSP/RIP/RFLAGS come from the VMCB. RDI last,
    // as it holds the pointer.
    mov     rbx, [rdi + 0x08]
    mov     rcx, [rdi + 0x10]
    mov     rdx, [rdi + 0x18]
    mov     rsi, [rdi + 0x28]
    mov     rbp, [rdi + 0x30]
    mov     r8,  [rdi + 0x38]
    mov     r9,  [rdi + 0x40]
    mov     r10, [rdi + 0x48]
    mov     r11, [rdi + 0x50]
    mov     r12, [rdi + 0x58]
    mov     r13, [rdi + 0x60]
    mov     r14, [rdi + 0x68]
    mov     r15, [rdi + 0x70]
    mov     rdi, [rdi + 0x20]

    vmrun   rax
    vmsave  rax

    // Store the guest GPRs back. Host RAX was restored by hardware and still
    // holds the guest VMCB PA.
    push    rdi
    mov     rdi, [rsp + 8]
    mov     [rdi + 0x08], rbx
    mov     [rdi + 0x10], rcx
    mov     [rdi + 0x18], rdx
    mov     [rdi + 0x28], rsi
    mov     [rdi + 0x30], rbp
    mov     [rdi + 0x38], r8
    mov     [rdi + 0x40], r9
    mov     [rdi + 0x48], r10
    mov     [rdi + 0x50], r11
    mov     [rdi + 0x58], r12
    mov     [rdi + 0x60], r13
    mov     [rdi + 0x68], r14
    mov     [rdi + 0x70], r15
    pop     rax             // guest RDI
    mov     [rdi + 0x20], rax

    add     rsp, 8          // registers
    pop     rax             // host VMCB PA
    vmload  rax

    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbp
    pop     rbx
    ret
"#
    );
}
