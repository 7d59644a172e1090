//! The virtual machine control block (VMCB), the hardware-defined structure
//! describing a guest to be executed: what to intercept, and the guest
//! register state exchanged on every world switch.
//!
//! The layout is mandated byte-for-byte by the processor. It is modeled as
//! plain `#[repr(C)]` structs with the architectural offset of every field
//! noted, and conformance is enforced with compile-time `offset_of` checks
//! rather than bit-field packing.
//!
//! See: Appendix B Layout of VMCB

use alloc::boxed::Box;
use bitvec::prelude::*;
use num_derive::FromPrimitive;

use crate::{error::SvmError, support::try_zeroed_box};

/// Owning handle for a page-aligned, zero-initialized [`VmcbRaw`].
#[derive(Debug, derive_deref::Deref, derive_deref::DerefMut)]
pub struct Vmcb {
    ptr: Box<VmcbRaw>,
}

impl Vmcb {
    pub(crate) fn try_new() -> Result<Self, SvmError> {
        Ok(Self {
            ptr: try_zeroed_box::<VmcbRaw>()?,
        })
    }
}

/// The VMCB: a control area followed by the state-save area, together one
/// page-granular, page-aligned allocation.
#[derive(Debug)]
#[repr(C, align(4096))]
pub struct VmcbRaw {
    pub control_area: ControlArea,
    pub state_save_area: StateSaveArea,
}
const _: () = assert!(core::mem::size_of::<VmcbRaw>() == 0x1000);

/// The "metadata" area where we specify what operations to intercept and can
/// read details of #VMEXIT.
///
/// See: Table B-1. VMCB Layout, Control Area
#[repr(C)]
pub struct ControlArea {
    pub intercept_cr_read: u16,   // +0x000
    pub intercept_cr_write: u16,  // +0x002
    pub intercept_dr_read: u16,   // +0x004
    pub intercept_dr_write: u16,  // +0x006
    pub intercept_exception: u32, // +0x008
    pub intercept_misc1: u32,     // +0x00c
    pub intercept_misc2: u32,     // +0x010
    pub intercept_misc3: u32,     // +0x014
    _padding1: [u8; 0x03c - 0x018], // +0x018
    pub pause_filter_threshold: u16, // +0x03c
    pub pause_filter_count: u16,  // +0x03e
    pub iopm_base_pa: u64,        // +0x040
    pub msrpm_base_pa: u64,       // +0x048
    pub tsc_offset: u64,          // +0x050
    pub guest_asid: u32,          // +0x058
    pub tlb_control: u32,         // +0x05c
    pub vintr: u64,               // +0x060
    pub interrupt_shadow: u64,    // +0x068
    pub exit_code: u64,           // +0x070
    pub exit_info1: u64,          // +0x078
    pub exit_info2: u64,          // +0x080
    pub exit_int_info: u64,       // +0x088
    pub np_enable: u64,           // +0x090
    pub avic_apic_bar: u64,       // +0x098
    pub guest_pa_pf_ghcb: u64,    // +0x0a0
    pub event_inj: u64,           // +0x0a8
    pub ncr3: u64,                // +0x0b0
    pub lbr_virtualization_enable: u64, // +0x0b8
    pub vmcb_clean: u32,          // +0x0c0
    _reserved: u32,               // +0x0c4
    pub nrip: u64,                // +0x0c8
    pub num_of_bytes_fetched: u8, // +0x0d0
    pub guest_instruction_bytes: [u8; 15], // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    _padding2: u64,               // +0x0e8
    pub avic_logical_table_pointer: u64, // +0x0f0
    pub avic_physical_table_pointer: u64, // +0x0f8
    _padding3: u64,               // +0x100
    pub vmcb_save_state_pointer: u64, // +0x108
    _padding4: [u8; 0x3e0 - 0x110], // +0x110
    pub reserved_for_host: [u8; 0x20], // +0x3e0
}
const _: () = assert!(core::mem::size_of::<ControlArea>() == 0x400);
const _: () = assert!(core::mem::offset_of!(ControlArea, intercept_exception) == 0x008);
const _: () = assert!(core::mem::offset_of!(ControlArea, iopm_base_pa) == 0x040);
const _: () = assert!(core::mem::offset_of!(ControlArea, tsc_offset) == 0x050);
const _: () = assert!(core::mem::offset_of!(ControlArea, guest_asid) == 0x058);
const _: () = assert!(core::mem::offset_of!(ControlArea, exit_code) == 0x070);
const _: () = assert!(core::mem::offset_of!(ControlArea, exit_info2) == 0x080);
const _: () = assert!(core::mem::offset_of!(ControlArea, ncr3) == 0x0b0);
const _: () = assert!(core::mem::offset_of!(ControlArea, nrip) == 0x0c8);

impl core::fmt::Debug for ControlArea {
    // The padding makes a derived Debug both impossible and useless; print
    // what matters when an exit goes sideways.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlArea")
            .field("intercept_cr_read", &self.intercept_cr_read)
            .field("intercept_cr_write", &self.intercept_cr_write)
            .field("intercept_exception", &self.intercept_exception)
            .field("intercept_misc1", &self.intercept_misc1)
            .field("intercept_misc2", &self.intercept_misc2)
            .field("iopm_base_pa", &self.iopm_base_pa)
            .field("tsc_offset", &self.tsc_offset)
            .field("guest_asid", &self.guest_asid)
            .field("vintr", &self.vintr)
            .field("exit_code", &self.exit_code)
            .field("exit_info1", &self.exit_info1)
            .field("exit_info2", &self.exit_info2)
            .finish_non_exhaustive()
    }
}

/// A segment register as stored in the state-save area.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct VmcbSegment {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}
const _: () = assert!(core::mem::size_of::<VmcbSegment>() == 0x10);

/// The area holding the guest register state that hardware loads on VMRUN and
/// stores on #VMEXIT.
///
/// See: Table B-2. VMCB Layout, State Save Area
#[repr(C)]
pub struct StateSaveArea {
    pub es: VmcbSegment,            // +0x000
    pub cs: VmcbSegment,            // +0x010
    pub ss: VmcbSegment,            // +0x020
    pub ds: VmcbSegment,            // +0x030
    pub fs: VmcbSegment,            // +0x040
    pub gs: VmcbSegment,            // +0x050
    pub gdtr: VmcbSegment,          // +0x060 (selector/attrib reserved)
    pub ldtr: VmcbSegment,          // +0x070
    pub idtr: VmcbSegment,          // +0x080 (selector/attrib reserved)
    pub tr: VmcbSegment,            // +0x090
    _padding1: [u8; 0x0cb - 0x0a0], // +0x0a0
    pub cpl: u8,                    // +0x0cb
    _padding2: u32,                 // +0x0cc
    pub efer: u64,                  // +0x0d0
    _padding3: [u8; 0x148 - 0x0d8], // +0x0d8
    pub cr4: u64,                   // +0x148
    pub cr3: u64,                   // +0x150
    pub cr0: u64,                   // +0x158
    pub dr7: u64,                   // +0x160
    pub dr6: u64,                   // +0x168
    pub rflags: u64,                // +0x170
    pub rip: u64,                   // +0x178
    _padding4: [u8; 0x1d8 - 0x180], // +0x180
    pub rsp: u64,                   // +0x1d8
    pub s_cet: u64,                 // +0x1e0
    pub ssp: u64,                   // +0x1e8
    pub isst_addr: u64,             // +0x1f0
    pub rax: u64,                   // +0x1f8
    pub star: u64,                  // +0x200
    pub lstar: u64,                 // +0x208
    pub cstar: u64,                 // +0x210
    pub sf_mask: u64,               // +0x218
    pub kernel_gs_base: u64,        // +0x220
    pub sysenter_cs: u64,           // +0x228
    pub sysenter_esp: u64,          // +0x230
    pub sysenter_eip: u64,          // +0x238
    pub cr2: u64,                   // +0x240
    _padding5: [u8; 0x268 - 0x248], // +0x248
    pub gpat: u64,                  // +0x268
    pub dbg_ctl: u64,               // +0x270
    pub br_from: u64,               // +0x278
    pub br_to: u64,                 // +0x280
    pub last_excep_from: u64,       // +0x288
    pub last_excep_to: u64,         // +0x290
    _padding6: [u8; 0x2e0 - 0x298], // +0x298
    pub spec_ctl: u64,              // +0x2e0
}
const _: () = assert!(core::mem::size_of::<StateSaveArea>() == 0x2e8);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, cs) == 0x010);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, cpl) == 0x0cb);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, efer) == 0x0d0);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, cr3) == 0x150);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, rip) == 0x178);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, rsp) == 0x1d8);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, rax) == 0x1f8);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, cr2) == 0x240);
const _: () = assert!(core::mem::offset_of!(StateSaveArea, gpat) == 0x268);

impl core::fmt::Debug for StateSaveArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StateSaveArea")
            .field("cs", &self.cs)
            .field("efer", &self.efer)
            .field("cr0", &self.cr0)
            .field("cr3", &self.cr3)
            .field("cr4", &self.cr4)
            .field("rflags", &self.rflags)
            .field("rip", &self.rip)
            .field("rsp", &self.rsp)
            .field("rax", &self.rax)
            .finish_non_exhaustive()
    }
}

// CR read/write intercept vectors, one bit per control register.
pub(crate) const INTERCEPT_CR0: u16 = 1 << 0;
pub(crate) const INTERCEPT_CR3: u16 = 1 << 3;

// Exception intercept bitmap, one bit per vector.
const fn excp(vector: u32) -> u32 {
    1 << vector
}
pub(crate) const EXCP_DE: u32 = excp(0);
pub(crate) const EXCP_NMI: u32 = excp(2);
pub(crate) const EXCP_OF: u32 = excp(4);
pub(crate) const EXCP_UD: u32 = excp(6);
pub(crate) const EXCP_DF: u32 = excp(8);
pub(crate) const EXCP_TS: u32 = excp(10);
pub(crate) const EXCP_NP: u32 = excp(11);
pub(crate) const EXCP_SS: u32 = excp(12);
pub(crate) const EXCP_GP: u32 = excp(13);
pub(crate) const EXCP_PF: u32 = excp(14);
pub(crate) const EXCP_AC: u32 = excp(17);
pub(crate) const EXCP_MC: u32 = excp(18);

/// Exceptions that must be intercepted before the first guest entry for
/// emulation to stay correct. Missing any of these is a defect, not a
/// runtime condition.
pub(crate) const MANDATORY_EXCEPTION_INTERCEPTS: u32 = EXCP_DE
    | EXCP_NMI
    | EXCP_OF
    | EXCP_UD
    | EXCP_DF
    | EXCP_TS
    | EXCP_NP
    | EXCP_SS
    | EXCP_GP
    | EXCP_PF
    | EXCP_AC
    | EXCP_MC;

// Intercept vector 3 (+0x00c).
pub(crate) const INTERCEPT_MISC1_INTR: u32 = 1 << 0;
pub(crate) const INTERCEPT_MISC1_NMI: u32 = 1 << 1;
pub(crate) const INTERCEPT_MISC1_HLT: u32 = 1 << 24;
pub(crate) const INTERCEPT_MISC1_INVLPG: u32 = 1 << 25;
pub(crate) const INTERCEPT_MISC1_INVLPGA: u32 = 1 << 26;
pub(crate) const INTERCEPT_MISC1_IOIO_PROT: u32 = 1 << 27;

// Intercept vector 4 (+0x010).
pub(crate) const INTERCEPT_MISC2_VMRUN: u32 = 1 << 0;

/// V_INTR_MASKING in the virtual interrupt control field: the guest's IF
/// masks only virtual interrupts, so the host observes every interrupt
/// window.
pub(crate) const VINTR_V_INTR_MASKING: u64 = 1 << 24;

/// Table 15-9. TLB Control Byte Encodings
#[allow(dead_code)]
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TlbControl {
    DoNotFlush = 0x0,
    FlushAll = 0x1,
    FlushGuests = 0x3,
    FlushGuestsNonGlobal = 0x7,
}

/// #VMEXIT codes this core cares to name; anything else is forwarded raw.
///
/// See: Appendix C SVM Intercept Exit Codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u64)]
pub enum ExitCode {
    Cr3Read = 0x3,
    Cr3Write = 0x13,
    ExceptionPf = 0x4e,
    Intr = 0x60,
    Nmi = 0x61,
    Cpuid = 0x72,
    Hlt = 0x78,
    Invlpg = 0x79,
    Invlpga = 0x7a,
    Ioio = 0x7b,
    Msr = 0x7c,
    Shutdown = 0x7f,
    Vmrun = 0x80,
    NestedPageFault = 0x400,
}

impl VmcbRaw {
    /// Whether the control area intercepts every exception in the mandatory
    /// set and the always-intercepted events (INTR, NMI, HLT, VMRUN).
    pub fn has_mandatory_intercepts(&self) -> bool {
        let ctrl = &self.control_area;
        (ctrl.intercept_exception & MANDATORY_EXCEPTION_INTERCEPTS
            == MANDATORY_EXCEPTION_INTERCEPTS)
            && (ctrl.intercept_misc1 & (INTERCEPT_MISC1_INTR | INTERCEPT_MISC1_NMI | INTERCEPT_MISC1_HLT)
                == (INTERCEPT_MISC1_INTR | INTERCEPT_MISC1_NMI | INTERCEPT_MISC1_HLT))
            && (ctrl.intercept_misc2 & INTERCEPT_MISC2_VMRUN == INTERCEPT_MISC2_VMRUN)
    }
}

/// The I/O permission map: one bit per port over the full 16-bit port space,
/// plus the trailing page the processor may read past the end.
///
/// See: 15.10.1 I/O Permissions Map
#[derive(derive_deref::Deref, derive_deref::DerefMut)]
pub(crate) struct IoPermissionMap {
    ptr: Box<IoPermissionMapRaw>,
}

#[repr(C, align(4096))]
pub(crate) struct IoPermissionMapRaw([u8; 0x3000]);
const _: () = assert!(core::mem::size_of::<IoPermissionMapRaw>() == 0x3000);

impl IoPermissionMap {
    pub(crate) fn try_new() -> Result<Self, SvmError> {
        Ok(Self {
            ptr: try_zeroed_box::<IoPermissionMapRaw>()?,
        })
    }

    /// Marks `port` as intercepted.
    pub(crate) fn intercept(&mut self, port: u16) {
        self.ptr.0.view_bits_mut::<Lsb0>().set(usize::from(port), true);
    }

    #[cfg(test)]
    pub(crate) fn is_intercepted(&self, port: u16) -> bool {
        self.ptr.0.view_bits::<Lsb0>()[usize::from(port)]
    }
}

impl core::fmt::Debug for IoPermissionMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let set_bits = self.ptr.0.view_bits::<Lsb0>().count_ones();
        f.debug_struct("IoPermissionMap")
            .field("intercepted_ports", &set_bits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcb_layout_conforms_to_appendix_b() {
        // Spot checks in addition to the compile-time asserts; offsets from
        // Table B-1 and B-2 of the manual.
        assert_eq!(core::mem::offset_of!(ControlArea, intercept_misc1), 0x00c);
        assert_eq!(core::mem::offset_of!(ControlArea, intercept_misc2), 0x010);
        assert_eq!(core::mem::offset_of!(ControlArea, pause_filter_count), 0x03e);
        assert_eq!(core::mem::offset_of!(ControlArea, msrpm_base_pa), 0x048);
        assert_eq!(core::mem::offset_of!(ControlArea, tlb_control), 0x05c);
        assert_eq!(core::mem::offset_of!(ControlArea, vintr), 0x060);
        assert_eq!(core::mem::offset_of!(ControlArea, exit_info1), 0x078);
        assert_eq!(core::mem::offset_of!(ControlArea, event_inj), 0x0a8);
        assert_eq!(
            core::mem::offset_of!(ControlArea, guest_instruction_bytes),
            0x0d1
        );

        assert_eq!(core::mem::offset_of!(StateSaveArea, es), 0x000);
        assert_eq!(core::mem::offset_of!(StateSaveArea, gdtr), 0x060);
        assert_eq!(core::mem::offset_of!(StateSaveArea, ldtr), 0x070);
        assert_eq!(core::mem::offset_of!(StateSaveArea, idtr), 0x080);
        assert_eq!(core::mem::offset_of!(StateSaveArea, tr), 0x090);
        assert_eq!(core::mem::offset_of!(StateSaveArea, cr4), 0x148);
        assert_eq!(core::mem::offset_of!(StateSaveArea, cr0), 0x158);
        assert_eq!(core::mem::offset_of!(StateSaveArea, dr7), 0x160);
        assert_eq!(core::mem::offset_of!(StateSaveArea, dr6), 0x168);
        assert_eq!(core::mem::offset_of!(StateSaveArea, rflags), 0x170);
        assert_eq!(core::mem::offset_of!(StateSaveArea, kernel_gs_base), 0x220);
        assert_eq!(core::mem::offset_of!(StateSaveArea, sysenter_eip), 0x238);
        assert_eq!(core::mem::offset_of!(StateSaveArea, spec_ctl), 0x2e0);

        assert_eq!(
            core::mem::offset_of!(VmcbRaw, state_save_area),
            0x400,
            "state-save area must start right after the control area"
        );
    }

    #[test]
    fn iopm_sets_one_bit_per_port() {
        let mut iopm = IoPermissionMap::try_new().unwrap();
        iopm.intercept(0x60);
        iopm.intercept(0x3f8);
        iopm.intercept(0xffff);

        assert!(iopm.is_intercepted(0x60));
        assert!(iopm.is_intercepted(0x3f8));
        assert!(iopm.is_intercepted(0xffff));
        assert!(!iopm.is_intercepted(0x61));
        // Bit position within the byte follows port % 8.
        assert_eq!(iopm.ptr.0[0x60 / 8], 1 << (0x60 % 8));
    }
}
