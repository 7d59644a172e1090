//! Detection and activation of the processor's virtualization extension.
//!
//! Detection is a read-only decision tree over CPUID and the VM_CR MSR;
//! activation flips EFER.SVME and registers a host state-save page the
//! processor spills to on each world switch.

use alloc::boxed::Box;
use log::{debug, info, warn};

use crate::{error::SvmError, platform::Platform, support::try_zeroed_box};

/// See: CPUID Fn8000_0001_ECX Feature Identifiers
const CPUID_FN8000_0001: u32 = 0x8000_0001;
const CPUID_FN8000_0001_ECX_SVM: u32 = 1 << 2;

/// See: CPUID Fn8000_000A_EDX SVM Feature Identification
const CPUID_FN8000_000A: u32 = 0x8000_000a;
const CPUID_FN8000_000A_EDX_NP: u32 = 1 << 0;
const CPUID_FN8000_000A_EDX_SVM_LOCK: u32 = 1 << 2;

/// See: 15.30.1 VM_CR MSR (C001_0114h)
const VM_CR: u32 = 0xc001_0114;
const VM_CR_SVMDIS: u64 = 1 << 4;
const VM_CR_LOCK: u64 = 1 << 3;

/// See: 15.30.4 VM_HSAVE_PA MSR (C001_0117h)
const VM_HSAVE_PA: u32 = 0xc001_0117;

const EFER: u32 = 0xc000_0080;
const EFER_SVME: u64 = 1 << 12;

/// Outcome of probing the processor for the virtualization extension.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SvmSupport {
    /// The processor does not implement the extension at all.
    Unavailable,
    /// Implemented, but firmware disabled it and set the lock bit. Nothing
    /// short of a BIOS change re-enables it.
    DisabledLocked,
    /// Implemented and disabled, but unlockable with a key. Still unusable
    /// from here.
    DisabledUnlockable,
    /// Usable as-is.
    Available {
        /// Whether hardware can also walk a second, nested set of page
        /// tables.
        nested_paging: bool,
    },
}

impl SvmSupport {
    /// Collapses the probe outcome into a result, keeping the lock state in
    /// the error for diagnostics.
    pub fn require(self) -> Result<(), SvmError> {
        match self {
            Self::Available { .. } => Ok(()),
            Self::Unavailable => Err(SvmError::Unavailable),
            Self::DisabledLocked => Err(SvmError::Disabled { locked: true }),
            Self::DisabledUnlockable => Err(SvmError::Disabled { locked: false }),
        }
    }
}

/// Determines whether, and to what degree, the current processor supports
/// hardware virtualization. Read-only; safe to call any number of times.
pub fn probe_capability<P: Platform>(platform: &P) -> SvmSupport {
    let ecx = platform.cpuid(CPUID_FN8000_0001).ecx;
    if ecx & CPUID_FN8000_0001_ECX_SVM == 0 {
        return SvmSupport::Unavailable;
    }

    let vm_cr = platform.rdmsr(VM_CR);
    if vm_cr & VM_CR_SVMDIS != 0 {
        // Disabled by firmware. The SVM_LOCK CPUID bit tells apart a
        // hard-locked part from one that accepts an unlock key.
        let edx = platform.cpuid(CPUID_FN8000_000A).edx;
        return if edx & CPUID_FN8000_000A_EDX_SVM_LOCK == 0 {
            warn!("SVM is disabled at boot with no software unlock");
            SvmSupport::DisabledLocked
        } else {
            warn!("SVM is disabled with a key required to unlock");
            SvmSupport::DisabledUnlockable
        };
    }

    let edx = platform.cpuid(CPUID_FN8000_000A).edx;
    let nested_paging = edx & CPUID_FN8000_000A_EDX_NP != 0;
    debug!("SVM available (nested paging: {nested_paging})");
    SvmSupport::Available { nested_paging }
}

/// The page the processor saves a subset of host state into across VMRUN.
/// Its contents are processor-owned and never inspected by software.
#[derive(derive_deref::Deref, derive_deref::DerefMut)]
pub struct HostStateArea {
    ptr: Box<HostStateAreaRaw>,
}

#[repr(C, align(4096))]
pub struct HostStateAreaRaw(pub [u8; 0x1000]);
const _: () = assert!(core::mem::size_of::<HostStateAreaRaw>() == 0x1000);

impl core::fmt::Debug for HostStateArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostStateArea").finish_non_exhaustive()
    }
}

/// Activates the extension on the current processor: verifies the probe,
/// sets EFER.SVME and registers the host state-save page. The returned
/// [`HostStateArea`] must outlive every guest entry on this processor.
pub fn enable_virtualization<P: Platform>(platform: &mut P) -> Result<HostStateArea, SvmError> {
    probe_capability(platform).require()?;

    let hsave = HostStateArea {
        ptr: try_zeroed_box::<HostStateAreaRaw>()?,
    };

    let efer = platform.rdmsr(EFER);
    platform.wrmsr(EFER, efer | EFER_SVME);

    let hsave_pa = platform.pa(hsave.ptr.as_ref() as *const _ as *const _);
    platform.wrmsr(VM_HSAVE_PA, hsave_pa);

    info!("SVM enabled (host save area at {hsave_pa:#x})");
    Ok(hsave)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::MockPlatform;

    fn svm_capable_platform() -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform.set_cpuid(CPUID_FN8000_0001, 0, 0, CPUID_FN8000_0001_ECX_SVM, 0);
        platform.set_cpuid(CPUID_FN8000_000A, 0, 0, 0, CPUID_FN8000_000A_EDX_NP);
        platform.set_msr(VM_CR, 0);
        platform.set_msr(EFER, 0);
        platform
    }

    #[test]
    fn probe_reports_unavailable_without_the_cpuid_bit() {
        let mut platform = MockPlatform::new();
        platform.set_cpuid(CPUID_FN8000_0001, 0, 0, 0, 0);

        assert_eq!(probe_capability(&platform), SvmSupport::Unavailable);
        assert_eq!(
            SvmSupport::Unavailable.require(),
            Err(SvmError::Unavailable)
        );
    }

    #[test]
    fn probe_reports_available_with_nested_paging() {
        let platform = svm_capable_platform();
        assert_eq!(
            probe_capability(&platform),
            SvmSupport::Available {
                nested_paging: true
            }
        );
    }

    #[test]
    fn probe_reports_available_without_nested_paging() {
        let mut platform = svm_capable_platform();
        platform.set_cpuid(CPUID_FN8000_000A, 0, 0, 0, 0);
        assert_eq!(
            probe_capability(&platform),
            SvmSupport::Available {
                nested_paging: false
            }
        );
    }

    #[test]
    fn probe_tells_locked_from_unlockable_disablement() {
        let mut platform = svm_capable_platform();
        platform.set_msr(VM_CR, VM_CR_SVMDIS | VM_CR_LOCK);
        platform.set_cpuid(CPUID_FN8000_000A, 0, 0, 0, 0);
        assert_eq!(probe_capability(&platform), SvmSupport::DisabledLocked);
        assert_eq!(
            probe_capability(&platform).require(),
            Err(SvmError::Disabled { locked: true })
        );

        platform.set_cpuid(CPUID_FN8000_000A, 0, 0, 0, CPUID_FN8000_000A_EDX_SVM_LOCK);
        assert_eq!(probe_capability(&platform), SvmSupport::DisabledUnlockable);
        assert_eq!(
            probe_capability(&platform).require(),
            Err(SvmError::Disabled { locked: false })
        );
    }

    #[test]
    fn enable_sets_svme_and_registers_the_host_save_area() {
        let mut platform = svm_capable_platform();
        let hsave = enable_virtualization(&mut platform).unwrap();

        assert_eq!(platform.msr(EFER) & EFER_SVME, EFER_SVME);
        let registered = platform.msr(VM_HSAVE_PA);
        assert_ne!(registered, 0);
        assert_eq!(registered & 0xfff, 0, "host save area must be page-aligned");
        drop(hsave);
    }

    #[test]
    fn enable_refuses_an_incapable_processor() {
        let mut platform = MockPlatform::new();
        platform.set_cpuid(CPUID_FN8000_0001, 0, 0, 0, 0);

        assert_eq!(
            enable_virtualization(&mut platform).unwrap_err(),
            SvmError::Unavailable
        );
    }
}
