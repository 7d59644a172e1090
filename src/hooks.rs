//! Collaborator seams: device emulation gets intercepted exits, memory
//! emulation gets hooked accesses. Both are traits so the core stays
//! independent of any particular device model.

use crate::{
    error::SvmError,
    guest::Vcpu,
    platform::Platform,
    registers::Registers,
    shadow::{PfErrorCode, ShadowRegion},
};

/// Receives every intercepted event the core does not consume itself
/// (everything other than shadow-paging page faults).
///
/// A handler typically decodes the exit code and info fields from
/// `vcpu.vmcb.control_area`, emulates the operation, and advances `rip`.
/// Returning an error aborts the guest and triggers a postmortem dump.
pub trait ExitHandler<P: Platform> {
    fn handle_exit(&mut self, vcpu: &mut Vcpu<P>) -> Result<(), SvmError>;
}

/// Receives guest accesses that land in hooked memory regions.
///
/// Write-hooked regions are mapped read-only, so only writes arrive here;
/// fully hooked regions are never mapped and every access arrives.
pub trait MemoryHooks {
    /// A write to a write-hooked region. Reads proceed at memory speed and
    /// are never reported.
    fn handle_write_hook(
        &mut self,
        registers: &mut Registers,
        fault_addr: u64,
        region: &ShadowRegion,
        access: PfErrorCode,
    ) -> Result<(), SvmError>;

    /// Any access to a fully hooked region.
    fn handle_full_hook(
        &mut self,
        registers: &mut Registers,
        fault_addr: u64,
        region: &ShadowRegion,
        access: PfErrorCode,
    ) -> Result<(), SvmError>;
}
