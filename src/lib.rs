//! The environment-agnostic core of an AMD SVM based virtual machine
//! monitor: capability probing, enabling the extension, building guest
//! control blocks, shadow page tables and the world-switch loop.
//!
//! The crate is `no_std` + `alloc` and drives the processor only through the
//! [`platform::Platform`] trait, so the same core runs on bare metal and
//! under the scripted double the unit tests use.
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod capability;
pub mod error;
pub mod guest;
pub mod hooks;
pub mod platform;
pub mod registers;
pub mod shadow;
mod support;
pub mod vmcb;

pub use capability::{enable_virtualization, probe_capability, HostStateArea, SvmSupport};
pub use error::SvmError;
pub use guest::{MemoryMode, PagingMode, Vcpu, VcpuConfig};
pub use hooks::{ExitHandler, MemoryHooks};
pub use platform::Platform;
pub use registers::Registers;
pub use shadow::{PagingWidth, PfErrorCode, RegionBacking, RegionMap, ShadowRegion};

#[cfg(test)]
#[ctor::ctor]
fn init_test_logger() {
    env_logger::builder().is_test(true).init();
}
