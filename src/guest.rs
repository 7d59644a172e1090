//! A guest processor: its control block, general-purpose registers, memory
//! map and the loop that runs it.
//!
//! The flow is the usual one for this hardware: build the control block with
//! the intercept set and reset-state, then alternate VMRUN with exit
//! dispatch until the guest shuts down or something unrecoverable happens.

use alloc::vec::Vec;
use log::{error, info, trace};
use num_traits::FromPrimitive;

use crate::{
    error::SvmError,
    hooks::{ExitHandler, MemoryHooks},
    platform::Platform,
    registers::Registers,
    shadow::{PagingWidth, PfErrorCode, RegionMap, ShadowPageTables},
    vmcb::{
        ExitCode, IoPermissionMap, TlbControl, Vmcb, INTERCEPT_CR0, INTERCEPT_CR3,
        INTERCEPT_MISC1_HLT, INTERCEPT_MISC1_INTR, INTERCEPT_MISC1_INVLPG,
        INTERCEPT_MISC1_INVLPGA, INTERCEPT_MISC1_IOIO_PROT, INTERCEPT_MISC1_NMI,
        INTERCEPT_MISC2_VMRUN, MANDATORY_EXCEPTION_INTERCEPTS, VINTR_V_INTR_MASKING,
    },
};

/// Single guest per processor, so a fixed non-zero ASID suffices. ASID 0 is
/// reserved for the host.
const GUEST_ASID: u32 = 1;

// Reset-state constants. The guest starts where a real processor does.
const RESET_RIP: u64 = 0xfff0;
const RESET_CS_SELECTOR: u16 = 0xf000;
const RESET_CS_BASE: u64 = 0xf0000;
const RESET_RFLAGS: u64 = 0x2;
const RESET_CR0: u64 = 0x6000_0010;
const RESET_DR6: u64 = 0xffff_0ff0;
const RESET_DR7: u64 = 0x400;
const RESET_RDX: u64 = 0xf00;
const RESET_GPAT: u64 = 0x0007_0406_0007_0406;

const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const EFER_SVME: u64 = 1 << 12;

const SEG_ATTRIB_DATA: u16 = 0x93;
const SEG_ATTRIB_CODE: u16 = 0x9b;

/// How guest memory accesses are translated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PagingMode {
    /// Software-maintained shadow tables, demand-populated on faults.
    ShadowPaging,
    /// Hardware-walked nested tables.
    NestedPaging,
}

/// Which address space [`Vcpu::translate_guest_to_host`] starts from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryMode {
    /// Guest addresses are physical; translate through the region map.
    Physical,
    /// Guest addresses are virtual; translate through the shadow tables.
    Virtual,
}

/// Everything needed to build a guest.
#[derive(Debug)]
pub struct VcpuConfig {
    pub paging_mode: PagingMode,
    pub width: PagingWidth,
    pub memory_mode: MemoryMode,
    /// I/O ports whose accesses exit to the handler. Everything else runs
    /// at native speed.
    pub intercepted_ports: Vec<u16>,
    pub regions: RegionMap,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ExitDisposition {
    Resume,
    Shutdown,
}

/// A guest processor bound to one host processor.
#[derive(Debug)]
pub struct Vcpu<P: Platform> {
    platform: P,
    pub registers: Registers,
    pub vmcb: Vmcb,
    iopm: Option<IoPermissionMap>,
    shadow: Option<ShadowPageTables>,
    regions: RegionMap,
    memory_mode: MemoryMode,
    /// Virtual time: cycles the guest has observed so far. Time stops while
    /// the host handles an exit.
    guest_tsc: u64,
}

impl<P: Platform> Vcpu<P> {
    pub fn new(platform: P, config: VcpuConfig) -> Result<Self, SvmError> {
        // Three pages per map; only paid for when a port is actually
        // intercepted.
        let iopm = if config.intercepted_ports.is_empty() {
            None
        } else {
            let mut iopm = IoPermissionMap::try_new()?;
            for &port in &config.intercepted_ports {
                iopm.intercept(port);
            }
            Some(iopm)
        };

        let shadow = match config.paging_mode {
            PagingMode::ShadowPaging => {
                Some(ShadowPageTables::new(&platform, config.width)?)
            }
            PagingMode::NestedPaging => None,
        };

        let mut vcpu = Self {
            platform,
            registers: Registers::default(),
            vmcb: Vmcb::try_new()?,
            iopm,
            shadow,
            regions: config.regions,
            memory_mode: config.memory_mode,
            guest_tsc: 0,
        };
        vcpu.initialize_control();
        vcpu.initialize_guest_state(config.width);
        debug_assert!(vcpu.vmcb.has_mandatory_intercepts());
        Ok(vcpu)
    }

    /// Programs the intercept set and the control fields that never change
    /// over the guest's lifetime.
    fn initialize_control(&mut self) {
        let ctrl = &mut self.vmcb.control_area;

        ctrl.intercept_exception = MANDATORY_EXCEPTION_INTERCEPTS;
        ctrl.intercept_misc1 = INTERCEPT_MISC1_INTR
            | INTERCEPT_MISC1_NMI
            | INTERCEPT_MISC1_HLT
            | INTERCEPT_MISC1_INVLPGA;
        ctrl.intercept_misc2 = INTERCEPT_MISC2_VMRUN;
        ctrl.intercept_cr_read = INTERCEPT_CR0;
        ctrl.intercept_cr_write = INTERCEPT_CR0;
        if self.shadow.is_some() {
            // The guest must not move CR3 or flush the TLB behind the
            // shadow tables' back.
            ctrl.intercept_misc1 |= INTERCEPT_MISC1_INVLPG;
            ctrl.intercept_cr_read |= INTERCEPT_CR3;
            ctrl.intercept_cr_write |= INTERCEPT_CR3;
        }

        if let Some(iopm) = &self.iopm {
            ctrl.intercept_misc1 |= INTERCEPT_MISC1_IOIO_PROT;
            ctrl.iopm_base_pa = self.platform.pa(core::ptr::from_ref(&***iopm).cast());
        }
        ctrl.guest_asid = GUEST_ASID;
        ctrl.vintr = VINTR_V_INTR_MASKING;
        ctrl.tlb_control = TlbControl::FlushAll as u32;
    }

    /// Loads the state-save area with power-on state, adjusted for the
    /// paging mode.
    fn initialize_guest_state(&mut self, width: PagingWidth) {
        let state = &mut self.vmcb.state_save_area;

        state.cs.selector = RESET_CS_SELECTOR;
        state.cs.base = RESET_CS_BASE;
        state.cs.limit = 0xffff;
        state.cs.attrib = SEG_ATTRIB_CODE;
        for seg in [
            &mut state.es,
            &mut state.ss,
            &mut state.ds,
            &mut state.fs,
            &mut state.gs,
        ] {
            seg.selector = 0;
            seg.base = 0;
            seg.limit = 0xffff;
            seg.attrib = SEG_ATTRIB_DATA;
        }
        state.gdtr.limit = 0xffff;
        state.idtr.limit = 0xffff;
        state.ldtr.limit = 0xffff;
        state.tr.limit = 0xffff;

        state.rip = RESET_RIP;
        state.rflags = RESET_RFLAGS;
        state.cr0 = RESET_CR0;
        state.dr6 = RESET_DR6;
        state.dr7 = RESET_DR7;
        state.gpat = RESET_GPAT;
        // VMRUN refuses a guest without SVME.
        state.efer = EFER_SVME;

        if let Some(shadow) = &self.shadow {
            // Hardware pages through the shadow tables while the guest
            // still believes paging is off.
            state.cr0 |= CR0_PG;
            state.cr3 = shadow.root_pa();
            if width == PagingWidth::Bits64 {
                state.cr4 |= CR4_PAE;
            }
        }

        self.registers.rip = RESET_RIP;
        self.registers.rflags = RESET_RFLAGS;
        self.registers.rdx = RESET_RDX;
    }

    /// Runs the guest until it shuts down or fails. On failure the guest
    /// state is dumped and the error returned; the guest must not be
    /// resumed afterwards.
    pub fn run(
        &mut self,
        exits: &mut impl ExitHandler<P>,
        hooks: &mut impl MemoryHooks,
    ) -> Result<(), SvmError> {
        info!("entering guest at rip={:#x}", self.vmcb.state_save_area.rip);
        loop {
            self.enter();
            match self.dispatch(exits, hooks) {
                Ok(ExitDisposition::Resume) => {}
                Ok(ExitDisposition::Shutdown) => {
                    info!("guest shut down");
                    return Ok(());
                }
                Err(err) => {
                    self.dump_postmortem(&err);
                    return Err(err);
                }
            }
        }
    }

    /// One world switch: global interrupts off, virtual time resumed, guest
    /// run until the next intercept, virtual time paused.
    fn enter(&mut self) {
        self.platform.clgi();

        let entry_tsc = self.platform.rdtsc();
        self.vmcb.control_area.tsc_offset = self.guest_tsc.wrapping_sub(entry_tsc);

        // Registers hardware exchanges through the VMCB rather than the
        // register file.
        self.vmcb.state_save_area.rax = self.registers.rax;
        self.vmcb.state_save_area.rsp = self.registers.rsp;
        self.vmcb.state_save_area.rip = self.registers.rip;
        self.vmcb.state_save_area.rflags = self.registers.rflags;

        self.platform.run_guest(&mut self.vmcb, &mut self.registers);

        self.registers.rax = self.vmcb.state_save_area.rax;
        self.registers.rsp = self.vmcb.state_save_area.rsp;
        self.registers.rip = self.vmcb.state_save_area.rip;
        self.registers.rflags = self.vmcb.state_save_area.rflags;

        let exit_tsc = self.platform.rdtsc();
        self.guest_tsc = self.guest_tsc.wrapping_add(exit_tsc.wrapping_sub(entry_tsc));

        // A software shadow table cannot track guest TLB state, so every
        // entry flushes. Without shadow tables the first-entry flush is
        // enough.
        self.vmcb.control_area.tlb_control = if self.shadow.is_some() {
            TlbControl::FlushAll as u32
        } else {
            TlbControl::DoNotFlush as u32
        };

        self.platform.stgi();
    }

    fn dispatch(
        &mut self,
        exits: &mut impl ExitHandler<P>,
        hooks: &mut impl MemoryHooks,
    ) -> Result<ExitDisposition, SvmError> {
        let code = self.vmcb.control_area.exit_code;
        trace!(
            "#VMEXIT code={code:#x} info1={:#x} info2={:#x}",
            self.vmcb.control_area.exit_info1,
            self.vmcb.control_area.exit_info2
        );

        match ExitCode::from_u64(code) {
            Some(ExitCode::ExceptionPf) => {
                let fault_addr = self.vmcb.control_area.exit_info2;
                let access = PfErrorCode(self.vmcb.control_area.exit_info1);
                let Self {
                    platform,
                    registers,
                    shadow,
                    regions,
                    ..
                } = self;
                if let Some(shadow) = shadow.as_mut() {
                    use crate::shadow::FaultOutcome;
                    match shadow.handle_fault(platform, regions, fault_addr, access)? {
                        FaultOutcome::Mapped => {}
                        FaultOutcome::ForwardWrite => {
                            let region = regions
                                .lookup(fault_addr)
                                .ok_or(SvmError::UnmappedFault { addr: fault_addr })?;
                            hooks.handle_write_hook(registers, fault_addr, region, access)?;
                        }
                        FaultOutcome::ForwardFull => {
                            let region = regions
                                .lookup(fault_addr)
                                .ok_or(SvmError::UnmappedFault { addr: fault_addr })?;
                            hooks.handle_full_hook(registers, fault_addr, region, access)?;
                        }
                    }
                    return Ok(ExitDisposition::Resume);
                }
                // Without shadow paging a #PF intercept is the handler's
                // problem like any other exception.
                exits.handle_exit(self)?;
                Ok(ExitDisposition::Resume)
            }
            Some(ExitCode::Shutdown) => Ok(ExitDisposition::Shutdown),
            _ => {
                exits.handle_exit(self)?;
                Ok(ExitDisposition::Resume)
            }
        }
    }

    /// Drops the shadow mapping and the stale TLB entry for `addr`. Exit
    /// handlers call this when they emulate INVLPG or a CR3 move.
    pub fn invalidate(&mut self, addr: u64) -> Result<(), SvmError> {
        if let Some(shadow) = self.shadow.as_mut() {
            shadow.invalidate(addr)?;
            self.platform.invlpga(addr, GUEST_ASID);
        }
        Ok(())
    }

    /// Resolves a guest address to a host one, starting from the guest's
    /// memory mode. `None` means nothing backs the address right now.
    pub fn translate_guest_to_host(&self, addr: u64) -> Option<u64> {
        match self.memory_mode {
            MemoryMode::Physical => self
                .regions
                .lookup(addr)
                .and_then(|region| region.host_addr(addr)),
            MemoryMode::Virtual => self.shadow.as_ref()?.translate(addr),
        }
    }

    /// Cycles of virtual time the guest has consumed.
    pub fn guest_tsc(&self) -> u64 {
        self.guest_tsc
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Logs everything needed to diagnose a dead guest: where it was, what
    /// it was running, and the state it died with.
    fn dump_postmortem(&self, err: &SvmError) {
        let ctrl = &self.vmcb.control_area;
        let state = &self.vmcb.state_save_area;
        let linear = state.cs.base.wrapping_add(state.rip);

        error!("guest aborted: {err}");
        error!(
            "exit_code={:#x} exit_info1={:#x} exit_info2={:#x} exit_int_info={:#x}",
            ctrl.exit_code, ctrl.exit_info1, ctrl.exit_info2, ctrl.exit_int_info
        );
        error!("rip={:#x} (linear {linear:#x})", state.rip);
        match self.translate_guest_to_host(linear) {
            Some(host) => {
                let mut code = [0u8; 15];
                self.platform.read_host(host, &mut code);
                error!("code at {host:#x}: {code:02x?}");
            }
            None => error!("code address does not translate to host memory"),
        }
        error!("{:#x?}", self.registers);
        error!("{:?}", ctrl);
        error!("{:?}", state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::testing::MockPlatform,
        shadow::{RegionBacking, ShadowRegion},
        vmcb::ExitCode,
    };
    use alloc::vec;

    const EXIT_HLT: u64 = ExitCode::Hlt as u64;
    const EXIT_PF: u64 = ExitCode::ExceptionPf as u64;

    struct RecordingHandler {
        exits: Vec<u64>,
        fail_on: Option<u64>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                exits: Vec::new(),
                fail_on: None,
            }
        }
    }

    impl ExitHandler<MockPlatform> for RecordingHandler {
        fn handle_exit(&mut self, vcpu: &mut Vcpu<MockPlatform>) -> Result<(), SvmError> {
            let code = vcpu.vmcb.control_area.exit_code;
            self.exits.push(code);
            if self.fail_on == Some(code) {
                return Err(SvmError::UnhandledExit { code });
            }
            // A real handler would emulate; skipping the instruction is
            // enough for these tests.
            vcpu.registers.rip += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        writes: Vec<u64>,
        fulls: Vec<u64>,
    }

    impl MemoryHooks for RecordingHooks {
        fn handle_write_hook(
            &mut self,
            _registers: &mut Registers,
            fault_addr: u64,
            _region: &ShadowRegion,
            _access: PfErrorCode,
        ) -> Result<(), SvmError> {
            self.writes.push(fault_addr);
            Ok(())
        }

        fn handle_full_hook(
            &mut self,
            _registers: &mut Registers,
            fault_addr: u64,
            _region: &ShadowRegion,
            _access: PfErrorCode,
        ) -> Result<(), SvmError> {
            self.fulls.push(fault_addr);
            Ok(())
        }
    }

    fn shadow_config() -> VcpuConfig {
        let mut regions = RegionMap::new();
        regions
            .insert(ShadowRegion {
                guest_start: 0x0,
                guest_end: 0x100000,
                backing: RegionBacking::Allocated { host_base: 0x780_0000 },
            })
            .unwrap();
        regions
            .insert(ShadowRegion {
                guest_start: 0x100000,
                guest_end: 0x110000,
                backing: RegionBacking::WriteHook { host_base: 0x900_0000 },
            })
            .unwrap();
        regions
            .insert(ShadowRegion {
                guest_start: 0x110000,
                guest_end: 0x120000,
                backing: RegionBacking::FullHook,
            })
            .unwrap();
        VcpuConfig {
            paging_mode: PagingMode::ShadowPaging,
            width: PagingWidth::Bits32,
            memory_mode: MemoryMode::Physical,
            intercepted_ports: vec![0x60, 0x3f8],
            regions,
        }
    }

    #[test]
    fn builder_programs_the_control_block() {
        let vcpu = Vcpu::new(MockPlatform::new(), shadow_config()).unwrap();
        let ctrl = &vcpu.vmcb.control_area;
        let state = &vcpu.vmcb.state_save_area;

        assert!(vcpu.vmcb.has_mandatory_intercepts());
        assert_ne!(ctrl.guest_asid, 0);
        assert_ne!(ctrl.iopm_base_pa, 0);
        assert_eq!(ctrl.vintr, VINTR_V_INTR_MASKING);
        assert_ne!(ctrl.intercept_misc1 & INTERCEPT_MISC1_INVLPG, 0);
        assert_ne!(ctrl.intercept_cr_write & INTERCEPT_CR3, 0);
        let iopm = vcpu.iopm.as_ref().unwrap();
        assert!(iopm.is_intercepted(0x60));
        assert!(iopm.is_intercepted(0x3f8));
        assert!(!iopm.is_intercepted(0x61));
        assert_ne!(ctrl.intercept_misc1 & INTERCEPT_MISC1_IOIO_PROT, 0);

        assert_eq!(state.rip, RESET_RIP);
        assert_eq!(state.cs.selector, RESET_CS_SELECTOR);
        assert_eq!(state.cs.base, RESET_CS_BASE);
        assert_eq!(state.rflags, RESET_RFLAGS);
        assert_eq!(state.gpat, RESET_GPAT);
        assert_eq!(state.dr6, RESET_DR6);
        assert_eq!(state.dr7, RESET_DR7);
        assert_eq!(vcpu.registers.rdx, RESET_RDX);
        assert_ne!(state.efer & EFER_SVME, 0);
    }

    #[test]
    fn no_intercepted_ports_means_no_permission_map() {
        let config = VcpuConfig {
            intercepted_ports: Vec::new(),
            ..shadow_config()
        };
        let vcpu = Vcpu::new(MockPlatform::new(), config).unwrap();
        let ctrl = &vcpu.vmcb.control_area;

        assert!(vcpu.iopm.is_none());
        assert_eq!(ctrl.iopm_base_pa, 0);
        assert_eq!(ctrl.intercept_misc1 & INTERCEPT_MISC1_IOIO_PROT, 0);
        // The rest of the intercept set is unaffected.
        assert!(vcpu.vmcb.has_mandatory_intercepts());
    }

    #[test]
    fn shadow_paging_loads_the_shadow_root() {
        let vcpu = Vcpu::new(MockPlatform::new(), shadow_config()).unwrap();
        let state = &vcpu.vmcb.state_save_area;

        assert_ne!(state.cr0 & CR0_PG, 0);
        assert_eq!(state.cr3, vcpu.shadow.as_ref().unwrap().root_pa());
    }

    #[test]
    fn run_dispatches_exits_until_shutdown() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_HLT, 0, 0);
        platform.script_exit(EXIT_HLT, 0, 0);
        // The scripted queue then falls back to a shutdown exit.

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        let mut handler = RecordingHandler::new();
        let mut hooks = RecordingHooks::default();

        vcpu.run(&mut handler, &mut hooks).unwrap();
        assert_eq!(handler.exits, vec![EXIT_HLT, EXIT_HLT]);
    }

    #[test]
    fn run_brackets_every_entry_with_clgi_stgi() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_HLT, 0, 0);

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        let mut handler = RecordingHandler::new();
        vcpu.run(&mut handler, &mut RecordingHooks::default()).unwrap();

        // Two entries: the scripted halt and the fallback shutdown.
        assert_eq!(vcpu.platform().clgi_count, 2);
        assert_eq!(vcpu.platform().stgi_count, 2);
    }

    #[test]
    fn shadow_paging_flushes_the_tlb_on_every_entry() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_HLT, 0, 0);
        platform.script_exit(EXIT_HLT, 0, 0);

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        let mut handler = RecordingHandler::new();
        vcpu.run(&mut handler, &mut RecordingHooks::default()).unwrap();

        // Still armed after the second and later entries; stale shadow
        // translations must never survive a world switch.
        assert_eq!(
            vcpu.vmcb.control_area.tlb_control,
            TlbControl::FlushAll as u32
        );
    }

    #[test]
    fn nested_paging_flushes_only_the_first_entry() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_HLT, 0, 0);

        let config = VcpuConfig {
            paging_mode: PagingMode::NestedPaging,
            ..shadow_config()
        };
        let mut vcpu = Vcpu::new(platform, config).unwrap();
        assert_eq!(
            vcpu.vmcb.control_area.tlb_control,
            TlbControl::FlushAll as u32
        );

        let mut handler = RecordingHandler::new();
        vcpu.run(&mut handler, &mut RecordingHooks::default()).unwrap();
        assert_eq!(
            vcpu.vmcb.control_area.tlb_control,
            TlbControl::DoNotFlush as u32
        );
    }

    #[test]
    fn virtual_time_advances_only_inside_the_guest() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_HLT, 0, 0);

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        assert_eq!(vcpu.guest_tsc(), 0);

        let mut handler = RecordingHandler::new();
        vcpu.run(&mut handler, &mut RecordingHooks::default()).unwrap();

        // Each entry reads the counter on the way in and out; the mock
        // steps it by a fixed amount per read. Two entries happened.
        let step = vcpu.platform().tsc_step;
        assert_eq!(vcpu.guest_tsc(), 2 * step);
    }

    #[test]
    fn page_faults_are_consumed_by_the_shadow_engine() {
        let mut platform = MockPlatform::new();
        // Read of allocated memory, then a write into the write-hooked
        // region, then an access to the fully hooked region.
        platform.script_exit(EXIT_PF, 0x0, 0x5000);
        platform.script_exit(EXIT_PF, 0x2, 0x100800);
        platform.script_exit(EXIT_PF, 0x0, 0x110010);

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        let mut handler = RecordingHandler::new();
        let mut hooks = RecordingHooks::default();
        vcpu.run(&mut handler, &mut hooks).unwrap();

        // None of the faults reached the exit handler.
        assert!(handler.exits.is_empty());
        assert_eq!(hooks.writes, vec![0x100800]);
        assert_eq!(hooks.fulls, vec![0x110010]);
        assert_eq!(
            vcpu.shadow.as_ref().unwrap().translate(0x5000),
            Some(0x780_5000)
        );
    }

    #[test]
    fn fault_outside_every_region_kills_the_guest() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_PF, 0x0, 0xdead_0000);

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        let mut handler = RecordingHandler::new();
        let result = vcpu.run(&mut handler, &mut RecordingHooks::default());

        assert_eq!(result, Err(SvmError::UnmappedFault { addr: 0xdead_0000 }));
    }

    #[test]
    fn handler_failure_stops_the_loop() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_HLT, 0, 0);

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        let mut handler = RecordingHandler::new();
        handler.fail_on = Some(EXIT_HLT);

        let result = vcpu.run(&mut handler, &mut RecordingHooks::default());
        assert_eq!(result, Err(SvmError::UnhandledExit { code: EXIT_HLT }));
    }

    #[test]
    fn invalidate_drops_the_mapping_and_flushes_the_tlb() {
        let mut platform = MockPlatform::new();
        platform.script_exit(EXIT_PF, 0x0, 0x5000);

        let mut vcpu = Vcpu::new(platform, shadow_config()).unwrap();
        let mut handler = RecordingHandler::new();
        vcpu.run(&mut handler, &mut RecordingHooks::default()).unwrap();
        assert!(vcpu.shadow.as_ref().unwrap().translate(0x5000).is_some());

        vcpu.invalidate(0x5000).unwrap();
        assert!(vcpu.shadow.as_ref().unwrap().translate(0x5000).is_none());
        assert_eq!(vcpu.platform().invlpga_log, vec![(0x5000, GUEST_ASID)]);
    }

    #[test]
    fn physical_memory_mode_translates_through_regions() {
        let vcpu = Vcpu::new(MockPlatform::new(), shadow_config()).unwrap();
        assert_eq!(vcpu.translate_guest_to_host(0x1234), Some(0x780_1234));
        assert_eq!(vcpu.translate_guest_to_host(0x105000), Some(0x900_5000));
        assert_eq!(vcpu.translate_guest_to_host(0x115000), None);
        assert_eq!(vcpu.translate_guest_to_host(0x200000), None);
    }
}
