//! Architecture adapter
//!
//! Trap encodings and the per-breakpoint architecture payload. The host
//! architecture is fixed at build time through `cfg(target_arch)`; the other
//! variants stay available so the breakpoint logic can be exercised against
//! any encoding.

use crate::breakpoint::BreakpointError;
use crate::core::Inferior;

/// Supported target architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
    /// Little-endian PowerPC 64
    Ppc64,
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64",
    target_arch = "powerpc64"
)))]
compile_error!("bptrace supports x86_64, aarch64, riscv64 and powerpc64 hosts only");

const X86_INT3: [u8; 1] = [0xcc];
const AARCH64_BRK: [u8; 4] = 0xd420_0000u32.to_le_bytes();
const RISCV_C_EBREAK: [u8; 2] = 0x9002u16.to_le_bytes();
const PPC_TRAP: [u8; 4] = 0x7fe0_0008u32.to_le_bytes();

impl Arch {
    /// Architecture this binary was built for
    pub const fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Arch::X86_64
        }
        #[cfg(target_arch = "aarch64")]
        {
            Arch::Aarch64
        }
        #[cfg(target_arch = "riscv64")]
        {
            Arch::Riscv64
        }
        #[cfg(target_arch = "powerpc64")]
        {
            Arch::Ppc64
        }
    }

    /// Trap instruction encoding, in target byte order
    pub const fn trap_bytes(self) -> &'static [u8] {
        match self {
            Arch::X86_64 => &X86_INT3,
            Arch::Aarch64 => &AARCH64_BRK,
            Arch::Riscv64 => &RISCV_C_EBREAK,
            Arch::Ppc64 => &PPC_TRAP,
        }
    }

    pub const fn trap_len(self) -> usize {
        self.trap_bytes().len()
    }

    /// How far the PC has moved past the breakpoint address when the trap is
    /// reported. Only x86 reports the address after `int3`.
    pub const fn decr_pc_after_break(self) -> u64 {
        match self {
            Arch::X86_64 => 1,
            Arch::Aarch64 | Arch::Riscv64 | Arch::Ppc64 => 0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
            Arch::Ppc64 => "ppc64le",
        }
    }
}

/// Architecture-specific state attached to one breakpoint.
///
/// Not `Clone`: a payload may own process resources, so copies are only made
/// through [`ArchData::clone_for`].
#[derive(Debug, PartialEq, Eq)]
pub enum ArchData {
    /// Optional DR0-DR3 slot backing the trap while the breakpoint is active
    X86_64 { debug_slot: Option<u8> },
    Aarch64,
    Riscv64,
    Ppc64,
}

impl ArchData {
    pub fn new(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => ArchData::X86_64 { debug_slot: None },
            Arch::Aarch64 => ArchData::Aarch64,
            Arch::Riscv64 => ArchData::Riscv64,
            Arch::Ppc64 => ArchData::Ppc64,
        }
    }

    pub fn debug_slot(&self) -> Option<u8> {
        match self {
            ArchData::X86_64 { debug_slot } => *debug_slot,
            _ => None,
        }
    }

    /// Runs when the breakpoint goes from inactive to active.
    pub fn init(
        &mut self,
        address: u64,
        inferior: &mut dyn Inferior,
    ) -> Result<(), BreakpointError> {
        if let ArchData::X86_64 { debug_slot } = self {
            if debug_slot.is_none() {
                *debug_slot = inferior.claim_debug_slot(address);
                if let Some(slot) = debug_slot {
                    log::trace!("{:#x}: using debug register slot {}", address, slot);
                }
            }
        }
        Ok(())
    }

    /// Runs when the breakpoint goes back to inactive.
    pub fn teardown(&mut self, inferior: &mut dyn Inferior) {
        if let ArchData::X86_64 { debug_slot } = self {
            if let Some(slot) = debug_slot.take() {
                inferior.release_debug_slot(slot);
            }
        }
    }

    /// Derive an equivalent payload for a breakpoint at `address` in `new`.
    pub fn clone_for(
        &self,
        address: u64,
        new: &mut dyn Inferior,
    ) -> Result<Self, BreakpointError> {
        match self {
            ArchData::X86_64 {
                debug_slot: Some(_),
            } => match new.claim_debug_slot(address) {
                Some(slot) => Ok(ArchData::X86_64 {
                    debug_slot: Some(slot),
                }),
                None => Err(BreakpointError::CloneFailure {
                    address,
                    reason: format!("no free debug register in pid {}", new.pid()),
                }),
            },
            ArchData::X86_64 { debug_slot: None } => Ok(ArchData::X86_64 { debug_slot: None }),
            ArchData::Aarch64 => Ok(ArchData::Aarch64),
            ArchData::Riscv64 => Ok(ArchData::Riscv64),
            ArchData::Ppc64 => Ok(ArchData::Ppc64),
        }
    }
}
