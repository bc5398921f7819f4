//! Device capability model.
//!
//! Capabilities are resolved once per context: the atom registry, per-generation encoders, and
//! prebuilt command blocks are all derived from a [`DeviceCaps`] snapshot taken at creation.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CapFlags: u32 {
        /// RV350 or newer (set on R500 parts as well).
        const IS_RV350 = 1 << 0;
        const IS_R500 = 1 << 1;
        /// Hardware vertex processing. Without it the software pipeline runs.
        const HAS_TCL = 1 << 2;
        /// Kernel command checker accepts the multisample position registers.
        const DRM_2_3_0 = 1 << 3;
        /// Kernel command checker accepts `GB_Z_PEQ_CONFIG`.
        const DRM_2_6_0 = 1 << 4;
        /// The kernel granted hyper-Z access to this process.
        const CAN_HYPERZ = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    R300,
    Rv350,
    R500,
}

impl ChipFamily {
    pub fn flags(self) -> CapFlags {
        match self {
            ChipFamily::R300 => CapFlags::empty(),
            ChipFamily::Rv350 => CapFlags::IS_RV350,
            ChipFamily::R500 => CapFlags::IS_RV350 | CapFlags::IS_R500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCaps {
    pub family: ChipFamily,
    pub flags: CapFlags,
    /// Bytes of on-chip HiZ RAM. Zero means no HiZ.
    pub hiz_ram: u32,
    /// Bytes of on-chip zmask RAM managed by the hyper-Z allocator.
    pub zmask_ram: u32,
}

impl DeviceCaps {
    /// Capabilities for `family` with hardware TCL and a current kernel.
    pub fn new(family: ChipFamily) -> Self {
        let hiz_ram = match family {
            ChipFamily::R300 => 0,
            ChipFamily::Rv350 | ChipFamily::R500 => 0x2000,
        };
        Self {
            family,
            flags: family.flags() | CapFlags::HAS_TCL | CapFlags::DRM_2_3_0 | CapFlags::DRM_2_6_0,
            hiz_ram,
            zmask_ram: 0x4000,
        }
    }

    pub fn with(mut self, flags: CapFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn without(mut self, flags: CapFlags) -> Self {
        self.flags -= flags;
        self
    }

    pub fn with_hiz_ram(mut self, bytes: u32) -> Self {
        self.hiz_ram = bytes;
        self
    }

    pub fn with_zmask_ram(mut self, bytes: u32) -> Self {
        self.zmask_ram = bytes;
        self
    }

    pub fn is_rv350(&self) -> bool {
        self.flags.contains(CapFlags::IS_RV350)
    }

    pub fn is_r500(&self) -> bool {
        self.flags.contains(CapFlags::IS_R500)
    }

    pub fn has_tcl(&self) -> bool {
        self.flags.contains(CapFlags::HAS_TCL)
    }

    pub fn drm_2_3_0(&self) -> bool {
        self.flags.contains(CapFlags::DRM_2_3_0)
    }

    pub fn drm_2_6_0(&self) -> bool {
        self.flags.contains(CapFlags::DRM_2_6_0)
    }

    pub fn has_hyperz(&self) -> bool {
        self.flags.contains(CapFlags::CAN_HYPERZ)
    }

    pub fn has_hiz_ram(&self) -> bool {
        self.hiz_ram > 0
    }

    /// Whether `GB_Z_PEQ_CONFIG` may be written.
    pub fn has_z_peq_config(&self) -> bool {
        self.is_r500() || (self.is_rv350() && self.drm_2_6_0())
    }
}
