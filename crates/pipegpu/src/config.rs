use bitflags::bitflags;
use tracing::warn;

/// Environment variable holding a comma-separated list of debug flags.
pub const DEBUG_ENV: &str = "PIPEGPU_DEBUG";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugFlags: u32 {
        /// Report per-context flush and per-atom emission counts on destruction.
        const STATS = 1 << 0;
        /// Log every submitted command stream.
        const CS = 1 << 1;
        /// Pretend the kernel refused hyper-Z access.
        const NO_HYPERZ = 1 << 2;
    }
}

impl DebugFlags {
    /// Parse `stats,cs,nohiz`-style lists. Unknown names are logged and ignored.
    pub fn parse(list: &str) -> Self {
        let mut flags = DebugFlags::empty();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "stats" | "info" => flags |= DebugFlags::STATS,
                "cs" => flags |= DebugFlags::CS,
                "nohiz" | "nohyperz" => flags |= DebugFlags::NO_HYPERZ,
                "all" => flags = DebugFlags::all(),
                other => warn!(flag = other, "unknown debug flag"),
            }
        }
        flags
    }

    pub fn from_env() -> Self {
        std::env::var(DEBUG_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Per-context tunables. The defaults match what the hardware driver has always used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextConfig {
    pub index_upload_size: u64,
    pub vertex_upload_size: u64,
    pub upload_alignment: u64,
    pub cs_capacity_dwords: usize,
    /// Lines wider than this are converted to triangles by the software vertex path.
    pub wide_line_threshold: f32,
    pub wide_point_threshold: f32,
    /// Slots per block of the per-context transfer pool.
    pub transfer_pool_block: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            index_upload_size: 32 * 1024,
            vertex_upload_size: 128 * 1024,
            upload_alignment: 16,
            cs_capacity_dwords: 16 * 1024,
            wide_line_threshold: 10_000_000.0,
            wide_point_threshold: 10_000_000.0,
            transfer_pool_block: 64,
        }
    }
}
