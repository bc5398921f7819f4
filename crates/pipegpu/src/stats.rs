use std::fmt::Write as _;
use std::sync::Mutex;

use crate::registry::AtomRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomStat {
    pub name: &'static str,
    pub emits: u64,
}

/// Per-context counters, reported when the context is destroyed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub context_id: u64,
    pub flushes: u64,
    pub submitted_dwords: u64,
    pub draws: u64,
    pub upload_bytes: u64,
    pub atoms: Vec<AtomStat>,
}

impl ContextStats {
    pub(crate) fn collect_atoms(registry: &AtomRegistry) -> Vec<AtomStat> {
        registry
            .iter()
            .map(|atom| AtomStat {
                name: atom.name(),
                emits: atom.emit_count(),
            })
            .collect()
    }

    pub fn emits_of(&self, name: &str) -> Option<u64> {
        self.atoms
            .iter()
            .find(|stat| stat.name == name)
            .map(|stat| stat.emits)
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        let mut atoms = String::new();
        for (i, stat) in self.atoms.iter().enumerate() {
            if i > 0 {
                atoms.push(',');
            }
            let _ = write!(atoms, "\"{}\":{}", stat.name, stat.emits);
        }
        format!(
            "{{\"context_id\":{},\"flushes\":{},\"submitted_dwords\":{},\"draws\":{},\"upload_bytes\":{},\"atoms\":{{{}}}}}",
            self.context_id,
            self.flushes,
            self.submitted_dwords,
            self.draws,
            self.upload_bytes,
            atoms
        )
    }
}

/// Receives a context's statistics when the context is destroyed.
pub trait StatsSink: Send + Sync {
    fn report(&self, stats: &ContextStats);
}

/// Sink that keeps every report in memory.
#[derive(Debug, Default)]
pub struct CollectingStatsSink {
    reports: Mutex<Vec<ContextStats>>,
}

impl CollectingStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ContextStats> {
        self.reports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl StatsSink for CollectingStatsSink {
    fn report(&self, stats: &ContextStats) {
        self.reports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(stats.clone());
    }
}
