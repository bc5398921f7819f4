//! The fixed, ordered atom table.
//!
//! The order of [`ATOM_TABLE`] is the emission order and must not change at runtime: later atoms
//! depend on hardware state programmed by earlier ones. Capability-dependent sizes, optional
//! atoms, and per-generation encoders are all resolved once, when a registry is built.

use crate::atom::{Atom, AtomId, EmitFn};
use crate::caps::DeviceCaps;
use crate::emit;

/// Initial dword budget of an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    Fixed(u32),
    /// Cost depends on bound state; refreshed whenever that state changes.
    Variable,
    R500 { r500: u32, other: u32 },
    /// Larger when `GB_Z_PEQ_CONFIG` may be written.
    ZPeqConfig { with: u32, without: u32 },
    Rv350Extra { base: u32, extra: u32 },
    Drm230Extra { base: u32, extra: u32 },
    Tcl { tcl: u32, swtcl: u32 },
}

impl SizeRule {
    pub fn resolve(self, caps: &DeviceCaps) -> u32 {
        match self {
            SizeRule::Fixed(n) => n,
            SizeRule::Variable => 0,
            SizeRule::R500 { r500, other } => {
                if caps.is_r500() {
                    r500
                } else {
                    other
                }
            }
            SizeRule::ZPeqConfig { with, without } => {
                if caps.has_z_peq_config() {
                    with
                } else {
                    without
                }
            }
            SizeRule::Rv350Extra { base, extra } => base + if caps.is_rv350() { extra } else { 0 },
            SizeRule::Drm230Extra { base, extra } => base + if caps.drm_2_3_0() { extra } else { 0 },
            SizeRule::Tcl { tcl, swtcl } => {
                if caps.has_tcl() {
                    tcl
                } else {
                    swtcl
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Always,
    HyperZ,
    HyperZWithHizRam,
}

impl Presence {
    pub fn resolve(self, caps: &DeviceCaps) -> bool {
        match self {
            Presence::Always => true,
            Presence::HyperZ => caps.has_hyperz(),
            Presence::HyperZWithHizRam => caps.has_hyperz() && caps.has_hiz_ram(),
        }
    }
}

#[derive(Clone, Copy)]
pub enum Encoder {
    Single(EmitFn),
    PerGeneration { r300: EmitFn, r500: EmitFn },
    PerVertexPath { tcl: EmitFn, swtcl: EmitFn },
}

impl Encoder {
    pub fn resolve(self, caps: &DeviceCaps) -> EmitFn {
        match self {
            Encoder::Single(f) => f,
            Encoder::PerGeneration { r300, r500 } => {
                if caps.is_r500() {
                    r500
                } else {
                    r300
                }
            }
            Encoder::PerVertexPath { tcl, swtcl } => {
                if caps.has_tcl() {
                    tcl
                } else {
                    swtcl
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
pub struct AtomEntry {
    pub id: AtomId,
    pub size: SizeRule,
    pub presence: Presence,
    pub allow_null_state: bool,
    pub always_emit: bool,
    /// Marked dirty as soon as the registry is built.
    pub primed: bool,
    pub encoder: Encoder,
}

const fn atom(id: AtomId, size: SizeRule, encoder: Encoder) -> AtomEntry {
    AtomEntry {
        id,
        size,
        presence: Presence::Always,
        allow_null_state: false,
        always_emit: false,
        primed: false,
        encoder,
    }
}

const fn allow_null(mut entry: AtomEntry) -> AtomEntry {
    entry.allow_null_state = true;
    entry
}

const fn primed(mut entry: AtomEntry) -> AtomEntry {
    entry.primed = true;
    entry
}

const fn only_if(mut entry: AtomEntry, presence: Presence) -> AtomEntry {
    entry.presence = presence;
    entry
}

use Encoder::{PerGeneration, PerVertexPath, Single};
use SizeRule::{Drm230Extra, Fixed, Rv350Extra, Tcl, Variable, ZPeqConfig, R500};

pub const ATOM_TABLE: &[AtomEntry] = &[
    atom(AtomId::GpuFlush, Fixed(9), Single(emit::gpu_flush)),
    atom(AtomId::AaState, Fixed(4), Single(emit::aa_state)),
    atom(AtomId::FbState, Variable, Single(emit::fb_state)),
    atom(
        AtomId::HyperzState,
        ZPeqConfig { with: 10, without: 8 },
        Single(emit::prebuilt_hyperz),
    ),
    atom(AtomId::ZtopState, Fixed(2), Single(emit::ztop_state)),
    atom(
        AtomId::DsaState,
        R500 { r500: 8, other: 6 },
        PerGeneration {
            r300: emit::dsa_state,
            r500: emit::r500_dsa_state,
        },
    ),
    atom(AtomId::BlendState, Fixed(8), Single(emit::blend_state)),
    atom(
        AtomId::BlendColorState,
        R500 { r500: 3, other: 2 },
        PerGeneration {
            r300: emit::blend_color_state,
            r500: emit::r500_blend_color_state,
        },
    ),
    atom(AtomId::ScissorState, Fixed(3), Single(emit::scissor_state)),
    primed(atom(
        AtomId::InvariantState,
        Rv350Extra { base: 16, extra: 4 },
        Single(emit::prebuilt_invariant),
    )),
    atom(AtomId::ViewportState, Fixed(9), Single(emit::viewport_state)),
    primed(allow_null(atom(
        AtomId::PvsFlush,
        Fixed(2),
        Single(emit::pvs_flush),
    ))),
    primed(atom(
        AtomId::VapInvariantState,
        Fixed(9),
        Single(emit::prebuilt_vap_invariant),
    )),
    atom(
        AtomId::VertexStreamState,
        Variable,
        Single(emit::vertex_stream_state),
    ),
    atom(AtomId::VsState, Variable, Single(emit::vs_state)),
    atom(AtomId::VsConstants, Variable, Single(emit::vs_constants)),
    atom(
        AtomId::ClipState,
        Tcl {
            tcl: 5 + 6 * 4,
            swtcl: 2,
        },
        PerVertexPath {
            tcl: emit::clip_state,
            swtcl: emit::swtcl_clip_state,
        },
    ),
    atom(AtomId::RsBlockState, Variable, Single(emit::rs_block_state)),
    atom(AtomId::RsState, Variable, Single(emit::rs_state)),
    allow_null(atom(
        AtomId::FbStatePipelined,
        Drm230Extra { base: 5, extra: 3 },
        Single(emit::fb_state_pipelined),
    )),
    atom(
        AtomId::Fs,
        Variable,
        PerGeneration {
            r300: emit::fs,
            r500: emit::r500_fs,
        },
    ),
    allow_null(atom(
        AtomId::FsRcConstantState,
        Variable,
        PerGeneration {
            r300: emit::fs_rc_constant_state,
            r500: emit::r500_fs_rc_constant_state,
        },
    )),
    atom(
        AtomId::FsConstants,
        Variable,
        PerGeneration {
            r300: emit::fs_constants,
            r500: emit::r500_fs_constants,
        },
    ),
    primed(allow_null(atom(
        AtomId::TextureCacheInval,
        Fixed(2),
        Single(emit::texture_cache_inval),
    ))),
    primed(atom(
        AtomId::TexturesState,
        Variable,
        Single(emit::textures_state),
    )),
    only_if(
        atom(AtomId::HizClear, Variable, Single(emit::hiz_clear)),
        Presence::HyperZWithHizRam,
    ),
    only_if(
        atom(AtomId::ZmaskClear, Variable, Single(emit::zmask_clear)),
        Presence::HyperZ,
    ),
    allow_null(atom(AtomId::QueryStart, Fixed(4), Single(emit::query_start))),
];

/// Ordered set of atoms for one context.
#[derive(Debug)]
pub struct AtomRegistry {
    atoms: Vec<Atom>,
    slots: [Option<usize>; AtomId::COUNT],
}

impl AtomRegistry {
    pub fn new(caps: &DeviceCaps) -> Self {
        Self::from_table(ATOM_TABLE, caps)
    }

    pub fn from_table(entries: &[AtomEntry], caps: &DeviceCaps) -> Self {
        let mut atoms = Vec::with_capacity(entries.len());
        let mut slots = [None; AtomId::COUNT];
        for entry in entries {
            if !entry.presence.resolve(caps) {
                continue;
            }
            debug_assert!(
                slots[entry.id.index()].is_none(),
                "atom `{}` registered twice",
                entry.id
            );
            slots[entry.id.index()] = Some(atoms.len());
            let mut atom = Atom::new(entry.id, entry.size.resolve(caps), entry.encoder.resolve(caps))
                .allowing_null_state(entry.allow_null_state)
                .always_emitted(entry.always_emit);
            if entry.primed {
                atom.mark_dirty();
            }
            atoms.push(atom);
        }
        Self { atoms, slots }
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Atom> {
        self.atoms.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Atom> {
        self.atoms.iter_mut()
    }

    pub fn order(&self) -> Vec<AtomId> {
        self.atoms.iter().map(Atom::id).collect()
    }

    pub fn contains(&self, id: AtomId) -> bool {
        self.slots[id.index()].is_some()
    }

    pub fn get(&self, id: AtomId) -> Option<&Atom> {
        self.slots[id.index()].map(|i| &self.atoms[i])
    }

    pub(crate) fn get_mut(&mut self, id: AtomId) -> Option<&mut Atom> {
        self.slots[id.index()].map(move |i| &mut self.atoms[i])
    }

    /// Mark `id` dirty. Returns `false` when the atom is not part of this registry.
    pub fn mark_dirty(&mut self, id: AtomId) -> bool {
        match self.get_mut(id) {
            Some(atom) => {
                atom.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Drop a pending emission. Used when the block behind the atom is unbound before it was sent.
    pub(crate) fn mark_clean(&mut self, id: AtomId) {
        if let Some(atom) = self.get_mut(id) {
            atom.mark_clean();
        }
    }

    pub fn is_dirty(&self, id: AtomId) -> bool {
        self.get(id).is_some_and(Atom::is_dirty)
    }

    pub fn dirty_ids(&self) -> Vec<AtomId> {
        self.atoms
            .iter()
            .filter(|atom| atom.needs_emit())
            .map(Atom::id)
            .collect()
    }

    /// Dword estimate for emitting everything currently pending.
    pub fn pending_dwords(&self) -> usize {
        self.atoms
            .iter()
            .filter(|atom| atom.needs_emit())
            .map(|atom| atom.size() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::Encoder::Single;
    use super::SizeRule::Fixed;
    use super::*;
    use crate::caps::{CapFlags, ChipFamily};

    fn size_of(reg: &AtomRegistry, id: AtomId) -> u32 {
        reg.get(id).map(Atom::size).unwrap()
    }

    #[test]
    fn table_covers_every_atom_once_in_declaration_order() {
        let ids: Vec<_> = ATOM_TABLE.iter().map(|entry| entry.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), AtomId::COUNT);
    }

    #[test]
    fn r300_sizes() {
        let caps = DeviceCaps::new(ChipFamily::R300).without(CapFlags::DRM_2_3_0);
        let reg = AtomRegistry::new(&caps);
        assert_eq!(size_of(&reg, AtomId::GpuFlush), 9);
        assert_eq!(size_of(&reg, AtomId::HyperzState), 8);
        assert_eq!(size_of(&reg, AtomId::DsaState), 6);
        assert_eq!(size_of(&reg, AtomId::BlendColorState), 2);
        assert_eq!(size_of(&reg, AtomId::InvariantState), 16);
        assert_eq!(size_of(&reg, AtomId::ClipState), 29);
        assert_eq!(size_of(&reg, AtomId::FbStatePipelined), 5);
        assert_eq!(size_of(&reg, AtomId::FbState), 0);
    }

    #[test]
    fn r500_sizes() {
        let reg = AtomRegistry::new(&DeviceCaps::new(ChipFamily::R500));
        assert_eq!(size_of(&reg, AtomId::HyperzState), 10);
        assert_eq!(size_of(&reg, AtomId::DsaState), 8);
        assert_eq!(size_of(&reg, AtomId::BlendColorState), 3);
        assert_eq!(size_of(&reg, AtomId::InvariantState), 20);
        assert_eq!(size_of(&reg, AtomId::FbStatePipelined), 8);
    }

    #[test]
    fn rv350_hyperz_size_depends_on_kernel() {
        let old = DeviceCaps::new(ChipFamily::Rv350).without(CapFlags::DRM_2_6_0);
        assert_eq!(size_of(&AtomRegistry::new(&old), AtomId::HyperzState), 8);
        let new = DeviceCaps::new(ChipFamily::Rv350);
        assert_eq!(size_of(&AtomRegistry::new(&new), AtomId::HyperzState), 10);
    }

    #[test]
    fn software_tcl_clip_is_two_dwords() {
        let caps = DeviceCaps::new(ChipFamily::R300).without(CapFlags::HAS_TCL);
        assert_eq!(size_of(&AtomRegistry::new(&caps), AtomId::ClipState), 2);
    }

    #[test]
    fn hyperz_atoms_follow_capabilities() {
        let plain = AtomRegistry::new(&DeviceCaps::new(ChipFamily::Rv350));
        assert!(!plain.contains(AtomId::HizClear));
        assert!(!plain.contains(AtomId::ZmaskClear));
        assert_eq!(plain.len(), AtomId::COUNT - 2);

        let hyperz = DeviceCaps::new(ChipFamily::Rv350).with(CapFlags::CAN_HYPERZ);
        let reg = AtomRegistry::new(&hyperz);
        assert!(reg.contains(AtomId::HizClear));
        assert!(reg.contains(AtomId::ZmaskClear));

        let no_hiz_ram = hyperz.with_hiz_ram(0);
        let reg = AtomRegistry::new(&no_hiz_ram);
        assert!(!reg.contains(AtomId::HizClear));
        assert!(reg.contains(AtomId::ZmaskClear));
    }

    #[test]
    fn optional_atoms_keep_relative_order() {
        let caps = DeviceCaps::new(ChipFamily::R500).with(CapFlags::CAN_HYPERZ);
        let order = AtomRegistry::new(&caps).order();
        let tail: Vec<_> = order[order.len() - 4..].to_vec();
        assert_eq!(
            tail,
            vec![
                AtomId::TexturesState,
                AtomId::HizClear,
                AtomId::ZmaskClear,
                AtomId::QueryStart
            ]
        );
    }

    #[test]
    fn primed_atoms_start_dirty() {
        let reg = AtomRegistry::new(&DeviceCaps::new(ChipFamily::R300));
        assert_eq!(
            reg.dirty_ids(),
            vec![
                AtomId::InvariantState,
                AtomId::PvsFlush,
                AtomId::VapInvariantState,
                AtomId::TextureCacheInval,
                AtomId::TexturesState,
            ]
        );
    }

    #[test]
    fn null_state_atoms() {
        let reg = AtomRegistry::new(&DeviceCaps::new(ChipFamily::R300));
        let allowed: Vec<_> = reg
            .iter()
            .filter(|atom| atom.allow_null_state())
            .map(Atom::id)
            .collect();
        assert_eq!(
            allowed,
            vec![
                AtomId::PvsFlush,
                AtomId::FbStatePipelined,
                AtomId::FsRcConstantState,
                AtomId::TextureCacheInval,
                AtomId::QueryStart,
            ]
        );
    }

    #[test]
    fn generation_encoders_are_selected_once() {
        let r300 = AtomRegistry::new(&DeviceCaps::new(ChipFamily::R300));
        let r500 = AtomRegistry::new(&DeviceCaps::new(ChipFamily::R500));
        for id in [AtomId::Fs, AtomId::FsRcConstantState, AtomId::FsConstants] {
            let a = r300.get(id).unwrap().emitter() as usize;
            let b = r500.get(id).unwrap().emitter() as usize;
            assert_ne!(a, b, "{id} should use a generation-specific encoder");
        }
    }

    #[test]
    fn always_emit_atoms_count_as_pending() {
        let entries = [
            atom(AtomId::GpuFlush, Fixed(9), Single(emit::gpu_flush)),
            AtomEntry {
                always_emit: true,
                ..atom(AtomId::PvsFlush, Fixed(2), Single(emit::pvs_flush))
            },
        ];
        let reg = AtomRegistry::from_table(&entries, &DeviceCaps::new(ChipFamily::R300));
        assert_eq!(reg.dirty_ids(), vec![AtomId::PvsFlush]);
        assert_eq!(reg.pending_dwords(), 2);
        assert!(!reg.is_dirty(AtomId::PvsFlush));
    }

    #[test]
    fn marking_an_absent_atom_reports_false() {
        let mut reg = AtomRegistry::new(&DeviceCaps::new(ChipFamily::R300));
        assert!(!reg.mark_dirty(AtomId::ZmaskClear));
        assert!(reg.mark_dirty(AtomId::BlendState));
        assert!(reg.is_dirty(AtomId::BlendState));
    }
}
