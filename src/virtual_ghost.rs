//! Virtual Ghost
//!
//! The mirror/ghost companion of the virtual-quadrant augmentation: for each
//! mirror element sent to each remote rank, records whether that rank will
//! place virtual children descending from the mirror and therefore expects an
//! extended payload. A purely local computation; actual transport lives with
//! the ghost-exchange collaborator.
//!

use crate::forest::*;
use crate::mesh::*;
use crate::util::*;
use crate::virtual_quads::*;
use crate::visualize::*;
use derivative::Derivative;
use more_asserts::assert_le;
use serde::{Deserialize, Serialize};

/// per mirror-slot decision whether the destination rank places virtuals over
/// the mirror; shares the lifetime class of the augmentation it was built from
#[derive(Derivative, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct VirtualGhost {
    /// connectivity used for the resolution, `<=` the augmentation's
    pub btype: ConnectType,
    /// indexed by the ghost layer's mirror slot; `true` means the slot's
    /// destination rank hosts virtual children of this mirror
    #[derivative(Debug = "ignore")]
    mirror_proc_virtuals: Vec<bool>,
}

impl VirtualGhost {
    /// resolve all mirror slots against the augmentation
    ///
    /// A slot is set iff its mirror hosts virtuals and some direction yields
    /// a ghost neighbor owned by the slot's destination rank whose encoding
    /// marks it half-sized: only then does the remote rank refine past the
    /// mirror and place virtuals that descend from it.
    pub fn new(forest: &Forest, ghost: &Ghost, mesh: &NeighborMesh, virtual_quads: &VirtualQuads, btype: ConnectType) -> Self {
        assert_le!(
            btype,
            virtual_quads.btype,
            "mirror resolution cannot use a richer connectivity than the augmentation"
        );
        ghost.sanity_check(forest.mpisize).unwrap();
        let lq = mesh.local_num_quadrants;
        let gq = mesh.ghost_num_quadrants;
        let num_directions = btype.num_directions(mesh.dimension);
        let mut mirror_proc_virtuals = vec![false; ghost.num_mirror_slots() as usize];
        for proc in 0..forest.mpisize {
            let offset_begin = ghost.mirror_proc_offsets[proc as usize];
            let offset_end = ghost.mirror_proc_offsets[proc as usize + 1];
            for slot in offset_begin..offset_end {
                let mirror_qid = mesh.mirror_qid[slot as usize];
                if virtual_quads.qflag(mirror_qid).is_none() {
                    continue;
                }
                'mirror: for dir in 0..num_directions {
                    for neighbor in mesh.get_neighbors(mirror_qid, dir) {
                        if lq <= neighbor.qid
                            && neighbor.qid < lq + gq
                            && mesh.ghost_to_proc[(neighbor.qid - lq) as usize] == proc
                            && neighbor.is_half_size()
                        {
                            mirror_proc_virtuals[slot as usize] = true;
                            break 'mirror;
                        }
                    }
                }
            }
        }
        Self {
            btype,
            mirror_proc_virtuals,
        }
    }

    /// the full per-slot decision array, `ghost.mirror_proc_offsets` delimits
    /// the slots per destination rank
    pub fn mirror_proc_virtuals(&self) -> &[bool] {
        &self.mirror_proc_virtuals
    }

    /// whether the payload for this mirror slot must carry virtual data
    pub fn needs_virtual_payload(&self, slot: Locidx) -> bool {
        self.mirror_proc_virtuals[slot as usize]
    }

    /// bytes owned by this assignment: the flag body plus the header
    pub fn memory_used(&self) -> usize {
        std::mem::size_of::<VirtualGhost>() + self.mirror_proc_virtuals.len() * std::mem::size_of::<bool>()
    }
}

impl ForestVisualizer for VirtualGhost {
    fn snapshot(&self, abbrev: bool) -> serde_json::Value {
        json!({
            if abbrev { "mv" } else { "mirror_proc_virtuals" }: &self.mirror_proc_virtuals,
        })
    }
}
