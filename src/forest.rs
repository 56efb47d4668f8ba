//! Forest Snapshot
//!
//! Read-only snapshots of the forest and ghost-layer collaborators that the
//! augmentation is built from. Construction, refinement, 2:1 balancing and
//! repartitioning happen elsewhere; this crate only consumes the result.
//!

use crate::mesh::*;
use crate::util::*;
use more_asserts::assert_lt;
use serde::{Deserialize, Serialize};

/// leaf element descriptor, the part of a quadrant the augmentation reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quadrant {
    /// refinement level of this leaf
    pub level: Level,
    /// tree of the forest this leaf belongs to
    pub which_tree: Topidx,
}

impl Quadrant {
    pub fn new(level: Level, which_tree: Topidx) -> Self {
        Self { level, which_tree }
    }
}

/// the locally owned part of a distributed forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forest {
    pub dimension: Dimension,
    /// locally owned leaves in ascending qid order
    pub quadrants: Vec<Quadrant>,
    /// number of ranks the forest is partitioned across
    pub mpisize: Rank,
    /// rank owning this part
    pub mpirank: Rank,
}

impl Forest {
    pub fn new(dimension: Dimension, quadrants: Vec<Quadrant>, mpisize: Rank, mpirank: Rank) -> Self {
        assert!(mpisize >= 1, "forest must be partitioned across at least one rank");
        assert!(0 <= mpirank && mpirank < mpisize, "rank {} out of range for {} ranks", mpirank, mpisize);
        Self {
            dimension,
            quadrants,
            mpisize,
            mpirank,
        }
    }

    pub fn local_num_quadrants(&self) -> Locidx {
        self.quadrants.len() as Locidx
    }

    /// check the 2:1 condition across the directions selected by `btype`: no
    /// neighbor pair may differ by more than one refinement level
    pub fn is_balanced(&self, ghost: &Ghost, mesh: &NeighborMesh, btype: ConnectType) -> bool {
        let num_directions = btype.num_directions(self.dimension);
        for (qid, quadrant) in self.quadrants.iter().enumerate() {
            for dir in 0..num_directions {
                for neighbor in mesh.get_neighbors(qid as Locidx, dir) {
                    let neighbor_level = mesh.level_of(self, ghost, neighbor.qid);
                    if quadrant.level.abs_diff(neighbor_level) > 1 {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// the ghost layer: off-rank leaves replicated locally because they neighbor
/// an owned leaf, sorted by owner rank first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ghost {
    /// ghost leaf descriptors in ascending gqid order
    pub ghosts: Vec<Quadrant>,
    /// mirror slots sent to each rank: slot range for rank p is
    /// `mirror_proc_offsets[p]..mirror_proc_offsets[p+1]`; length mpisize+1
    pub mirror_proc_offsets: Vec<Locidx>,
}

impl Ghost {
    pub fn new(ghosts: Vec<Quadrant>, mirror_proc_offsets: Vec<Locidx>) -> Self {
        Self {
            ghosts,
            mirror_proc_offsets,
        }
    }

    /// an empty ghost layer for a single-rank forest
    pub fn new_empty() -> Self {
        Self::new(vec![], vec![0, 0])
    }

    pub fn num_ghosts(&self) -> Locidx {
        self.ghosts.len() as Locidx
    }

    /// total number of mirror slots across all destination ranks
    pub fn num_mirror_slots(&self) -> Locidx {
        *self.mirror_proc_offsets.last().expect("mirror offsets must not be empty")
    }

    pub fn level(&self, gqid: Locidx) -> Level {
        assert_lt!(gqid, self.num_ghosts(), "ghost id out of range");
        self.ghosts[gqid as usize].level
    }

    /// offsets must be monotone and sized mpisize+1
    pub fn sanity_check(&self, mpisize: Rank) -> Result<(), String> {
        if self.mirror_proc_offsets.len() != mpisize as usize + 1 {
            return Err(format!(
                "mirror_proc_offsets has {} entries, expected mpisize+1 = {}",
                self.mirror_proc_offsets.len(),
                mpisize + 1
            ));
        }
        if self.mirror_proc_offsets[0] != 0 {
            return Err("mirror_proc_offsets must start at 0".to_string());
        }
        for p in 0..mpisize as usize {
            if self.mirror_proc_offsets[p] > self.mirror_proc_offsets[p + 1] {
                return Err(format!("mirror_proc_offsets not monotone at rank {}", p));
            }
        }
        Ok(())
    }
}
