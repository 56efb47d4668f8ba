//! Neighbor Mesh
//!
//! Precomputed adjacency over the owned part of the forest. For every owned
//! element and every neighbor direction of the mesh's connectivity mode, the
//! mesh stores the list of adjacent elements (same-sized, coarser, or the
//! half-sized partners across a subface), referenced by local-or-ghost id.
//!

use crate::forest::*;
use crate::util::*;
use derivative::Derivative;
use more_asserts::{assert_le, assert_lt};
use serde::{Deserialize, Serialize};

/// one adjacency record returned by [`NeighborMesh::get_neighbors`]
///
/// The encoding carries how the two elements meet across the shared interface.
/// Its one contract consumed here: the encoding is negative if and only if the
/// neighbor is a half-sized partner, i.e. one refinement level finer than the
/// element whose neighborhood was queried. Consumers must go through
/// [`MeshNeighbor::is_half_size`] instead of testing the sign themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshNeighbor {
    /// local id in `[0, L)` for owned neighbors, `[L, L+G)` for ghosts
    pub qid: Locidx,
    /// mesh encoding of the adjacency, negative iff half-sized
    pub encoding: Locidx,
}

impl MeshNeighbor {
    pub fn new(qid: Locidx, encoding: Locidx) -> Self {
        Self { qid, encoding }
    }

    /// whether the neighbor is one level finer than the queried element
    pub fn is_half_size(&self) -> bool {
        self.encoding < 0
    }
}

/// adjacency of all owned elements, plus the parallel-boundary and mirror
/// bookkeeping the augmentation reads
#[derive(Derivative, Clone, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct NeighborMesh {
    pub dimension: Dimension,
    /// connectivity mode the adjacency was built for; augmentations may use
    /// any mode `<=` this one
    pub btype: ConnectType,
    pub local_num_quadrants: Locidx,
    pub ghost_num_quadrants: Locidx,
    /// per (qid, dir) adjacency lists, flattened as `qid * num_directions + dir`
    #[derivative(Debug = "ignore")]
    neighbors: Vec<Vec<MeshNeighbor>>,
    /// `-1` = strictly interior, anything else = the element touches at least
    /// one remote rank; `None` if the mesh was built without this array
    #[derivative(Debug = "ignore")]
    pub parallel_boundary: Option<Vec<Locidx>>,
    /// owner rank of each ghost
    #[derivative(Debug = "ignore")]
    pub ghost_to_proc: Vec<Rank>,
    /// local qid of each mirror slot; `ghost.mirror_proc_offsets` delimits the
    /// slots per destination rank
    #[derivative(Debug = "ignore")]
    pub mirror_qid: Vec<Locidx>,
}

impl NeighborMesh {
    /// create a mesh with empty adjacency; neighbors are filled afterwards
    /// with [`Self::push_neighbor`]
    pub fn new(dimension: Dimension, btype: ConnectType, local_num_quadrants: Locidx, ghost_num_quadrants: Locidx) -> Self {
        let num_directions = btype.num_directions(dimension);
        Self {
            dimension,
            btype,
            local_num_quadrants,
            ghost_num_quadrants,
            neighbors: vec![vec![]; local_num_quadrants as usize * num_directions],
            parallel_boundary: None,
            ghost_to_proc: vec![],
            mirror_qid: vec![],
        }
    }

    /// number of neighbor directions stored per element
    pub fn num_directions(&self) -> usize {
        self.btype.num_directions(self.dimension)
    }

    pub fn push_neighbor(&mut self, qid: Locidx, dir: usize, neighbor: MeshNeighbor) {
        assert_lt!(dir, self.num_directions(), "direction out of range for qid {}", qid);
        assert!(
            0 <= neighbor.qid && neighbor.qid < self.local_num_quadrants + self.ghost_num_quadrants,
            "neighbor id {} of qid {} dir {} outside [0, L+G)",
            neighbor.qid,
            qid,
            dir
        );
        let num_directions = self.num_directions();
        self.neighbors[qid as usize * num_directions + dir].push(neighbor);
    }

    /// all neighbors of `qid` in direction `dir`, in the order the mesh was
    /// built; every numerical neighbor appears exactly once across all
    /// directions of the connectivity mode
    pub fn get_neighbors(&self, qid: Locidx, dir: usize) -> &[MeshNeighbor] {
        &self.neighbors[qid as usize * self.num_directions() + dir]
    }

    /// resolve a local-or-ghost id to the refinement level of that element
    pub fn level_of(&self, forest: &Forest, ghost: &Ghost, qid: Locidx) -> Level {
        if qid < self.local_num_quadrants {
            forest.quadrants[qid as usize].level
        } else {
            ghost.level(qid - self.local_num_quadrants)
        }
    }

    /// whether `qid` must be classified in boundary mode; meshes without a
    /// parallel_boundary array treat every element as boundary
    pub fn is_parallel_boundary(&self, qid: Locidx) -> bool {
        match &self.parallel_boundary {
            Some(parallel_boundary) => parallel_boundary[qid as usize] != -1,
            None => true,
        }
    }

    /// validate array lengths and id ranges; call before building on top of a
    /// caller-supplied mesh to get a debuggable failure instead of silently
    /// corrupt tables
    pub fn sanity_check(&self, forest: &Forest, ghost: &Ghost) -> Result<(), String> {
        let lq = self.local_num_quadrants;
        let gq = self.ghost_num_quadrants;
        if forest.local_num_quadrants() != lq {
            return Err(format!("forest has {} local quadrants, mesh expects {}", forest.local_num_quadrants(), lq));
        }
        if ghost.num_ghosts() != gq {
            return Err(format!("ghost layer has {} quadrants, mesh expects {}", ghost.num_ghosts(), gq));
        }
        if self.neighbors.len() != lq as usize * self.num_directions() {
            return Err(format!(
                "adjacency has {} lists, expected {} quadrants x {} directions",
                self.neighbors.len(),
                lq,
                self.num_directions()
            ));
        }
        for (flat, list) in self.neighbors.iter().enumerate() {
            for neighbor in list.iter() {
                if neighbor.qid < 0 || neighbor.qid >= lq + gq {
                    return Err(format!(
                        "neighbor id {} of qid {} outside [0, {})",
                        neighbor.qid,
                        flat / self.num_directions(),
                        lq + gq
                    ));
                }
            }
        }
        if let Some(parallel_boundary) = &self.parallel_boundary {
            if parallel_boundary.len() != lq as usize {
                return Err(format!("parallel_boundary has {} entries, expected {}", parallel_boundary.len(), lq));
            }
        }
        if self.ghost_to_proc.len() != gq as usize {
            return Err(format!("ghost_to_proc has {} entries, expected {}", self.ghost_to_proc.len(), gq));
        }
        for &rank in self.ghost_to_proc.iter() {
            if rank < 0 || rank >= forest.mpisize {
                return Err(format!("ghost owner rank {} outside [0, {})", rank, forest.mpisize));
            }
        }
        for &qid in self.mirror_qid.iter() {
            if qid < 0 || qid >= lq {
                return Err(format!("mirror qid {} outside [0, {})", qid, lq));
            }
        }
        Ok(())
    }
}

/// guard used by builders on top of an existing mesh: the effective
/// connectivity must not inspect directions the mesh never stored
pub fn assert_btype_within(btype: ConnectType, mesh: &NeighborMesh) {
    assert_le!(btype, mesh.btype, "connectivity {:?} exceeds the mesh's {:?}", btype, mesh.btype);
}
