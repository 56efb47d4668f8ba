//! Example Forests
//!
//! Structured refinement fixtures for tests and debugging. A fixture holds
//! the global leaf set of a single-tree forest on a dyadic grid, supports
//! refinement, 2:1 re-balancing and contiguous partitioning, and extracts the
//! per-rank `(Forest, Ghost, NeighborMesh)` snapshots the augmentation is
//! built from, including ghost layers, mirror lists and parallel-boundary
//! arrays. These fixtures favor clarity over speed; they are not meant to
//! stand in for a production mesh builder.
//!

use crate::forest::*;
use crate::mesh::*;
use crate::util::*;
use hashbrown::HashMap;
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// deepest level a fixture leaf may take; bounds the Morton key to 48 bits
pub const FIXTURE_MAX_LEVEL: Level = 16;

/* *INDENT-OFF* */
/// canonical neighbor direction offsets of a quadtree leaf:
/// 4 faces, then 4 corners
const DIRECTIONS_2D: [[i64; 3]; 8] = [
    [-1,  0, 0], [ 1,  0, 0], [ 0, -1, 0], [ 0,  1, 0],
    [-1, -1, 0], [ 1, -1, 0], [-1,  1, 0], [ 1,  1, 0],
];

/// canonical neighbor direction offsets of an octree leaf:
/// 6 faces, then 12 edges grouped by axis, then 8 corners
const DIRECTIONS_3D: [[i64; 3]; 26] = [
    [-1,  0,  0], [ 1,  0,  0], [ 0, -1,  0], [ 0,  1,  0], [ 0,  0, -1], [ 0,  0,  1],
    [ 0, -1, -1], [ 0,  1, -1], [ 0, -1,  1], [ 0,  1,  1],
    [-1,  0, -1], [ 1,  0, -1], [-1,  0,  1], [ 1,  0,  1],
    [-1, -1,  0], [ 1, -1,  0], [-1,  1,  0], [ 1,  1,  0],
    [-1, -1, -1], [ 1, -1, -1], [-1,  1, -1], [ 1,  1, -1],
    [-1, -1,  1], [ 1, -1,  1], [-1,  1,  1], [ 1,  1,  1],
];
/* *INDENT-ON* */

/// all neighbor directions of the dimension, canonical order
pub fn direction_offsets(dimension: Dimension) -> &'static [[i64; 3]] {
    match dimension {
        Dimension::Two => &DIRECTIONS_2D,
        Dimension::Three => &DIRECTIONS_3D,
    }
}

/// index of the direction whose offset is the negation of `dir`'s
pub fn opposite_direction(dimension: Dimension, dir: usize) -> usize {
    let offsets = direction_offsets(dimension);
    let target = [-offsets[dir][0], -offsets[dir][1], -offsets[dir][2]];
    offsets
        .iter()
        .position(|&offset| offset == target)
        .expect("every direction has an opposite")
}

/// one leaf of the fixture forest, anchored at `pos` in `[0, 2^level)^dim`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExampleLeaf {
    pub level: Level,
    pub pos: [u32; 3],
}

impl ExampleLeaf {
    /// z-order key on the common finest grid; orders disjoint leaves the same
    /// way a depth-first tree traversal would
    pub fn morton_key(&self, dimension: Dimension) -> u64 {
        let dims = match dimension {
            Dimension::Two => 2u64,
            Dimension::Three => 3u64,
        };
        let shift = (FIXTURE_MAX_LEVEL - self.level) as u32;
        let mut key = 0u64;
        for bit in 0..FIXTURE_MAX_LEVEL as u64 {
            for (axis, &coordinate) in self.pos.iter().enumerate().take(dims as usize) {
                let scaled = (coordinate as u64) << shift;
                key |= ((scaled >> bit) & 1) << (bit * dims + axis as u64);
            }
        }
        key
    }
}

/// global description of a refined, partitioned fixture forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleForest {
    pub dimension: Dimension,
    /// all leaves across all ranks, in Morton order
    pub leaves: Vec<ExampleLeaf>,
    /// owner rank per leaf; reset to a single rank by refinement, so
    /// partition after all refinement is done
    pub partition: Vec<Rank>,
    pub mpisize: Rank,
}

impl ExampleForest {
    /// uniform refinement of the unit square / cube to `level`
    pub fn new_uniform(dimension: Dimension, level: Level) -> Self {
        assert!(level <= FIXTURE_MAX_LEVEL);
        let side = 1u32 << level;
        let leaves: Vec<ExampleLeaf> = match dimension {
            Dimension::Two => (0..side)
                .cartesian_product(0..side)
                .map(|(x, y)| ExampleLeaf { level, pos: [x, y, 0] })
                .collect(),
            Dimension::Three => (0..side)
                .cartesian_product(0..side)
                .cartesian_product(0..side)
                .map(|((x, y), z)| ExampleLeaf { level, pos: [x, y, z] })
                .collect(),
        };
        let mut example = Self {
            dimension,
            partition: vec![0; leaves.len()],
            leaves,
            mpisize: 1,
        };
        example.sort_leaves();
        example
    }

    /// a randomly refined, re-balanced forest; deterministic per seed
    pub fn random_refined(dimension: Dimension, base_level: Level, refine_rounds: usize, seed: u64) -> Self {
        let mut example = Self::new_uniform(dimension, base_level);
        let mut rng = DeterministicRng::seed_from_u64(seed);
        for _ in 0..refine_rounds {
            let index = rng.gen_range(0..example.leaves.len());
            if example.leaves[index].level < base_level + 3 {
                example.refine(index);
            }
        }
        example.balance(ConnectType::Full);
        example
    }

    fn sort_leaves(&mut self) {
        let dimension = self.dimension;
        self.leaves.sort_by_key(|leaf| leaf.morton_key(dimension));
    }

    /// index of the leaf with exactly this level and anchor, if it exists
    pub fn leaf_index_of(&self, level: Level, pos: [u32; 3]) -> Option<usize> {
        self.leaves.iter().position(|leaf| leaf.level == level && leaf.pos == pos)
    }

    /// replace the leaf at `index` with its children
    pub fn refine(&mut self, index: usize) {
        let leaf = self.leaves.remove(index);
        assert!(leaf.level < FIXTURE_MAX_LEVEL, "cannot refine past the fixture's maximum level");
        for child in 0..self.dimension.children() {
            let mut pos = [0u32; 3];
            for (axis, coordinate) in pos.iter_mut().enumerate() {
                *coordinate = leaf.pos[axis] * 2 + ((child >> axis) & 1) as u32;
            }
            if self.dimension == Dimension::Two {
                pos[2] = 0;
            }
            self.leaves.push(ExampleLeaf {
                level: leaf.level + 1,
                pos,
            });
        }
        self.sort_leaves();
        self.partition = vec![0; self.leaves.len()];
        self.mpisize = 1;
    }

    /// refine until no neighbor pair under `btype` differs by more than one
    /// level
    pub fn balance(&mut self, btype: ConnectType) {
        let num_directions = btype.num_directions(self.dimension);
        loop {
            let map = self.leaf_map();
            let mut refine_index = None;
            'search: for index in 0..self.leaves.len() {
                for dir in 0..num_directions {
                    for (neighbor, _) in self.find_neighbors(&map, index, dir) {
                        if self.leaves[neighbor].level > self.leaves[index].level + 1 {
                            refine_index = Some(index);
                            break 'search;
                        }
                    }
                }
            }
            match refine_index {
                Some(index) => self.refine(index),
                None => return,
            }
        }
    }

    /// split leaves into `mpisize` contiguous, near-equal ranges
    pub fn partition_contiguous(&mut self, mpisize: Rank) {
        assert!(mpisize >= 1);
        let num_leaves = self.leaves.len();
        self.partition = (0..num_leaves).map(|index| (index * mpisize as usize / num_leaves) as Rank).collect();
        self.mpisize = mpisize;
    }

    /// split leaves at explicit indices: rank p owns `splits[p-1]..splits[p]`
    pub fn partition_at(&mut self, splits: &[usize]) {
        self.partition = (0..self.leaves.len())
            .map(|index| splits.iter().filter(|&&split| split <= index).count() as Rank)
            .collect();
        self.mpisize = splits.len() as Rank + 1;
    }

    fn leaf_map(&self) -> HashMap<(Level, [u32; 3]), usize> {
        self.leaves
            .iter()
            .enumerate()
            .map(|(index, leaf)| ((leaf.level, leaf.pos), index))
            .collect()
    }

    /// all leaves adjacent to `index` in direction `dir`, as
    /// `(leaf index, half_sized)`; finer partners come in child order
    fn find_neighbors(&self, map: &HashMap<(Level, [u32; 3]), usize>, index: usize, dir: usize) -> Vec<(usize, bool)> {
        let leaf = &self.leaves[index];
        let offsets = direction_offsets(self.dimension)[dir];
        let side = 1i64 << leaf.level;
        let mut target = [0u32; 3];
        for (axis, coordinate) in target.iter_mut().enumerate() {
            let shifted = leaf.pos[axis] as i64 + offsets[axis];
            if shifted < 0 || (offsets[axis] != 0 && shifted >= side) {
                // the domain is not periodic; leaves at its boundary simply
                // have no neighbor in outward directions
                return vec![];
            }
            *coordinate = shifted as u32;
        }
        if let Some(&neighbor) = map.get(&(leaf.level, target)) {
            return vec![(neighbor, false)];
        }
        let mut level = leaf.level;
        let mut cell = target;
        while level > 0 {
            level -= 1;
            cell = [cell[0] >> 1, cell[1] >> 1, cell[2] >> 1];
            if let Some(&neighbor) = map.get(&(level, cell)) {
                // a coarser leaf is a corner/edge neighbor only if the shared
                // corner/edge of the querying leaf lies on a corner/edge of
                // the coarser leaf as well; hanging corners have no neighbor
                // entry of their own (the face entry already covers the pair)
                let mask = (1u32 << (leaf.level - level)) - 1;
                let aligned = (0..3).all(|axis| match offsets[axis] {
                    1 => target[axis] & mask == 0,
                    -1 => target[axis] & mask == mask,
                    _ => true,
                });
                return if aligned { vec![(neighbor, false)] } else { vec![] };
            }
        }
        let mut finer = vec![];
        self.collect_finer(map, leaf.level, target, &offsets, &mut finer);
        finer
    }

    /// descend into the refined cell `cell`, keeping only descendants that
    /// touch the interface back toward the querying leaf
    fn collect_finer(
        &self,
        map: &HashMap<(Level, [u32; 3]), usize>,
        level: Level,
        cell: [u32; 3],
        offsets: &[i64; 3],
        finer: &mut Vec<(usize, bool)>,
    ) {
        if level >= FIXTURE_MAX_LEVEL {
            return;
        }
        for child in 0..self.dimension.children() {
            let mut touching = true;
            let mut pos = [0u32; 3];
            for (axis, coordinate) in pos.iter_mut().enumerate() {
                let bit = ((child >> axis) & 1) as u32;
                // a child faces the querying leaf when it lies on the side of
                // `cell` the offset came in from
                match offsets[axis] {
                    -1 if bit != 1 => touching = false,
                    1 if bit != 0 => touching = false,
                    _ => {}
                }
                *coordinate = cell[axis] * 2 + bit;
            }
            if self.dimension == Dimension::Two {
                pos[2] = 0;
            }
            if !touching {
                continue;
            }
            if let Some(&neighbor) = map.get(&(level + 1, pos)) {
                finer.push((neighbor, true));
            } else {
                self.collect_finer(map, level + 1, pos, offsets, finer);
            }
        }
    }

    /// the single-rank view; for partitioned fixtures use [`Self::build_rank`]
    pub fn build(&self, mesh_btype: ConnectType) -> (Forest, Ghost, NeighborMesh) {
        self.build_rank(0, mesh_btype, true)
    }

    /// extract the snapshot triple a given rank would hold: its owned leaves,
    /// the ghost layer sorted by (owner, Morton), and the adjacency mesh with
    /// mirror bookkeeping; `with_parallel_boundary` controls whether the mesh
    /// carries the interior-mode optimization array
    pub fn build_rank(&self, rank: Rank, mesh_btype: ConnectType, with_parallel_boundary: bool) -> (Forest, Ghost, NeighborMesh) {
        assert!(0 <= rank && rank < self.mpisize);
        let map = self.leaf_map();
        let num_directions = mesh_btype.num_directions(self.dimension);
        let locals: Vec<usize> = (0..self.leaves.len()).filter(|&index| self.partition[index] == rank).collect();
        let local_qid: HashMap<usize, Locidx> = locals.iter().enumerate().map(|(qid, &index)| (index, qid as Locidx)).collect();
        let lq = locals.len() as Locidx;

        // adjacency in global leaf indices, then the ghost layer it implies
        let adjacency: Vec<Vec<Vec<(usize, bool)>>> = locals
            .iter()
            .map(|&index| (0..num_directions).map(|dir| self.find_neighbors(&map, index, dir)).collect())
            .collect();
        let remote: BTreeSet<usize> = adjacency
            .iter()
            .flatten()
            .flatten()
            .map(|&(neighbor, _)| neighbor)
            .filter(|&neighbor| self.partition[neighbor] != rank)
            .collect();
        let mut ghost_leaves: Vec<usize> = remote.into_iter().collect();
        ghost_leaves.sort_by_key(|&index| (self.partition[index], self.leaves[index].morton_key(self.dimension)));
        let ghost_gqid: HashMap<usize, Locidx> = ghost_leaves
            .iter()
            .enumerate()
            .map(|(gqid, &index)| (index, lq + gqid as Locidx))
            .collect();

        // mirrors: owned leaves adjacent to each remote rank, ascending qid
        let mut mirrors_per_rank: Vec<BTreeSet<Locidx>> = vec![BTreeSet::new(); self.mpisize as usize];
        for (qid, per_direction) in adjacency.iter().enumerate() {
            for list in per_direction.iter() {
                for &(neighbor, _) in list.iter() {
                    let owner = self.partition[neighbor];
                    if owner != rank {
                        mirrors_per_rank[owner as usize].insert(qid as Locidx);
                    }
                }
            }
        }
        let mut mirror_proc_offsets = vec![0 as Locidx];
        let mut mirror_qid = vec![];
        for mirrors in mirrors_per_rank.iter() {
            mirror_qid.extend(mirrors.iter().copied());
            mirror_proc_offsets.push(mirror_qid.len() as Locidx);
        }

        let forest = Forest::new(
            self.dimension,
            locals.iter().map(|&index| Quadrant::new(self.leaves[index].level, 0)).collect(),
            self.mpisize,
            rank,
        );
        let ghost = Ghost::new(
            ghost_leaves.iter().map(|&index| Quadrant::new(self.leaves[index].level, 0)).collect(),
            mirror_proc_offsets,
        );

        let mut mesh = NeighborMesh::new(self.dimension, mesh_btype, lq, ghost.num_ghosts());
        let mut parallel_boundary = vec![-1 as Locidx; lq as usize];
        for (qid, per_direction) in adjacency.iter().enumerate() {
            let level = self.leaves[locals[qid]].level;
            for (dir, list) in per_direction.iter().enumerate() {
                let opposite = opposite_direction(self.dimension, dir) as Locidx;
                for &(neighbor, half_sized) in list.iter() {
                    let neighbor_qid = match local_qid.get(&neighbor) {
                        Some(&local) => local,
                        None => {
                            parallel_boundary[qid] = self.partition[neighbor] as Locidx;
                            ghost_gqid[&neighbor]
                        }
                    };
                    let encoding = if half_sized {
                        -(opposite + 1)
                    } else if self.leaves[neighbor].level < level {
                        num_directions as Locidx + opposite
                    } else {
                        opposite
                    };
                    mesh.push_neighbor(qid as Locidx, dir, MeshNeighbor::new(neighbor_qid, encoding));
                }
            }
        }
        mesh.ghost_to_proc = ghost_leaves.iter().map(|&index| self.partition[index]).collect();
        mesh.mirror_qid = mirror_qid;
        if with_parallel_boundary {
            mesh.parallel_boundary = Some(parallel_boundary);
        }
        mesh.sanity_check(&forest, &ghost).unwrap();
        (forest, ghost, mesh)
    }
}
