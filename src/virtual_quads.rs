//! Virtual Quadrants
//!
//! Decides for every locally owned element whether it must host virtual
//! (hallucinated) child elements, inserted solely so that every numerical
//! neighbor sees a partner at the same or coarser level, and builds the dense
//! per-level index tables that let stencil kernels iterate real plus virtual
//! elements with O(1) offset arithmetic. Ghost elements that a neighboring
//! rank refines past are marked as virtual hosts as a side effect and
//! renumbered densely in a second pass.
//!

use crate::forest::*;
use crate::mesh::*;
use crate::util::*;
use crate::visualize::*;
use derivative::Derivative;
use serde::{Deserialize, Serialize};

/// absent marker in packed flag and offset arrays
pub const ABSENT: Locidx = -1;

/* *INDENT-OFF* */
/// In-host neighbor table for the four virtual children of a 2D host: entry
/// `[child][face]` is the neighbor slot of that virtual child across that
/// face, in the extended numbering 0..16 where 0-3 are the virtual siblings,
/// 4-11 are the face-exit slots (`4 + face + 4 * index_along_face`), and
/// 12-15 are the corner-exit slots (`12 + corner`).
pub const FACE_VIRTUAL_NEIGHBORS_INSIDE: [[usize; 4]; 4] = [
    [4, 1, 6, 2],
    [0, 5, 10, 3],
    [8, 3, 0, 7],
    [2, 9, 1, 11],
];

/// companion to [`FACE_VIRTUAL_NEIGHBORS_INSIDE`] for corner directions:
/// entry `[child][corner]` in the same extended numbering
pub const CORNER_VIRTUAL_NEIGHBORS_INSIDE: [[usize; 4]; 4] = [
    [12, 10, 8, 3],
    [6, 13, 2, 9],
    [4, 1, 14, 11],
    [0, 5, 7, 15],
];
/* *INDENT-ON* */

/// dense per-level layout of real and virtual elements; each virtual host
/// owns a block of `CHILDREN` slots at the next level immediately after its
/// own real slot, which is the single interleaving contract
/// `real + CHILDREN * virt` downstream kernels rely on
#[derive(Derivative, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct LevelLayout {
    /// slot of each owned element among the reals of its level; always set
    #[derivative(Debug = "ignore")]
    pub qreal_offset: Vec<Locidx>,
    /// slot of the first virtual child of each owned host at level+1;
    /// `ABSENT` for non-hosts
    #[derivative(Debug = "ignore")]
    pub qvirtual_offset: Vec<Locidx>,
    /// as `qreal_offset`, for ghosts
    #[derivative(Debug = "ignore")]
    pub greal_offset: Vec<Locidx>,
    /// as `qvirtual_offset`, for ghosts
    #[derivative(Debug = "ignore")]
    pub gvirtual_offset: Vec<Locidx>,
    /// per level, the ascending qids of owned elements hosting virtuals at
    /// that level (the host itself lives one level coarser)
    #[derivative(Debug = "ignore")]
    pub qlevels: Vec<Vec<Locidx>>,
    /// as `qlevels`, for ghosts
    #[derivative(Debug = "ignore")]
    pub glevels: Vec<Vec<Locidx>>,
}

impl LevelLayout {
    fn new(local_num_quadrants: Locidx, ghost_num_quadrants: Locidx, max_level: Level) -> Self {
        let num_levels = max_level as usize + 1;
        Self {
            qreal_offset: vec![ABSENT; local_num_quadrants as usize],
            qvirtual_offset: vec![ABSENT; local_num_quadrants as usize],
            greal_offset: vec![ABSENT; ghost_num_quadrants as usize],
            gvirtual_offset: vec![ABSENT; ghost_num_quadrants as usize],
            qlevels: vec![vec![]; num_levels],
            glevels: vec![vec![]; num_levels],
        }
    }

    fn shrink_to_fit(&mut self) {
        for list in self.qlevels.iter_mut().chain(self.glevels.iter_mut()) {
            list.shrink_to_fit();
        }
    }
}

/// the virtual-quadrant augmentation of a balanced, partitioned forest;
/// immutable after construction and destroyed before any of its inputs change
#[derive(Derivative, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct VirtualQuads {
    /// effective connectivity mode, `<=` the mesh's
    pub btype: ConnectType,
    pub dimension: Dimension,
    pub local_num_quadrants: Locidx,
    pub ghost_num_quadrants: Locidx,
    /// packed host flags for owned elements: `ABSENT` = no virtuals, any
    /// other value = hosts virtuals (the token itself carries no meaning)
    #[derivative(Debug = "ignore")]
    qflags: Vec<Locidx>,
    /// packed host flags for ghosts: `ABSENT` = no virtuals, otherwise the
    /// dense index of this ghost among all virtual-hosting ghosts
    #[derivative(Debug = "ignore")]
    gflags: Vec<Locidx>,
    /// present iff the augmentation was built with `compute_level_lists`
    pub level_layout: Option<LevelLayout>,
}

impl VirtualQuads {
    /// build the augmentation without the per-level layout
    pub fn new(forest: &Forest, ghost: &Ghost, mesh: &NeighborMesh, btype: ConnectType) -> Self {
        Self::new_ext(forest, ghost, mesh, btype, false)
    }

    /// build the augmentation; with `compute_level_lists` the dense per-level
    /// offsets and per-level host lists are materialized as well
    pub fn new_ext(forest: &Forest, ghost: &Ghost, mesh: &NeighborMesh, btype: ConnectType, compute_level_lists: bool) -> Self {
        // the structure would be silently wrong on ill-formed input, so every
        // precondition failure is fatal
        mesh.sanity_check(forest, ghost).unwrap();
        ghost.sanity_check(forest.mpisize).unwrap();
        assert_btype_within(btype, mesh);
        let max_level = forest.dimension.max_level();
        for (qid, quadrant) in forest.quadrants.iter().enumerate() {
            assert!(quadrant.level <= max_level, "quadrant {} at level {} exceeds max level {}", qid, quadrant.level, max_level);
        }
        assert!(
            forest.is_balanced(ghost, mesh, btype),
            "forest is not 2:1 balanced under {:?}",
            btype
        );

        let local_num_quadrants = forest.local_num_quadrants();
        let ghost_num_quadrants = ghost.num_ghosts();
        let mut virtual_quads = VirtualQuads {
            btype,
            dimension: forest.dimension,
            local_num_quadrants,
            ghost_num_quadrants,
            qflags: vec![ABSENT; local_num_quadrants as usize],
            gflags: vec![ABSENT; ghost_num_quadrants as usize],
            level_layout: compute_level_lists.then(|| LevelLayout::new(local_num_quadrants, ghost_num_quadrants, max_level)),
        };

        let mut pass = ClassifyPass::new(forest, ghost, mesh, &mut virtual_quads);
        for qid in 0..local_num_quadrants {
            if mesh.is_parallel_boundary(qid) {
                pass.classify_boundary(qid);
            } else {
                pass.classify_interior(qid);
            }
        }
        pass.scan_ghosts();

        if let Some(level_layout) = virtual_quads.level_layout.as_mut() {
            level_layout.shrink_to_fit();
        }
        virtual_quads
    }

    /// host flag of an owned element: `Some(token)` iff the element has at
    /// least one strictly finer numerical neighbor; the token value is not
    /// meaningful, only its presence
    pub fn qflag(&self, qid: Locidx) -> Option<Locidx> {
        let flag = self.qflags[qid as usize];
        (flag != ABSENT).then_some(flag)
    }

    /// host flag of a ghost: `Some(index)` with the ghost's dense position
    /// among all virtual-hosting ghosts, or `None`
    pub fn gflag(&self, gqid: Locidx) -> Option<Locidx> {
        let flag = self.gflags[gqid as usize];
        (flag != ABSENT).then_some(flag)
    }

    pub fn has_virtuals(&self, qid: Locidx) -> bool {
        self.qflag(qid).is_some()
    }

    pub fn ghost_has_virtuals(&self, gqid: Locidx) -> bool {
        self.gflag(gqid).is_some()
    }

    /// packed flag array for owned elements, `ABSENT` = no virtuals
    pub fn qflags(&self) -> &[Locidx] {
        &self.qflags
    }

    /// packed flag array for ghosts, `ABSENT` = no virtuals
    pub fn gflags(&self) -> &[Locidx] {
        &self.gflags
    }

    /// bytes owned by this augmentation: flag arrays, optional offset arrays,
    /// optional per-level list storage, and the header
    pub fn memory_used(&self) -> usize {
        let lq = self.local_num_quadrants as usize;
        let gq = self.ghost_num_quadrants as usize;
        let mut total = std::mem::size_of::<VirtualQuads>();
        total += (lq + gq) * std::mem::size_of::<Locidx>();
        if let Some(level_layout) = &self.level_layout {
            total += 2 * (lq + gq) * std::mem::size_of::<Locidx>();
            total += 2 * std::mem::size_of::<Vec<Locidx>>() * (self.dimension.max_level() as usize + 1);
            for list in level_layout.qlevels.iter().chain(level_layout.glevels.iter()) {
                total += list.len() * std::mem::size_of::<Locidx>();
            }
        }
        total
    }
}

/// single sweep over owned elements (pass 1) and ghosts (pass 2), advancing
/// the per-level counters that define the dense interleaved layout
struct ClassifyPass<'a> {
    forest: &'a Forest,
    ghost: &'a Ghost,
    mesh: &'a NeighborMesh,
    virtual_quads: &'a mut VirtualQuads,
    num_directions: usize,
    /// rolling token for owned hosts; only its progression matters
    last_virtual: Locidx,
    lq_real: Vec<Locidx>,
    lq_virt: Vec<Locidx>,
    gq_real: Vec<Locidx>,
    gq_virt: Vec<Locidx>,
}

impl<'a> ClassifyPass<'a> {
    fn new(forest: &'a Forest, ghost: &'a Ghost, mesh: &'a NeighborMesh, virtual_quads: &'a mut VirtualQuads) -> Self {
        let num_levels = forest.dimension.max_level() as usize + 1;
        let num_directions = virtual_quads.btype.num_directions(forest.dimension);
        Self {
            forest,
            ghost,
            mesh,
            virtual_quads,
            num_directions,
            last_virtual: ABSENT,
            lq_real: vec![0; num_levels],
            lq_virt: vec![0; num_levels],
            gq_real: vec![0; num_levels],
            gq_virt: vec![0; num_levels],
        }
    }

    /// classification for elements that provably border no ghost: stop at the
    /// first finer neighbor, ghost flags are untouched
    fn classify_interior(&mut self, qid: Locidx) {
        let level = self.forest.quadrants[qid as usize].level;
        let mut has_virtuals = false;
        'directions: for dir in 0..self.num_directions {
            for neighbor in self.mesh.get_neighbors(qid, dir) {
                if self.mesh.level_of(self.forest, self.ghost, neighbor.qid) > level {
                    has_virtuals = true;
                    break 'directions;
                }
            }
        }
        self.record_owned(qid, level, has_virtuals);
    }

    /// classification for elements at the parallel boundary (or all elements
    /// if the mesh carries no parallel_boundary array): the full direction
    /// range is traversed because this pass alone marks coarser ghosts
    fn classify_boundary(&mut self, qid: Locidx) {
        let level = self.forest.quadrants[qid as usize].level;
        let lq = self.virtual_quads.local_num_quadrants;
        let gq = self.virtual_quads.ghost_num_quadrants;
        let mut has_virtuals = false;
        for dir in 0..self.num_directions {
            for neighbor in self.mesh.get_neighbors(qid, dir) {
                let neighbor_level = self.mesh.level_of(self.forest, self.ghost, neighbor.qid);
                if neighbor_level > level {
                    has_virtuals = true;
                } else if lq <= neighbor.qid && neighbor.qid < lq + gq && neighbor_level < level {
                    // marker only; renumbered densely in the ghost scan
                    self.virtual_quads.gflags[(neighbor.qid - lq) as usize] = 1;
                }
            }
        }
        self.record_owned(qid, level, has_virtuals);
    }

    /// offset bookkeeping shared by both modes; runs after the per-element
    /// decision so that interior and boundary mode agree on every offset
    fn record_owned(&mut self, qid: Locidx, level: Level, has_virtuals: bool) {
        let children = self.forest.dimension.children() as Locidx;
        let level = level as usize;
        if let Some(level_layout) = self.virtual_quads.level_layout.as_mut() {
            level_layout.qreal_offset[qid as usize] = self.lq_real[level] + children * self.lq_virt[level];
            self.lq_real[level] += 1;
        }
        if has_virtuals {
            self.last_virtual += 1;
            self.virtual_quads.qflags[qid as usize] = self.last_virtual;
            if let Some(level_layout) = self.virtual_quads.level_layout.as_mut() {
                level_layout.qvirtual_offset[qid as usize] = self.lq_real[level + 1] + children * self.lq_virt[level + 1];
                self.lq_virt[level + 1] += 1;
                level_layout.qlevels[level + 1].push(qid);
            }
        }
    }

    /// pass 2: rewrite marked ghost flags to consecutive indices and extend
    /// the level layout over the ghost side, gqid ascending
    fn scan_ghosts(&mut self) {
        let children = self.forest.dimension.children() as Locidx;
        let mut next_virtual: Locidx = 0;
        for gqid in 0..self.virtual_quads.ghost_num_quadrants {
            let level = self.ghost.level(gqid) as usize;
            if let Some(level_layout) = self.virtual_quads.level_layout.as_mut() {
                level_layout.greal_offset[gqid as usize] = self.gq_real[level] + children * self.gq_virt[level];
                self.gq_real[level] += 1;
            }
            if self.virtual_quads.gflags[gqid as usize] != ABSENT {
                self.virtual_quads.gflags[gqid as usize] = next_virtual;
                next_virtual += 1;
                if let Some(level_layout) = self.virtual_quads.level_layout.as_mut() {
                    level_layout.gvirtual_offset[gqid as usize] = self.gq_real[level + 1] + children * self.gq_virt[level + 1];
                    self.gq_virt[level + 1] += 1;
                    level_layout.glevels[level + 1].push(gqid);
                }
            }
        }
    }
}

impl ForestVisualizer for VirtualQuads {
    fn snapshot(&self, abbrev: bool) -> serde_json::Value {
        let mut value = json!({
            if abbrev { "qf" } else { "qflags" }: &self.qflags,
            if abbrev { "gf" } else { "gflags" }: &self.gflags,
        });
        if let Some(level_layout) = &self.level_layout {
            let layout = json!({
                if abbrev { "qr" } else { "qreal_offset" }: &level_layout.qreal_offset,
                if abbrev { "qv" } else { "qvirtual_offset" }: &level_layout.qvirtual_offset,
                if abbrev { "gr" } else { "greal_offset" }: &level_layout.greal_offset,
                if abbrev { "gv" } else { "gvirtual_offset" }: &level_layout.gvirtual_offset,
            });
            value.as_object_mut().unwrap().insert(if abbrev { "ll" } else { "level_layout" }.to_string(), layout);
        }
        value
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::example_forests::*;
    use crate::visualize::*;
    use test_case::test_case;

    /// brute-force re-derivation of every documented invariant straight from
    /// the mesh, shared by the randomized property tests
    pub fn check_invariants(forest: &Forest, ghost: &Ghost, mesh: &NeighborMesh, virtual_quads: &VirtualQuads) {
        let lq = forest.local_num_quadrants();
        let gq = ghost.num_ghosts();
        let children = forest.dimension.children() as Locidx;
        let num_directions = virtual_quads.btype.num_directions(forest.dimension);
        // flags are local and complete
        for qid in 0..lq {
            let level = forest.quadrants[qid as usize].level;
            let expects_virtuals = (0..num_directions).any(|dir| {
                mesh.get_neighbors(qid, dir)
                    .iter()
                    .any(|neighbor| mesh.level_of(forest, ghost, neighbor.qid) > level)
            });
            assert_eq!(virtual_quads.has_virtuals(qid), expects_virtuals, "qflags[{}] disagrees with the mesh", qid);
        }
        // ghost marking symmetry
        for gqid in 0..gq {
            let expects_virtuals = (0..lq).any(|qid| {
                let level = forest.quadrants[qid as usize].level;
                (0..num_directions).any(|dir| {
                    mesh.get_neighbors(qid, dir)
                        .iter()
                        .any(|neighbor| neighbor.qid == lq + gqid && ghost.level(gqid) < level)
                })
            });
            assert_eq!(virtual_quads.ghost_has_virtuals(gqid), expects_virtuals, "gflags[{}] disagrees with the mesh", gqid);
        }
        let Some(level_layout) = &virtual_quads.level_layout else {
            return;
        };
        // offset formula, owned side
        for qid in 0..lq {
            let level = forest.quadrants[qid as usize].level;
            let reals_before = (0..qid).filter(|&q| forest.quadrants[q as usize].level == level).count() as Locidx;
            let hosts_before = (0..qid)
                .filter(|&q| virtual_quads.has_virtuals(q) && forest.quadrants[q as usize].level + 1 == level)
                .count() as Locidx;
            assert_eq!(level_layout.qreal_offset[qid as usize], reals_before + children * hosts_before);
            if virtual_quads.has_virtuals(qid) {
                let reals_finer = (0..qid).filter(|&q| forest.quadrants[q as usize].level == level + 1).count() as Locidx;
                let hosts_same = (0..qid)
                    .filter(|&q| virtual_quads.has_virtuals(q) && forest.quadrants[q as usize].level == level)
                    .count() as Locidx;
                assert_eq!(level_layout.qvirtual_offset[qid as usize], reals_finer + children * hosts_same);
            } else {
                assert_eq!(level_layout.qvirtual_offset[qid as usize], ABSENT);
            }
        }
        // offset formula, ghost side
        for gqid in 0..gq {
            let level = ghost.level(gqid);
            let reals_before = (0..gqid).filter(|&g| ghost.level(g) == level).count() as Locidx;
            let hosts_before = (0..gqid)
                .filter(|&g| virtual_quads.ghost_has_virtuals(g) && ghost.level(g) + 1 == level)
                .count() as Locidx;
            assert_eq!(level_layout.greal_offset[gqid as usize], reals_before + children * hosts_before);
            if virtual_quads.ghost_has_virtuals(gqid) {
                let reals_finer = (0..gqid).filter(|&g| ghost.level(g) == level + 1).count() as Locidx;
                let hosts_same = (0..gqid)
                    .filter(|&g| virtual_quads.ghost_has_virtuals(g) && ghost.level(g) == level)
                    .count() as Locidx;
                assert_eq!(level_layout.gvirtual_offset[gqid as usize], reals_finer + children * hosts_same);
            } else {
                assert_eq!(level_layout.gvirtual_offset[gqid as usize], ABSENT);
            }
        }
        // level list faithfulness
        for target in 0..=forest.dimension.max_level() as usize {
            let expected: Vec<Locidx> = (0..lq)
                .filter(|&q| virtual_quads.has_virtuals(q) && forest.quadrants[q as usize].level as usize + 1 == target)
                .collect();
            assert_eq!(level_layout.qlevels[target], expected, "qlevels[{}] mismatch", target);
            let expected: Vec<Locidx> = (0..gq)
                .filter(|&g| virtual_quads.ghost_has_virtuals(g) && ghost.level(g) as usize + 1 == target)
                .collect();
            assert_eq!(level_layout.glevels[target], expected, "glevels[{}] mismatch", target);
        }
        // ghost flags are dense
        let mut expected_gflag = 0;
        for gqid in 0..gq {
            if let Some(index) = virtual_quads.gflag(gqid) {
                assert_eq!(index, expected_gflag);
                expected_gflag += 1;
            }
        }
    }

    /// recompute the memory accounting from array lengths (round trip of P6)
    fn expected_memory(virtual_quads: &VirtualQuads) -> usize {
        let lq = virtual_quads.local_num_quadrants as usize;
        let gq = virtual_quads.ghost_num_quadrants as usize;
        let locidx = std::mem::size_of::<Locidx>();
        let mut total = std::mem::size_of::<VirtualQuads>() + (lq + gq) * locidx;
        if let Some(level_layout) = &virtual_quads.level_layout {
            total += 2 * (lq + gq) * locidx;
            total += 2 * std::mem::size_of::<Vec<Locidx>>() * (virtual_quads.dimension.max_level() as usize + 1);
            for list in level_layout.qlevels.iter().chain(level_layout.glevels.iter()) {
                total += list.len() * locidx;
            }
        }
        total
    }

    #[test]
    fn uniform_unitsquare_no_virtuals() {
        // cargo test uniform_unitsquare_no_virtuals -- --nocapture
        let example = ExampleForest::new_uniform(Dimension::Two, 2);
        let (forest, ghost, mesh) = example.build(ConnectType::Face);
        let virtual_quads = VirtualQuads::new_ext(&forest, &ghost, &mesh, ConnectType::Face, true);
        println!("qflags: {:?}", virtual_quads.qflags());
        assert_eq!(virtual_quads.qflags(), vec![ABSENT; 16].as_slice());
        assert!(virtual_quads.gflags().is_empty());
        let level_layout = virtual_quads.level_layout.as_ref().unwrap();
        assert_eq!(level_layout.qreal_offset, (0..16).collect::<Vec<Locidx>>());
        assert_eq!(level_layout.qvirtual_offset, vec![ABSENT; 16]);
        for list in level_layout.qlevels.iter() {
            assert!(list.is_empty());
        }
        check_invariants(&forest, &ghost, &mesh, &virtual_quads);
    }

    #[test]
    fn center_refined_face_virtuals() {
        // cargo test center_refined_face_virtuals -- --nocapture
        // one level-2 quadrant refined to level 3; its four face neighbors
        // host virtuals, nothing else does
        let visualize_filename = "center_refined_face_virtuals.json".to_string();
        let mut example = ExampleForest::new_uniform(Dimension::Two, 2);
        example.refine(example.leaf_index_of(2, [1, 1, 0]).unwrap());
        let (forest, ghost, mesh) = example.build(ConnectType::Face);
        let virtual_quads = VirtualQuads::new_ext(&forest, &ghost, &mesh, ConnectType::Face, true);
        let mut visualizer = Visualizer::new(Some(visualize_data_folder() + visualize_filename.as_str())).unwrap();
        visualizer
            .snapshot_combined("augmentation".to_string(), vec![&forest, &virtual_quads])
            .unwrap();
        let hosts: Vec<Locidx> = (0..forest.local_num_quadrants()).filter(|&q| virtual_quads.has_virtuals(q)).collect();
        println!("hosts: {hosts:?}");
        assert_eq!(hosts, vec![1, 2, 9, 12]);
        let level_layout = virtual_quads.level_layout.as_ref().unwrap();
        assert_eq!(level_layout.qlevels[3], vec![1, 2, 9, 12]);
        // the four children of the refined quadrant sit at qids 3..7 and are
        // laid out after the two virtual blocks opened by qids 1 and 2
        assert_eq!(level_layout.qvirtual_offset[1], 0);
        assert_eq!(level_layout.qvirtual_offset[2], 4);
        assert_eq!(&level_layout.qreal_offset[3..7], &[8, 9, 10, 11]);
        assert_eq!(level_layout.qvirtual_offset[9], 12);
        assert_eq!(level_layout.qvirtual_offset[12], 16);
        check_invariants(&forest, &ghost, &mesh, &virtual_quads);
    }

    #[test]
    fn center_refined_full_virtuals() {
        // cargo test center_refined_full_virtuals -- --nocapture
        // same refinement pattern under full connectivity: the corner
        // neighbors host virtuals as well
        let mut example = ExampleForest::new_uniform(Dimension::Two, 2);
        example.refine(example.leaf_index_of(2, [1, 1, 0]).unwrap());
        let (forest, ghost, mesh) = example.build(ConnectType::Full);
        let virtual_quads = VirtualQuads::new_ext(&forest, &ghost, &mesh, ConnectType::Full, true);
        let hosts: Vec<Locidx> = (0..forest.local_num_quadrants()).filter(|&q| virtual_quads.has_virtuals(q)).collect();
        println!("hosts: {hosts:?}");
        assert_eq!(hosts, vec![0, 1, 2, 7, 9, 11, 12, 15]);
        let level_layout = virtual_quads.level_layout.as_ref().unwrap();
        assert_eq!(level_layout.qlevels[3].len(), 8);
        assert_eq!(level_layout.qlevels[3], hosts);
        check_invariants(&forest, &ghost, &mesh, &virtual_quads);
    }

    #[test]
    fn octree_edge_connect_virtuals() {
        // cargo test octree_edge_connect_virtuals -- --nocapture
        // an interior octant of a uniform level-2 octree is refined; under
        // edge connectivity its 6 face and 12 edge neighbors host virtuals
        // while the 8 corner neighbors stay untouched
        let mut example = ExampleForest::new_uniform(Dimension::Three, 2);
        example.refine(example.leaf_index_of(2, [1, 1, 1]).unwrap());
        let (forest, ghost, mesh) = example.build(ConnectType::Full);
        let virtual_quads = VirtualQuads::new_ext(&forest, &ghost, &mesh, ConnectType::Edge, true);
        let hosts: Vec<Locidx> = (0..forest.local_num_quadrants()).filter(|&q| virtual_quads.has_virtuals(q)).collect();
        println!("hosts: {hosts:?}");
        assert_eq!(hosts.len(), 18);
        for dx in -1i64..=1 {
            for dy in -1i64..=1 {
                for dz in -1i64..=1 {
                    let nonzero = [dx, dy, dz].iter().filter(|&&d| d != 0).count();
                    if nonzero == 0 {
                        continue;
                    }
                    let pos = [(1 + dx) as u32, (1 + dy) as u32, (1 + dz) as u32];
                    let qid = example.leaf_index_of(2, pos).unwrap() as Locidx;
                    if nonzero < 3 {
                        assert!(virtual_quads.has_virtuals(qid), "face/edge neighbor at {:?} must host virtuals", pos);
                    } else {
                        assert!(!virtual_quads.has_virtuals(qid), "corner neighbor at {:?} must not host virtuals", pos);
                    }
                }
            }
        }
        check_invariants(&forest, &ghost, &mesh, &virtual_quads);
    }

    #[test]
    fn rebuild_is_idempotent() {
        // cargo test rebuild_is_idempotent -- --nocapture
        let example = ExampleForest::random_refined(Dimension::Two, 2, 6, 12345);
        let (forest, ghost, mesh) = example.build(ConnectType::Full);
        let first = VirtualQuads::new_ext(&forest, &ghost, &mesh, ConnectType::Full, true);
        let second = VirtualQuads::new_ext(&forest, &ghost, &mesh, ConnectType::Full, true);
        println!("memory used: {} bytes", first.memory_used());
        assert_eq!(first, second);
    }

    #[test]
    fn ghost_range_half_open() {
        // cargo test ghost_range_half_open -- --nocapture
        // the coarser ghost in the very last slot must be flagged; the range
        // test is [L, L+G), never inclusive of L+G
        let mut example = ExampleForest::new_uniform(Dimension::Two, 1);
        example.refine(example.leaf_index_of(1, [1, 1, 0]).unwrap());
        example.partition_at(&[3]);
        let (forest, ghost, mesh) = example.build_rank(1, ConnectType::Face, true);
        assert_eq!(forest.local_num_quadrants(), 4);
        assert_eq!(ghost.num_ghosts(), 2);
        let virtual_quads = VirtualQuads::new_ext(&forest, &ghost, &mesh, ConnectType::Face, true);
        println!("gflags: {:?}", virtual_quads.gflags());
        // both ghosts are level-1 neighbors of the level-2 children
        assert_eq!(virtual_quads.gflags(), &[0, 1]);
        assert!(virtual_quads.ghost_has_virtuals(ghost.num_ghosts() - 1));
        check_invariants(&forest, &ghost, &mesh, &virtual_quads);
    }

    #[test_case(Dimension::Two, ConnectType::Face ; "quadtree face")]
    #[test_case(Dimension::Two, ConnectType::Full ; "quadtree full")]
    #[test_case(Dimension::Three, ConnectType::Face ; "octree face")]
    #[test_case(Dimension::Three, ConnectType::Edge ; "octree edge")]
    #[test_case(Dimension::Three, ConnectType::Full ; "octree full")]
    fn randomized_invariants(dimension: Dimension, btype: ConnectType) {
        // cargo test randomized_invariants -- --nocapture
        let base_level = match dimension {
            Dimension::Two => 2,
            Dimension::Three => 1,
        };
        for seed in 0..4 {
            let example = ExampleForest::random_refined(dimension, base_level, 5, seed);
            println!("seed {seed}: {} leaves", example.leaves.len());
            let (forest, ghost, mesh) = example.build(ConnectType::Full);
            for compute_level_lists in [false, true] {
                let virtual_quads = VirtualQuads::new_ext(&forest, &ghost, &mesh, btype, compute_level_lists);
                check_invariants(&forest, &ghost, &mesh, &virtual_quads);
                assert_eq!(virtual_quads.memory_used(), expected_memory(&virtual_quads));
            }
        }
    }

    #[test_case(Dimension::Two, ConnectType::Face ; "quadtree face")]
    #[test_case(Dimension::Two, ConnectType::Full ; "quadtree full")]
    #[test_case(Dimension::Three, ConnectType::Full ; "octree full")]
    fn randomized_invariants_multi_rank(dimension: Dimension, btype: ConnectType) {
        // cargo test randomized_invariants_multi_rank -- --nocapture
        let base_level = match dimension {
            Dimension::Two => 2,
            Dimension::Three => 1,
        };
        for seed in 0..3 {
            let mut example = ExampleForest::random_refined(dimension, base_level, 5, 100 + seed);
            println!("seed {seed}: {} leaves", example.leaves.len());
            example.partition_contiguous(3);
            for rank in 0..3 {
                let (forest, ghost, mesh) = example.build_rank(rank, ConnectType::Full, true);
                let virtual_quads = VirtualQuads::new_ext(&forest, &ghost, &mesh, btype, true);
                check_invariants(&forest, &ghost, &mesh, &virtual_quads);
            }
        }
    }

    #[test]
    fn interior_boundary_equivalence() {
        // cargo test interior_boundary_equivalence -- --nocapture
        // routing elements through the interior short-circuit must not change
        // any flag or offset compared to the full boundary traversal
        let mut example = ExampleForest::random_refined(Dimension::Two, 2, 6, 999);
        example.partition_contiguous(2);
        for rank in 0..2 {
            let (forest, ghost, mesh_with) = example.build_rank(rank, ConnectType::Full, true);
            println!("rank {rank}: {} locals", forest.local_num_quadrants());
            let (_, _, mesh_without) = example.build_rank(rank, ConnectType::Full, false);
            assert!(mesh_with.parallel_boundary.is_some());
            assert!(mesh_without.parallel_boundary.is_none());
            let fast = VirtualQuads::new_ext(&forest, &ghost, &mesh_with, ConnectType::Full, true);
            let slow = VirtualQuads::new_ext(&forest, &ghost, &mesh_without, ConnectType::Full, true);
            assert_eq!(fast, slow);
        }
    }

    #[test]
    fn virtual_neighbor_tables_are_mutual() {
        // an in-host entry below 4 names a virtual sibling; that sibling must
        // point back across the same face / the same corner
        for child in 0..4 {
            for face in 0..4 {
                let target = FACE_VIRTUAL_NEIGHBORS_INSIDE[child][face];
                if target < 4 {
                    let opposite = face ^ 1;
                    assert_eq!(FACE_VIRTUAL_NEIGHBORS_INSIDE[target][opposite], child);
                } else {
                    // face-exit slots follow 4 + face + 4 * index_along_face
                    assert_eq!((target - 4) % 4, face);
                }
            }
            for corner in 0..4 {
                let target = CORNER_VIRTUAL_NEIGHBORS_INSIDE[child][corner];
                if target < 4 {
                    assert_eq!(CORNER_VIRTUAL_NEIGHBORS_INSIDE[target][3 - corner], child);
                } else if target >= 12 {
                    assert_eq!(target - 12, corner);
                }
            }
        }
    }

    #[test]
    #[should_panic]
    fn btype_must_not_exceed_mesh() {
        let example = ExampleForest::new_uniform(Dimension::Two, 1);
        let (forest, ghost, mesh) = example.build(ConnectType::Face);
        VirtualQuads::new(&forest, &ghost, &mesh, ConnectType::Full);
    }

    #[test]
    #[should_panic]
    fn unbalanced_forest_is_fatal() {
        // refine twice toward the seam so a level-1 quadrant faces level-3
        // partners across its face
        let mut example = ExampleForest::new_uniform(Dimension::Two, 1);
        let leaf = example.leaf_index_of(1, [0, 0, 0]).unwrap();
        example.refine(leaf);
        let leaf = example.leaf_index_of(2, [1, 0, 0]).unwrap();
        example.refine(leaf);
        let (forest, ghost, mesh) = example.build(ConnectType::Face);
        VirtualQuads::new(&forest, &ghost, &mesh, ConnectType::Face);
    }
}
