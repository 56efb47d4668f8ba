//! Common Types
//!
//! Index types, dimension and connectivity descriptors shared across the crate.
//!

use serde::{Deserialize, Serialize};

cfg_if::cfg_if! {
    if #[cfg(feature = "i64_index")] {
        /// local (per-rank) element index; signed so that `-1` can mark absence in packed arrays
        pub type Locidx = i64;
    } else {
        /// local (per-rank) element index; signed so that `-1` can mark absence in packed arrays
        pub type Locidx = i32;
    }
}

/// global element count across all ranks
pub type Gloidx = i64;
/// refinement level of an element
pub type Level = u8;
/// MPI rank number
pub type Rank = i32;
/// tree number within the forest's connectivity
pub type Topidx = i32;

/// deepest refinement level a quadtree leaf may take
pub const MAX_LEVEL_2D: Level = 29;
/// deepest refinement level an octree leaf may take
pub const MAX_LEVEL_3D: Level = 19;

/// spatial dimension of the forest, fixing children/face/edge/corner counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Two,
    Three,
}

impl Dimension {
    /// number of children of a refined element, `2^D`
    pub const fn children(self) -> usize {
        match self {
            Dimension::Two => 4,
            Dimension::Three => 8,
        }
    }

    /// number of faces of an element, `2*D`
    pub const fn faces(self) -> usize {
        match self {
            Dimension::Two => 4,
            Dimension::Three => 6,
        }
    }

    /// number of edges of an element; edges only exist in 3D
    pub const fn edges(self) -> usize {
        match self {
            Dimension::Two => 0,
            Dimension::Three => 12,
        }
    }

    /// number of corners of an element, `2^D`
    pub const fn corners(self) -> usize {
        self.children()
    }

    pub const fn max_level(self) -> Level {
        match self {
            Dimension::Two => MAX_LEVEL_2D,
            Dimension::Three => MAX_LEVEL_3D,
        }
    }
}

/// connectivity mode selecting which neighbor directions count as adjacent;
/// the variants are ordered so that `Face < Edge < Full`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConnectType {
    /// face neighbors only
    Face,
    /// face and edge neighbors (3D only)
    Edge,
    /// face, edge (3D) and corner neighbors
    Full,
}

impl ConnectType {
    /// number of neighbor directions inspected under this mode, in the canonical
    /// order faces, then edges (3D), then corners
    pub fn num_directions(self, dimension: Dimension) -> usize {
        match self {
            ConnectType::Face => dimension.faces(),
            ConnectType::Edge => match dimension {
                Dimension::Three => dimension.faces() + dimension.edges(),
                Dimension::Two => panic!("edge connectivity does not exist in 2D"),
            },
            ConnectType::Full => dimension.faces() + dimension.edges() + dimension.corners(),
        }
    }
}

#[allow(dead_code)]
/// use Xoshiro256StarStar for deterministic random number generator
pub type DeterministicRng = rand_xoshiro::Xoshiro256StarStar;
