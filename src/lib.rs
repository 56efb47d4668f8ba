extern crate cfg_if;
extern crate derivative;
extern crate hashbrown;
extern crate itertools;
extern crate more_asserts;
extern crate rand;
extern crate rand_xoshiro;
extern crate serde;
#[macro_use]
extern crate serde_json;

pub mod example_forests;
pub mod forest;
pub mod mesh;
pub mod util;
pub mod virtual_ghost;
pub mod virtual_quads;
pub mod visualize;
