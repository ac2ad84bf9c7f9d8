//! Device meshes, placements and sharding specs.

mod mesh;
mod placement;
mod spec;

pub use mesh::*;
pub use placement::*;
pub use spec::*;
