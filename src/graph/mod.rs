mod adjlist;
mod random;
mod rewire;

pub use adjlist::*;
pub use random::*;
pub use rewire::*;
