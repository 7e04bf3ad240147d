//! The kernel-facing side of p4fs: the node contract, the depot node
//! implementations, and the fuser adapter that drives them.

pub mod depot;
pub mod fuser;
pub mod node;

pub use depot::P4Fs;
pub use fuser::FuserAdapter;
