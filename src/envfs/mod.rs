pub mod fs;
pub mod inode;
pub mod session;

pub use fs::EnvFs;
