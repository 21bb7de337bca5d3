pub mod container;
pub mod storage;

pub use container::ServiceContainer;
pub use storage::*;
