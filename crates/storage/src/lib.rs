#![forbid(unsafe_code)]

//! Persistence seam for the runq engine.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::Store;
