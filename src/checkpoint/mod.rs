//! Execution persistence: an in-memory [`crate::engine::traits::ExecutionRepository`]
//! implementation. The trait itself lives in [`crate::engine::traits`] since
//! it's a collaborator seam the engine depends on; this module only supplies
//! a concrete backend callers can use out of the box, and the one tests use
//! by default.

mod memory;

pub use memory::InMemoryExecutionRepository;
