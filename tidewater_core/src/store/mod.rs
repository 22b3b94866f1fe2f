//! Bookkeeping backends implementing the registry, checkpoint, audit and webhook traits.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;
