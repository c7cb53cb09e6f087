//! Database module for PostgreSQL persistence.

mod commits;
mod pool;

pub use commits::*;
pub use pool::*;
