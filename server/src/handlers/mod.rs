//! Request handlers.

mod commits;

pub use commits::*;
