pub mod backend;
pub mod config;
pub mod drag;
pub mod errors;
pub mod geometry;
pub mod shape;
pub mod snap;
pub mod state;

pub use errors::{PerchError, Result};
pub use state::{Attach, Perch};
