//! Handler module - units of work and their dispatch.
//!
//! Provides:
//! - [`Callable`] - a serializable unit of work with typed output and error
//! - [`CallableRegistry`] - maps callable names to handlers on the executing side

mod callable;
mod registry;

pub use callable::Callable;
pub use registry::{BoxFuture, CallableRegistry};
