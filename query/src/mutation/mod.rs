#[allow(clippy::module_inception)]
mod mutation;
mod options;
mod runner;

pub use mutation::*;
pub use options::*;
pub use runner::*;
