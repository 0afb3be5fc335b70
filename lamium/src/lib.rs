pub mod idioms;
pub mod raw;
pub mod runtime;
pub mod verify;
pub mod vm;

mod utilities;

pub use raw::image::{Bytefile, LoadError};
pub use vm::{RuntimeError, Value};
