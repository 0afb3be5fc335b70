mod error;
mod interp;
mod stack;
mod value;

pub use error::*;
pub use interp::run;
pub use stack::{CallInfo, ValueStack, INIT_STACK_SIZE, MAX_STACK_SIZE};
pub use value::{HeapRef, Value};
