//! Method bodies: headers, exception clauses and flags.

mod body;
mod exceptions;
mod types;

pub use body::{encode_method_body, MethodBody};
pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags};
pub use types::*;
