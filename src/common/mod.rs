//! Miscellaneous common structs used throughout the library.

mod contact;
mod id;
mod value;

pub use contact::*;
pub use id::*;
pub use value::*;
