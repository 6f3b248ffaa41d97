//! Miscellaneous common structs used throughout the library.

mod bucket;
mod contact;
mod contact_list;
mod id;
mod routing_table;
mod storage;

pub use bucket::*;
pub use contact::*;
pub use contact_list::*;
pub use id::*;
pub use routing_table::*;
pub use storage::*;
