//! Virtual filesystem core for real-time kernels.
//!
//! Turns textual paths into located nodes across mounted filesystem
//! instances, and manages the lifetime of those locations and of the file
//! handles bound to them.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod access;
mod env;
mod error;
mod fs;
mod handle;
mod location;
mod mount;
mod node;
mod null;
mod resolve;
mod types;
mod vfs;

pub use access::*;
pub use env::*;
pub use error::*;
pub use fs::*;
pub use handle::*;
pub use location::{GlobalLocation, GlobalRef, GlobalSlot, Location};
pub use mount::MountEntry;
pub use node::*;
pub use resolve::*;
pub use types::*;
pub use vfs::*;
