//! multipackager - build distribution packages in cached chroot sandboxes
//!
//! Each target (distribution, release, architecture) gets a pristine
//! bootstrap tree and a derived build tree, both cached between runs and only
//! ever mutated inside a transaction. A build runs in a disposable working
//! copy of the build tree and leaves a `.deb` or `.rpm` in the output
//! directory.

pub mod cache;
pub mod cli;
pub mod config;
pub mod distro;
pub mod error;
pub mod history;
pub mod overlay;
pub mod pipeline;
pub mod sandbox;
pub mod ui;

pub use error::{MultipackError, MultipackResult};
