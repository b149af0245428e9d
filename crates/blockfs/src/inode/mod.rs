//! The indexed file object (inode) layer: on-disk index-tree layout and
//! resize (`layout`), the process-wide open-inode table (`registry`), and
//! offset-based file I/O (`file`).

pub mod layout;
pub mod registry;

pub(crate) mod file;

pub use registry::{InodeRecord, InodeRegistry, RawHandle};
