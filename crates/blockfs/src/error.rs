//! The crate-wide error type.
//!
//! The core algorithms keep the spec's original contracts: `resize`/
//! `inode_create` report out-of-space as `bool`, `read_at`/`write_at`
//! report partial transfer as a byte count, and programmatic contract
//! breaches are fatal assertions, not recoverable errors. `Error` exists
//! for the ambient infrastructure around those contracts — device
//! adapters and free-map implementations that *do* have a distinct
//! failure channel.

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    /// A device operation addressed a sector outside the device's range.
    #[error("sector {0} is out of range for this device")]
    OutOfRange(u32),
}
