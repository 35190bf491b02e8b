//! The core, UI-agnostic library for the `tarkit` archive utility.
//!
//! `tarkit-core` provides the handle every archive read or write is built on.
//! It decides which I/O primitives are in force for a session, whether the
//! session reads or writes, and which bookkeeping table is active while it
//! runs. Header encoding, extraction policy and compression framing live in
//! the layers above; this crate only fronts the byte stream.
//!
//! The library is structured into several key modules:
//! - [`backend`]: The four-operation [`Backend`] trait and the raw, in-memory
//!   and compressed implementations.
//! - [`mod@archive`]: The [`Archive`] handle, its two constructors, and `close`.
//! - [`state`]: The mode-selected bookkeeping table: extracted paths when
//!   reading, device and inode identities when writing.
//! - [`table`]: The bucketed table both kinds of bookkeeping are built on.
//! - [`flags`]: Access modes and the [`Options`] bitmask.
//!
//! ## Example: Writing Through a Compressed Backend
//!
//! ```rust,no_run
//! use tarkit_core::backend::{Codec, CompressedBackend};
//! use tarkit_core::{ArchiveBuilder, BLOCK_SIZE, Options};
//! use nix::fcntl::OFlag;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gzip = CompressedBackend::new(Codec::Gzip);
//!
//!     let mut archive = ArchiveBuilder::new()
//!         .flags(OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC)
//!         .options(Options::NO_OVERWRITE)
//!         .backend(&gzip)
//!         .open("backup.tar.gz")?;
//!
//!     // Two zero blocks mark the end of a tar stream.
//!     archive.write_block(&[0u8; BLOCK_SIZE])?;
//!     archive.write_block(&[0u8; BLOCK_SIZE])?;
//!
//!     // Close always releases everything; the status is the backend's verdict.
//!     archive.close().into_result()?;
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod backend;
pub mod error;
pub mod flags;
pub mod state;
pub mod table;

pub use archive::{Archive, ArchiveBuilder, BLOCK_SIZE, CloseReport};
pub use backend::{Backend, DEFAULT_BACKEND, Descriptor};
pub use error::{Error, Result};
pub use flags::{AccessMode, Options};
pub use state::{AuxKind, AuxState, Hashers, TeardownSummary};
