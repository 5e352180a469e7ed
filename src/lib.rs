// src/lib.rs

//! Alam package management core
//!
//! Installs, upgrades and removes binary packages on a filesystem root,
//! tracked by a local database of installed packages and fed by sync
//! databases describing repository contents.
//!
//! # Architecture
//!
//! - [`Handle`]: one package root, its options, databases and backends
//! - [`Transaction`]: enlist targets, `prepare` (dependency resolution,
//!   conflict checks), `commit` (download, verify, remove, extract)
//! - [`resolver`]: dependency checks, target resolution, topological order
//! - [`delta`]: cheapest delta chain to rebuild a package from a cached one
//! - [`db`]: package databases over the flat-file `%TAG%` format
//!
//! ```no_run
//! use alam::config::Options;
//! use alam::transaction::{CancellationToken, NullObserver, TransFlags, Transaction};
//! use alam::Handle;
//!
//! # fn main() -> alam::Result<()> {
//! let mut handle = Handle::open(Options::load("/etc/alam.toml".as_ref())?)?;
//! let mut trans = Transaction::init(&mut handle, TransFlags::empty(), Box::new(NullObserver))?;
//! trans.sync_target("vim")?;
//! trans.prepare()?;
//! trans.commit(&CancellationToken::new())?;
//! trans.release();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod delta;
mod error;
pub mod filesystem;
pub mod handle;
pub mod packages;
pub mod repository;
pub mod resolver;
pub mod scriptlet;
pub mod transaction;
pub mod version;

pub use error::{Error, Result};
pub use handle::Handle;
pub use transaction::{TransFlags, TransState, Transaction};
