//! Code Revive: a persistent, cross-process cache of JIT-compiled code
//!
//! A process saves the optimized machine code it produced into a cache file.
//! A later process maps that file and revives code instead of compiling it
//! again, after re-checking that the code still fits: the VM configuration
//! must match, every class and method it names must resolve to an entity
//! with the same content, its class-hierarchy assumptions must still hold
//! and its speculations must not contradict the current profile.
//!
//! # Quick Start
//!
//! ```no_run
//! use code_revive::config::Config;
//! use code_revive::vm::{InMemoryVm, OPTIMIZING_LEVEL};
//! use code_revive::CodeRevive;
//!
//! fn main() -> code_revive::Result<()> {
//!     let vm = InMemoryVm::new();
//!     let config = Config::parse("restore,file=app.csa")?;
//!     let mut cache = CodeRevive::new(&config, &vm);
//!     cache.load()?;
//!     # let method = code_revive::vm::MethodHandle(0);
//!     if let Some(nm) = cache.revive(method, OPTIMIZING_LEVEL)? {
//!         println!("revived {} bytes of code", nm.code_size());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Saving flows: compiled method → [`code_blob`] → [`container`] → [`file`];
//! reviving flows back through [`select`] and [`code_blob`].
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Format** | [`format`], [`file`], [`container`], [`lookup_table`], [`code_space`], [`fingerprint`] |
//! | **Codec** | [`code_blob`], [`meta_space`], [`records`] |
//! | **Restore** | [`select`], [`redefine`], [`cache`] |
//! | **Offline** | [`merge`] |
//! | **Support** | [`config`], [`logging`], [`stats`], [`vm`], [`error`](Error) |

pub mod cache;
pub mod code_blob;
pub mod code_space;
pub mod config;
pub mod container;
pub mod file;
pub mod fingerprint;
pub mod format;
pub mod logging;
pub mod lookup_table;
pub mod merge;
pub mod meta_space;
pub mod records;
pub mod redefine;
pub mod select;
pub mod stats;
pub mod vm;

mod error;

pub use cache::{CodeRevive, SaveReport};
pub use container::ReviveStatus;
pub use error::{Error, FormatErrorKind, Result};
pub use file::CacheFile;
pub use merge::MergeReport;

/// Code Revive version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
