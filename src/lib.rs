#![doc(html_root_url = "https://docs.rs/holefs/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! holefs: FUSE filesystems that pipe file content through an external codec
//! 
//! A backing directory is mirrored at a mountpoint, but file content never
//! passes through in plain form:
//! 
//! - an **ingest** ("black hole") mount feeds every byte written to a file
//!   into the codec's stdin, and the codec writes the encoded file into the
//!   backing directory
//! - an **egress** ("white hole") mount starts the codec on open and hands
//!   its decoded stdout to readers
//! 
//! Metadata operations pass straight through to the backing directory.
//! The default codec is GnuPG; any program that filters a standard stream
//! can be configured with a JSON codec profile.
//! 
//! ## Quick Start
//! 
//! ```rust,no_run
//! use holefs::{Config, FilesystemManager, Mode};
//! use std::path::PathBuf;
//! 
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let mut config = Config::new(
//!     Mode::Ingest,
//!     PathBuf::from("/srv/vault"),
//!     PathBuf::from("/mnt/drop"),
//! );
//! config.recipient = Some("alice@example.org".into());
//! config.validate()?;
//! 
//! let manager = FilesystemManager::new(config);
//! let workers = tokio::runtime::Handle::current();
//! tokio::task::spawn_blocking(move || manager.mount(workers)).await??;
//! # Ok(())
//! # }
//! ```
//! 
//! ## Sessions
//! 
//! Every open that involves the codec creates a session: a pipe plus the
//! forked codec process. Sessions are tracked by handle until `release`,
//! which closes the pipe and collects exited codecs without ever waiting
//! for one.

pub mod modules;

pub use modules::codecfs::CodecFs;
pub use modules::mount::FilesystemManager;
pub use modules::proto::HoleFs;

// Re-export commonly used types
pub use modules::config::{CodecSpec, Config, Mode};
pub use modules::error::{FsError, FsResult};
