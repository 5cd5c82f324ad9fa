//! Core filesystem modules.
//! 
//! This module provides the main components of the filesystem:
//! 
//! - `config`: Mount configuration and codec profiles
//! - `path`: Virtual to backing path resolution
//! - `launcher`: Forking codec processes wired to a pipe
//! - `reaper`: Collecting codec exit statuses without blocking
//! - `session`: Codec sessions and their registry
//! - `stream`: Content I/O over pipes and plain files
//! - `codecfs`: Path-based filesystem core and mode policy
//! - `proto`: FUSE dispatcher
//! - `mount`: Filesystem mounting and management

pub mod codecfs;
pub mod config;
pub mod constants;
pub mod error;
pub mod inode;
pub mod launcher;
pub mod mount;
/// Backing metadata operations.
pub mod passthrough;
pub mod path;
pub mod proto;
pub mod reaper;
pub mod session;
pub mod stream;
