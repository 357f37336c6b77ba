//! # QuarryDB Engine
//!
//! Native engine surface for QuarryDB.
//!
//! This crate defines the narrow synchronous call surface the connection
//! core uses to talk to a storage engine:
//! - [`Engine`] / [`NativeHandle`] / [`NativeStatement`] traits
//! - raw [`Status`] codes and [`NativeError`]
//! - the [`Salvager`] trait for best-effort recovery of corrupted stores
//!
//! It also ships a reference implementation, [`MemoryEngine`], which keeps
//! tables in memory and persists committed state as checksummed record
//! frames. The reference engine exists so the core and its tests have a
//! real collaborator to run against; the core itself never reaches past
//! the trait surface.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cipher;
mod engine;
mod memory;
mod record;
mod salvage;
mod status;

pub use cipher::{decrypt_payload, encrypt_payload, CipherError, DEFAULT_PAGE_SIZE, KDF_SALT_SIZE};
pub use engine::{
    set_global_log, set_vfs_open_notification, BusyHandler, CheckpointHook, CommitHook, Engine,
    InterruptHandle, NativeHandle, NativeStatement,
};
pub use memory::MemoryEngine;
pub use record::{compute_crc32, Record, Value};
pub use salvage::{RecordSalvager, SalvageConfig, Salvager};
pub use status::{NativeError, NativeResult, Status};
