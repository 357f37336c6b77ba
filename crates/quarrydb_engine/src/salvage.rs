//! Best-effort salvage of corrupted store files.
//!
//! A salvager never opens the damaged store through the normal path. It
//! scans the raw file for intact record frames, recreates the table set
//! described by previously-backed-up master info, and writes every
//! recoverable row into a healthy destination handle.

use crate::cipher;
use crate::engine::{emit_log, NativeHandle};
use crate::record::{scan_frames, Record, FILE_HEADER_SIZE};
use crate::status::{NativeResult, Status};
use std::collections::BTreeMap;
use std::path::Path;
use zeroize::Zeroizing;

/// Cipher parameters for reading a damaged store.
pub struct SalvageConfig {
    /// Raw cipher key, when the store is encrypted.
    pub key: Option<Zeroizing<Vec<u8>>>,
    /// Page size the store was written with; participates in key
    /// derivation.
    pub page_size: u32,
    /// 16-byte key-derivation salt; zero unless the store used another.
    pub kdf_salt: [u8; 16],
    /// Whether payload authentication is verified. The reference cipher
    /// is an AEAD, so verification is always performed; the flag exists
    /// for engines carrying detached MACs.
    pub use_hmac: bool,
}

impl SalvageConfig {
    /// Salvage config for an unencrypted store with default parameters.
    #[must_use]
    pub fn plain() -> Self {
        Self {
            key: None,
            page_size: cipher::DEFAULT_PAGE_SIZE,
            kdf_salt: [0u8; 16],
            use_hmac: true,
        }
    }
}

/// Salvages recoverable rows from a corrupted store.
pub trait Salvager {
    /// Reads `source`, interprets it with `config` and the supplied
    /// master info, and inserts all recoverable tables into `dest`.
    ///
    /// Returns a raw status code; anything but a success code means the
    /// whole salvage attempt failed.
    fn salvage(
        &self,
        source: &Path,
        config: &SalvageConfig,
        master_info: &[u8],
        dest: &mut dyn NativeHandle,
    ) -> Status;
}

/// The reference salvager for stores written by [`crate::MemoryEngine`].
///
/// All tables named by the master info are recreated; row frames that
/// survive checksum (and, for encrypted stores, authentication) checks
/// are inserted. Damaged regions are skipped with a log line, not
/// treated as fatal.
#[derive(Debug, Default)]
pub struct RecordSalvager;

impl RecordSalvager {
    /// Creates a salvager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn decode_rows(
        &self,
        data: &[u8],
        config: &SalvageConfig,
    ) -> (Vec<(String, i64, Vec<crate::record::Value>)>, u32) {
        // Header may itself be damaged; scan the whole file leniently
        // and let the frame checksums decide what survives. Skipping the
        // header region avoids one guaranteed resync when it is intact.
        let offset = if data.len() >= FILE_HEADER_SIZE {
            FILE_HEADER_SIZE
        } else {
            0
        };
        let (frames, mut skipped) = match scan_frames(data, offset, true) {
            Ok(out) => out,
            Err(_) => (Vec::new(), 1),
        };
        let mut rows = Vec::new();
        for frame in frames {
            let payload = match &config.key {
                Some(key) => {
                    match cipher::decrypt_payload(
                        key,
                        &config.kdf_salt,
                        config.page_size,
                        &frame.payload,
                    ) {
                        Ok(plain) => plain,
                        Err(_) => {
                            skipped += 1;
                            continue;
                        }
                    }
                }
                None => frame.payload.clone(),
            };
            match Record::decode_payload(frame.type_byte, &payload) {
                Ok(Record::Row {
                    table,
                    rowid,
                    values,
                }) => rows.push((table, rowid, values)),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        (rows, skipped)
    }
}

impl Salvager for RecordSalvager {
    fn salvage(
        &self,
        source: &Path,
        config: &SalvageConfig,
        master_info: &[u8],
        dest: &mut dyn NativeHandle,
    ) -> Status {
        // Master info is a sequence of plain schema frames.
        let schemas = match scan_frames(master_info, 0, false) {
            Ok((frames, _)) => frames,
            Err(_) => return Status::CORRUPT,
        };
        let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for frame in schemas {
            match Record::decode_payload(frame.type_byte, &frame.payload) {
                Ok(Record::Schema { table, columns }) => {
                    tables.insert(table, columns);
                }
                Ok(_) => {}
                Err(_) => return Status::CORRUPT,
            }
        }

        let data = match std::fs::read(source) {
            Ok(bytes) => bytes,
            Err(_) => return Status::CANTOPEN,
        };
        let (mut rows, skipped) = self.decode_rows(&data, config);
        if skipped > 0 {
            emit_log(
                Status::CORRUPT.raw(),
                &format!(
                    "salvage of {} skipped {skipped} damaged region(s)",
                    source.display()
                ),
            );
        }

        for (table, columns) in &tables {
            let sql = format!("CREATE TABLE {table} ({})", columns.join(", "));
            if exec_on(dest, &sql).is_err() {
                return Status::ERROR;
            }
        }

        // Keep source row order within each table.
        rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        for (table, _, values) in rows {
            if !tables.contains_key(&table) {
                continue;
            }
            let literals: Vec<String> = values.iter().map(|v| v.to_literal()).collect();
            let sql = format!("INSERT INTO {table} VALUES ({})", literals.join(", "));
            if exec_on(dest, &sql).is_err() {
                return Status::ERROR;
            }
        }
        Status::OK
    }
}

fn exec_on(handle: &mut dyn NativeHandle, sql: &str) -> NativeResult<()> {
    let mut stmt = handle.prepare(sql)?;
    while stmt.step()? {}
    Ok(())
}
