//! Master-info backup and corrupted-store recovery.
//!
//! Recovery is two-phase. While a store is healthy, [`Connection::backup`]
//! snapshots its master info (the schema catalog) into a sidecar file
//! next to the store. When the store is later damaged, [`recover`] reads
//! the sidecar, recreates the catalog in a fresh destination, and lets a
//! [`Salvager`] pull every surviving row out of the wreckage. The master
//! info matters because the catalog frames sit at the front of the store
//! file, the region most likely to be destroyed.
//!
//! Backup sidecars are self-contained: a checksummed envelope, payload
//! optionally sealed with a key independent of the store's own cipher
//! key.

use crate::connection::{path_with_suffix, Connection};
use crate::error::{CoreError, CoreResult, Operation};
use quarrydb_engine::{
    compute_crc32, decrypt_payload, encrypt_payload, NativeError, RecordSalvager, SalvageConfig,
    Salvager, Status, DEFAULT_PAGE_SIZE, KDF_SALT_SIZE,
};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Suffix of the backup sidecar file.
pub const BACKUP_SUFFIX: &str = "-backup";

const BACKUP_MAGIC: [u8; 4] = *b"QBAK";
const BACKUP_VERSION: u16 = 1;
const FLAG_ENCRYPTED: u8 = 0x01;
// magic + version + flags + reserved + salt + payload length
const HEADER_SIZE: usize = 4 + 2 + 1 + 1 + KDF_SALT_SIZE + 4;
const TRAILER_SIZE: usize = 4;

/// Everything needed to rebuild a damaged store.
pub struct RecoveryContext {
    /// Path of the damaged store.
    pub source_path: PathBuf,
    /// Cipher key of the damaged store, when it is encrypted.
    pub database_key: Option<Zeroizing<Vec<u8>>>,
    /// Key the backup sidecar was sealed with, when it was.
    pub backup_key: Option<Zeroizing<Vec<u8>>>,
    /// Page size the store was written with.
    pub page_size: u32,
    /// Key-derivation salt of the store.
    pub kdf_salt: [u8; KDF_SALT_SIZE],
}

impl RecoveryContext {
    /// Context for an unencrypted store with default parameters.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            database_key: None,
            backup_key: None,
            page_size: DEFAULT_PAGE_SIZE,
            kdf_salt: [0u8; KDF_SALT_SIZE],
        }
    }

    /// Sets the damaged store's cipher key.
    #[must_use]
    pub fn with_database_key(mut self, key: &[u8]) -> Self {
        self.database_key = Some(Zeroizing::new(key.to_vec()));
        self
    }

    /// Sets the backup sidecar's key.
    #[must_use]
    pub fn with_backup_key(mut self, key: &[u8]) -> Self {
        self.backup_key = Some(Zeroizing::new(key.to_vec()));
        self
    }

    /// Path of the backup sidecar next to the source store.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        path_with_suffix(&self.source_path, BACKUP_SUFFIX)
    }
}

impl Connection {
    /// Snapshots this store's master info into its backup sidecar.
    ///
    /// With a `backup_key` the payload is sealed; the key is
    /// independent of the store's own cipher key, so an operator can
    /// hold recovery material without being able to read the store.
    /// The sidecar is written atomically (temp file plus rename) so a
    /// crash mid-backup never leaves a truncated sidecar behind.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BackupFailure`] when the connection is not
    /// open, the master info cannot be serialized, or the sidecar
    /// cannot be written.
    pub fn backup(&mut self, backup_key: Option<&[u8]>) -> CoreResult<()> {
        let Some(handle) = self.handle.as_deref_mut() else {
            return Err(self.report_native(
                Operation::SaveMaster,
                None,
                NativeError::new(Status::MISUSE, "connection is not opened"),
                CoreError::BackupFailure,
            ));
        };
        let master = match handle.serialize_master() {
            Ok(master) => master,
            Err(e) => {
                return Err(self.report_native(
                    Operation::SaveMaster,
                    None,
                    e,
                    CoreError::BackupFailure,
                ))
            }
        };

        let salt = [0u8; KDF_SALT_SIZE];
        let (flags, payload) = match backup_key {
            Some(key) => (
                FLAG_ENCRYPTED,
                encrypt_payload(key, &salt, DEFAULT_PAGE_SIZE, &master),
            ),
            None => (0, master),
        };

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
        bytes.extend_from_slice(&BACKUP_MAGIC);
        bytes.extend_from_slice(&BACKUP_VERSION.to_le_bytes());
        bytes.push(flags);
        bytes.push(0);
        bytes.extend_from_slice(&salt);
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        let crc = compute_crc32(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        let target = path_with_suffix(&self.path, BACKUP_SUFFIX);
        let staging = path_with_suffix(&self.path, "-backup.tmp");
        let written = fs::write(&staging, &bytes).and_then(|()| fs::rename(&staging, &target));
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(self.report_native(
                Operation::SaveMaster,
                None,
                NativeError::from(e),
                CoreError::BackupFailure,
            ));
        }
        tracing::debug!(
            path = %self.path.display(),
            bytes = bytes.len(),
            sealed = backup_key.is_some(),
            "master info backed up"
        );
        Ok(())
    }
}

/// Rebuilds `ctx.source_path` into `dest` with the reference salvager.
///
/// # Errors
///
/// Returns [`CoreError::RecoverFailure`] when the sidecar is missing or
/// damaged, or when the salvage attempt fails outright. A degraded
/// store that yields only some rows is still a success.
pub fn recover(ctx: &RecoveryContext, dest: &mut Connection) -> CoreResult<()> {
    recover_with(ctx, &RecordSalvager::new(), dest)
}

/// Rebuilds `ctx.source_path` into `dest` with a caller-supplied
/// salvager.
///
/// # Errors
///
/// See [`recover`].
pub fn recover_with(
    ctx: &RecoveryContext,
    salvager: &dyn Salvager,
    dest: &mut Connection,
) -> CoreResult<()> {
    let master = load_master(ctx)
        .map_err(|e| report_recover_failure(dest, &ctx.source_path, e))?;

    if dest.native_handle_mut().is_none() {
        return Err(report_recover_failure(
            dest,
            &ctx.source_path,
            NativeError::new(Status::MISUSE, "destination connection is not opened"),
        ));
    }

    let config = SalvageConfig {
        key: ctx.database_key.clone(),
        page_size: ctx.page_size,
        kdf_salt: ctx.kdf_salt,
        use_hmac: true,
    };
    let status = {
        let handle = dest.native_handle_mut().unwrap();
        salvager.salvage(&ctx.source_path, &config, &master, handle)
    };
    if !status.is_succeeded() {
        return Err(report_recover_failure(
            dest,
            &ctx.source_path,
            NativeError::new(status, "salvage attempt failed"),
        ));
    }
    tracing::info!(
        source = %ctx.source_path.display(),
        dest = %dest.path().display(),
        "store recovered"
    );
    Ok(())
}

fn load_master(ctx: &RecoveryContext) -> Result<Vec<u8>, NativeError> {
    let backup_path = ctx.backup_path();
    let bytes = fs::read(&backup_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            NativeError::new(
                Status::CANTOPEN,
                format!("no backup sidecar at {}", backup_path.display()),
            )
        } else {
            NativeError::from(e)
        }
    })?;

    if bytes.len() < HEADER_SIZE + TRAILER_SIZE || bytes[..4] != BACKUP_MAGIC {
        return Err(NativeError::corrupt("backup sidecar is malformed"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != BACKUP_VERSION {
        return Err(NativeError::corrupt(format!(
            "unsupported backup version {version}"
        )));
    }
    let body = &bytes[..bytes.len() - TRAILER_SIZE];
    let stored = u32::from_le_bytes(
        bytes[bytes.len() - TRAILER_SIZE..].try_into().unwrap(),
    );
    if compute_crc32(body) != stored {
        return Err(NativeError::corrupt("backup sidecar checksum mismatch"));
    }
    let flags = bytes[6];
    let payload_len = u32::from_le_bytes(bytes[24..28].try_into().unwrap()) as usize;
    if body.len() - HEADER_SIZE != payload_len {
        return Err(NativeError::corrupt("backup sidecar length mismatch"));
    }
    let payload = &body[HEADER_SIZE..];

    if flags & FLAG_ENCRYPTED == 0 {
        return Ok(payload.to_vec());
    }
    let key = ctx.backup_key.as_ref().ok_or_else(NativeError::not_a_database)?;
    let mut salt = [0u8; KDF_SALT_SIZE];
    salt.copy_from_slice(&bytes[8..8 + KDF_SALT_SIZE]);
    decrypt_payload(key, &salt, DEFAULT_PAGE_SIZE, payload)
        .map_err(|_| NativeError::not_a_database())
}

fn report_recover_failure(dest: &Connection, source: &Path, native: NativeError) -> CoreError {
    dest.report_native_at(
        source,
        Operation::Repair,
        None,
        native,
        CoreError::RecoverFailure,
    )
}
