use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use crate::{
    domain::Record,
    errors::Error,
    store::{locks::KeyLocks, validate_key, Store},
    Result,
};

const RECORDS_DIR: &str = "records";
const PROBE_FILE: &str = ".write-probe";
const TMP_SUFFIX: &str = ".tmp";
/// Longer hex-encoded keys switch to a hashed file name.
const MAX_HEX_NAME: usize = 200;

/// Durable store: one JSON file per key under `<root>/records`.
///
/// Writes land in a temp file that is synced and renamed over the target, then
/// the directory is synced, so a `put` that returned survives a crash.
/// Blocking filesystem work runs on the blocking pool and every call is bounded
/// by `timeout`.
pub struct FileStore {
    root: PathBuf,
    records: PathBuf,
    timeout: Duration,
    locks: KeyLocks,
    tmp_seq: AtomicU64,
}

impl FileStore {
    /// Open (cold start: create) the store rooted at `root`.
    ///
    /// Leftover temp files from an interrupted write are removed, the
    /// directory is probed for writability and existing records must parse.
    pub async fn open(root: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let root = root.into();
        let records = root.join(RECORDS_DIR);

        let dir = records.clone();
        let count = run_blocking(timeout, "open", move || prepare_dir(&dir)).await?;
        tracing::info!(root = %root.display(), records = count, "store opened");

        Ok(Self {
            root,
            records,
            timeout,
            locks: KeyLocks::new(),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.records.join(file_name_for(key))
    }

    fn unavailable(&self, op: &str) -> Error {
        Error::StorageUnavailable(format!(
            "{op} timed out after {}ms waiting for key lock",
            self.timeout.as_millis()
        ))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, key: &str) -> Result<Record> {
        validate_key(key)?;
        let guard = timeout(self.timeout, self.locks.read(key))
            .await
            .map_err(|_| self.unavailable("get"))?;

        let path = self.path_for(key);
        let key = key.to_string();
        run_blocking(self.timeout, "get", move || {
            let _guard = guard;
            read_record(&path, &key)
        })
        .await
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<Record> {
        validate_key(key)?;
        let guard = timeout(self.timeout, self.locks.write(key))
            .await
            .map_err(|_| self.unavailable("put"))?;

        let record = Record {
            key: key.to_string(),
            value,
            updated_at: Utc::now(),
        };
        let path = self.path_for(key);
        let tmp = self.records.join(format!(
            "{}.{}-{}{TMP_SUFFIX}",
            file_name_for(key),
            std::process::id(),
            self.tmp_seq.fetch_add(1, Ordering::Relaxed)
        ));
        let dir = self.records.clone();
        let out = record.clone();
        run_blocking(self.timeout, "put", move || {
            let _guard = guard;
            let bytes = serde_json::to_vec(&record)?;
            write_atomic(&dir, &tmp, &path, &bytes).map_err(storage_err)
        })
        .await?;
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let guard = timeout(self.timeout, self.locks.write(key))
            .await
            .map_err(|_| self.unavailable("delete"))?;

        let path = self.path_for(key);
        let dir = self.records.clone();
        let key = key.to_string();
        run_blocking(self.timeout, "delete", move || {
            let _guard = guard;
            match fs::remove_file(&path) {
                Ok(()) => sync_dir(&dir).map_err(storage_err),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::not_found(key)),
                Err(e) => Err(storage_err(e)),
            }
        })
        .await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.records.clone();
        let prefix = prefix.to_string();
        run_blocking(self.timeout, "keys", move || list_keys(&dir, &prefix)).await
    }

    async fn flush(&self) -> Result<()> {
        let dir = self.records.clone();
        run_blocking(self.timeout, "flush", move || {
            sync_dir(&dir).map_err(storage_err)
        })
        .await
    }
}

/// Run blocking filesystem work with a deadline.
///
/// On timeout the caller gets `StorageUnavailable`; the blocking task still
/// finishes in the background and keeps its key lock until it does.
async fn run_blocking<T, F>(limit: Duration, op: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match timeout(limit, tokio::task::spawn_blocking(f)).await {
        Err(_) => Err(Error::StorageUnavailable(format!(
            "{op} timed out after {}ms",
            limit.as_millis()
        ))),
        Ok(Err(join)) => Err(Error::StorageUnavailable(format!("{op} task failed: {join}"))),
        Ok(Ok(res)) => res,
    }
}

fn storage_err(e: io::Error) -> Error {
    Error::StorageUnavailable(e.to_string())
}

fn prepare_dir(records: &Path) -> Result<usize> {
    fs::create_dir_all(records).map_err(|e| {
        Error::StorageUnavailable(format!("cannot create {}: {e}", records.display()))
    })?;

    let entries = fs::read_dir(records).map_err(|e| {
        Error::StorageUnavailable(format!("cannot read {}: {e}", records.display()))
    })?;

    let mut count = 0usize;
    for ent in entries {
        let ent = ent.map_err(storage_err)?;
        let name = ent.file_name().to_string_lossy().to_string();
        if name.ends_with(TMP_SUFFIX) || name == PROBE_FILE {
            tracing::debug!(file = %name, "removing leftover temp file");
            let _ = fs::remove_file(ent.path());
            continue;
        }
        if !name.ends_with(".json") {
            continue;
        }
        let record = parse_record_file(&ent.path())?;
        if file_name_for(&record.key) != name {
            return Err(Error::StorageUnavailable(format!(
                "record file {name} does not match its key {:?}",
                record.key
            )));
        }
        count += 1;
    }

    let probe = records.join(PROBE_FILE);
    write_atomic(records, &probe, &probe, b"ok")
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|e| {
            Error::StorageUnavailable(format!("{} is not writable: {e}", records.display()))
        })?;

    Ok(count)
}

fn read_record(path: &Path, key: &str) -> Result<Record> {
    let record = match parse_record_file(path) {
        Ok(r) => r,
        Err(e) if e.is_not_found() => return Err(Error::not_found(key)),
        Err(e) => return Err(e),
    };
    if record.key != key {
        return Err(Error::StorageUnavailable(format!(
            "record at {} belongs to key {:?}",
            path.display(),
            record.key
        )));
    }
    Ok(record)
}

fn parse_record_file(path: &Path) -> Result<Record> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::not_found(path.display().to_string()))
        }
        Err(e) => return Err(storage_err(e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::StorageUnavailable(format!("corrupt record {}: {e}", path.display()))
    })
}

fn list_keys(records: &Path, prefix: &str) -> Result<Vec<String>> {
    let entries = fs::read_dir(records).map_err(storage_err)?;
    let mut keys = Vec::new();

    for ent in entries {
        let ent = ent.map_err(storage_err)?;
        let name = ent.file_name().to_string_lossy().to_string();
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };

        let key = if let Some(hex) = stem.strip_prefix("k-") {
            match decode_hex(hex).and_then(|b| String::from_utf8(b).ok()) {
                Some(k) => k,
                None => continue,
            }
        } else if stem.starts_with("h-") {
            match parse_record_file(&ent.path()) {
                Ok(r) => r.key,
                // Deleted between read_dir and the read.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        } else {
            continue;
        };

        if key.starts_with(prefix) {
            keys.push(key);
        }
    }

    keys.sort();
    Ok(keys)
}

fn write_atomic(dir: &Path, tmp: &Path, target: &Path, bytes: &[u8]) -> io::Result<()> {
    let res = (|| {
        let mut f = fs::File::create(tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        drop(f);
        if tmp != target {
            fs::rename(tmp, target)?;
        }
        sync_dir(dir)
    })();
    if res.is_err() && tmp != target {
        let _ = fs::remove_file(tmp);
    }
    res
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn file_name_for(key: &str) -> String {
    let hex = encode_hex(key.as_bytes());
    if hex.len() <= MAX_HEX_NAME {
        format!("k-{hex}.json")
    } else {
        let digest = Sha256::digest(key.as_bytes());
        format!("h-{}.json", encode_hex(&digest))
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
