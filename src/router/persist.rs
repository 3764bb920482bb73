//! Write-once persistence for the routing config.
//!
//! A sidecar marker stores the SHA-256 of the canonical JSON last written;
//! writes are skipped while the hash is unchanged and performed via
//! temp-file-plus-rename so readers never observe a torn config.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::util::unix_now_secs;

/// Literal suffix appended to the config path. Prior deployments left markers
/// under this exact name, so it must not change.
pub const MARKER_SUFFIX: &str = ".model-routing.migrated";

/// Sidecar recording the hash of the last persisted config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationMarker {
    pub hash: String,
    pub migrated_at: u64,
}

/// Result of a persistence attempt. IO failures never propagate as errors:
/// the in-memory config is already authoritative, so the caller only needs
/// to know whether bytes hit disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    pub wrote: bool,
    pub warning: Option<String>,
}

#[must_use]
pub fn marker_path(config_path: &Path) -> PathBuf {
    let mut name = config_path.as_os_str().to_os_string();
    name.push(MARKER_SUFFIX);
    PathBuf::from(name)
}

/// Serialize to canonical JSON: object keys sorted, no insignificant
/// whitespace. Equal values always hash equal.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                if let Some(entry) = map.get(*key) {
                    write_canonical(entry, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).unwrap_or_default()),
    }
}

/// SHA-256 hex digest over the canonical JSON of `value`.
#[must_use]
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Read the stored marker, if any. Unreadable or unparsable markers are
/// treated as absent so a fresh write can repair them.
#[must_use]
pub fn read_marker(config_path: &Path) -> Option<MigrationMarker> {
    let contents = std::fs::read_to_string(marker_path(config_path)).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Persist `config` and its marker when the content hash differs from the
/// stored marker hash; skip the write when equal.
#[must_use]
pub fn persist_if_changed(config_path: &Path, config: &Value) -> PersistOutcome {
    let hash = content_hash(config);
    if read_marker(config_path).is_some_and(|marker| marker.hash == hash) {
        return PersistOutcome {
            wrote: false,
            warning: None,
        };
    }

    let marker = MigrationMarker {
        hash,
        migrated_at: unix_now_secs(),
    };

    let body = match serde_json::to_string_pretty(config) {
        Ok(body) => body,
        Err(err) => {
            return PersistOutcome {
                wrote: false,
                warning: Some(format!("failed to serialize routing config: {err}")),
            }
        }
    };
    if let Err(err) = atomic_write(config_path, body.as_bytes()) {
        return PersistOutcome {
            wrote: false,
            warning: Some(format!(
                "failed to persist routing config to {}: {err}",
                config_path.display()
            )),
        };
    }

    let marker_body = match serde_json::to_string(&marker) {
        Ok(body) => body,
        Err(err) => {
            return PersistOutcome {
                wrote: true,
                warning: Some(format!("failed to serialize migration marker: {err}")),
            }
        }
    };
    if let Err(err) = atomic_write(&marker_path(config_path), marker_body.as_bytes()) {
        return PersistOutcome {
            wrote: true,
            warning: Some(format!("failed to persist migration marker: {err}")),
        };
    }

    PersistOutcome {
        wrote: true,
        warning: None,
    }
}

/// Load the persisted routing config document, if present and parseable.
#[must_use]
pub fn load_persisted(config_path: &Path) -> Option<Value> {
    let contents = std::fs::read_to_string(config_path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
