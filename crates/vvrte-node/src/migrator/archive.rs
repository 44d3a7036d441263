// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Migration chunk archive format.
//!
//! A chunk is a plain tar stream:
//!
//! ```text
//! vv/vv.properties        JSON ChunkProperties (always first)
//! vv/vv-source.js         code              (chunk 0 only)
//! vv/vv-continuation.js   snapshot          (chunk 0 only, when present)
//! storage/<name>          storage content   (mtime = modification time)
//! ```

use std::io::Read;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use vvrte_core::CoreError;
use vvrte_core::entities::VirtualVehicleState;

const PROPERTIES_ENTRY: &str = "vv/vv.properties";
const SOURCE_ENTRY: &str = "vv/vv-source.js";
const CONTINUATION_ENTRY: &str = "vv/vv-continuation.js";
const VV_PREFIX: &str = "vv/";
const STORAGE_PREFIX: &str = "storage/";

/// Vehicle metadata carried by every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkProperties {
    pub name: String,
    pub uuid: String,
    pub api_version: i32,
    pub pre_migration_state: Option<VirtualVehicleState>,
    pub state_info: Option<String>,
    pub chunk_number: i32,
    /// Name of the real vehicle the chunk was sent from.
    pub migration_source: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_chunk: bool,
}

/// One storage item as it travels in a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEntry {
    pub name: String,
    pub modification_time: DateTime<Utc>,
    pub content: Vec<u8>,
}

/// A decoded migration chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationChunk {
    pub properties: ChunkProperties,
    pub code: Option<String>,
    pub continuation: Option<Vec<u8>>,
    pub storage: Vec<StorageEntry>,
}

impl MigrationChunk {
    /// Write the chunk as a tar archive.
    ///
    /// Entries other than storage items are stamped with `now`.
    pub fn encode(&self, now: DateTime<Utc>) -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        let properties = serde_json::to_vec(&self.properties)?;
        append(&mut builder, PROPERTIES_ENTRY, &properties, now)?;

        if let Some(code) = &self.code {
            append(&mut builder, SOURCE_ENTRY, code.as_bytes(), now)?;
        }
        if let Some(continuation) = &self.continuation {
            append(&mut builder, CONTINUATION_ENTRY, continuation, now)?;
        }
        for entry in &self.storage {
            let path = format!("{}{}", STORAGE_PREFIX, entry.name);
            append(&mut builder, &path, &entry.content, entry.modification_time)?;
        }

        builder.into_inner()
    }

    /// Parse and validate a chunk. Nothing is written anywhere.
    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        let mut archive = tar::Archive::new(data);
        let entries = archive
            .entries()
            .map_err(|e| CoreError::transfer(format!("unreadable archive: {}", e)))?;

        let mut properties: Option<ChunkProperties> = None;
        let mut code = None;
        let mut continuation = None;
        let mut storage = Vec::new();

        for entry in entries {
            let mut entry =
                entry.map_err(|e| CoreError::transfer(format!("unreadable entry: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| CoreError::transfer(format!("invalid entry name: {}", e)))?
                .to_string_lossy()
                .into_owned();
            let mtime = entry.header().mtime().unwrap_or(0);
            let mut content = Vec::new();
            entry
                .read_to_end(&mut content)
                .map_err(|e| CoreError::transfer(format!("unreadable entry '{}': {}", path, e)))?;

            if path == PROPERTIES_ENTRY {
                properties = Some(serde_json::from_slice(&content).map_err(|e| {
                    CoreError::transfer(format!("invalid vehicle properties: {}", e))
                })?);
                continue;
            }

            let is_vv = path.starts_with(VV_PREFIX);
            let is_storage = path.starts_with(STORAGE_PREFIX);
            if !is_vv && !is_storage {
                return Err(CoreError::transfer(format!("unknown entry '{}'", path)));
            }
            if properties.is_none() {
                return Err(CoreError::transfer(format!(
                    "entry '{}' precedes the vehicle properties",
                    path
                )));
            }

            match path.as_str() {
                SOURCE_ENTRY => {
                    code = Some(String::from_utf8(content).map_err(|_| {
                        CoreError::transfer("vehicle source is not valid UTF-8")
                    })?);
                }
                CONTINUATION_ENTRY => continuation = Some(content),
                _ if is_vv => {
                    return Err(CoreError::transfer(format!("unknown vehicle entry '{}'", path)));
                }
                _ => storage.push(StorageEntry {
                    name: path[STORAGE_PREFIX.len()..].to_string(),
                    modification_time: Utc
                        .timestamp_opt(mtime as i64, 0)
                        .single()
                        .unwrap_or_default(),
                    content,
                }),
            }
        }

        let properties =
            properties.ok_or_else(|| CoreError::transfer("archive has no vehicle properties"))?;
        Ok(Self {
            properties,
            code,
            continuation,
            storage,
        })
    }
}

fn append(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    data: &[u8],
    mtime: DateTime<Utc>,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime.timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(chunk_number: i32, last_chunk: bool) -> ChunkProperties {
        ChunkProperties {
            name: "vv1".to_string(),
            uuid: "a1b2".to_string(),
            api_version: 1,
            pre_migration_state: Some(VirtualVehicleState::Interrupted),
            state_info: None,
            chunk_number,
            migration_source: Some("rv1".to_string()),
            start_time: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            end_time: None,
            last_chunk,
        }
    }

    fn packed_at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_500, 0).unwrap()
    }

    fn raw_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            append(&mut builder, path, data, packed_at()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_first_chunk_carries_code_and_continuation() {
        let chunk = MigrationChunk {
            properties: properties(0, false),
            code: Some("print('hi')".to_string()),
            continuation: Some(vec![0, 1, 2, 255]),
            storage: vec![StorageEntry {
                name: "photo-1".to_string(),
                modification_time: Utc.timestamp_opt(1_700_000_123, 0).unwrap(),
                content: b"jpeg".to_vec(),
            }],
        };

        let decoded = MigrationChunk::decode(&chunk.encode(packed_at()).unwrap()).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_storage_mtime_is_truncated_to_seconds() {
        let modified = Utc.timestamp_opt(1_700_000_123, 987_000_000).unwrap();
        let chunk = MigrationChunk {
            properties: properties(3, true),
            code: None,
            continuation: None,
            storage: vec![StorageEntry {
                name: "log".to_string(),
                modification_time: modified,
                content: vec![],
            }],
        };

        let decoded = MigrationChunk::decode(&chunk.encode(packed_at()).unwrap()).unwrap();
        assert!(decoded.code.is_none());
        assert_eq!(
            decoded.storage[0].modification_time,
            Utc.timestamp_opt(1_700_000_123, 0).unwrap()
        );
    }

    #[test]
    fn test_vehicle_entries_carry_the_given_time() {
        let chunk = MigrationChunk {
            properties: properties(0, true),
            code: Some("run()".to_string()),
            continuation: None,
            storage: vec![],
        };
        let data = chunk.encode(packed_at()).unwrap();

        let mut archive = tar::Archive::new(data.as_slice());
        let stamps: Vec<(String, u64)> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                (path, entry.header().mtime().unwrap())
            })
            .collect();
        assert_eq!(
            stamps,
            vec![
                (PROPERTIES_ENTRY.to_string(), 1_700_000_500),
                (SOURCE_ENTRY.to_string(), 1_700_000_500),
            ]
        );
    }

    #[test]
    fn test_missing_properties_is_rejected() {
        let data = raw_archive(&[]);
        let err = MigrationChunk::decode(&data).unwrap_err();
        assert_eq!(err.error_code(), "TRANSFER_ERROR");
    }

    #[test]
    fn test_entry_before_properties_is_rejected() {
        let props = serde_json::to_vec(&properties(0, true)).unwrap();
        let data = raw_archive(&[("storage/x", b"1"), (PROPERTIES_ENTRY, &props)]);
        let err = MigrationChunk::decode(&data).unwrap_err();
        assert!(err.to_string().contains("precedes"), "{}", err);
    }

    #[test]
    fn test_unknown_entries_are_rejected() {
        let props = serde_json::to_vec(&properties(0, true)).unwrap();

        let data = raw_archive(&[(PROPERTIES_ENTRY, &props), ("vv/vv-icon.png", b"1")]);
        assert!(MigrationChunk::decode(&data).is_err());

        let data = raw_archive(&[(PROPERTIES_ENTRY, &props), ("etc/passwd", b"1")]);
        assert!(MigrationChunk::decode(&data).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(MigrationChunk::decode(&[]).is_err());
        assert!(MigrationChunk::decode(b"not an archive at all").is_err());
    }
}
