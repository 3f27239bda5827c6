/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Chunk metadata lookup.
//!
//! The storage/metadata service records where every chunk currently resides.
//! The scheduling core only ever asks one question of it, batched: "for these
//! keys, what are the store sizes and resident bands?".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::band::Band;
use crate::error::{SchedulingError, SchedulingResult};
use crate::subtask::ChunkKey;

/// Field names requested from the metadata service.
pub const CHUNK_META_FIELDS: &[&str] = &["store_size", "bands"];

/// Location and size of one chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkMeta {
    /// Serialized size in bytes.
    pub store_size: u64,
    /// Bands currently holding a replica.
    pub bands: Vec<Band>,
}

/// The consumed surface of the storage/metadata service.
///
/// One call is one network round-trip; implementations must not fan out per
/// key.  A missing key is reported as `None` in the matching slot.
#[async_trait]
pub trait MetaApi: Send + Sync + 'static {
    async fn get_chunk_meta(
        &self,
        keys: &[ChunkKey],
        fields: &[&str],
    ) -> SchedulingResult<Vec<Option<ChunkMeta>>>;
}

/// Thin client over [`MetaApi`] that turns missing keys into typed errors.
#[derive(Clone)]
pub struct MetaClient {
    api: Arc<dyn MetaApi>,
}

impl MetaClient {
    pub fn new(api: Arc<dyn MetaApi>) -> Self {
        Self { api }
    }

    /// Batched lookup of `keys`, one round-trip.
    ///
    /// # Errors
    /// `ChunkMetaMissing` for the first absent key.  A producer submitting a
    /// graph that references an unregistered chunk is a bug upstream, so the
    /// failure is not retryable.
    pub async fn chunk_metas(
        &self,
        keys: &[ChunkKey],
    ) -> SchedulingResult<HashMap<ChunkKey, ChunkMeta>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let metas = self.api.get_chunk_meta(keys, CHUNK_META_FIELDS).await?;
        if metas.len() != keys.len() {
            return Err(SchedulingError::Internal(format!(
                "metadata service answered {} entries for {} keys",
                metas.len(),
                keys.len()
            )));
        }

        let mut out = HashMap::with_capacity(keys.len());
        for (key, meta) in keys.iter().zip(metas) {
            match meta {
                Some(meta) => {
                    out.insert(key.clone(), meta);
                }
                None => {
                    return Err(SchedulingError::ChunkMetaMissing { key: key.clone() });
                }
            }
        }
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
