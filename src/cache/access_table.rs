// Published, version-stamped snapshot of local cache registrations. A peer
// resolves opaque keys into concrete device addresses by reading this
// buffer instead of round-tripping a request through the FSM.

use crate::cache::entry::CacheEntry;
use crate::common::{CacheId, CacheLayout, CachePlacement, ModelId, ReqId};
use crate::error::{EngineError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub const ACCESS_TABLE_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct KeyRecord {
    pub req_id: ReqId,
    pub model_id: ModelId,
    pub batch_index: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub cache_id: CacheId,
    pub num_tensors: u32,
    pub layout: CacheLayout,
    pub placement: CachePlacement,
    pub stride: u64,
    pub tensor_size: u64,
    pub num_blocks: u64,
    pub addrs: Vec<u64>,
    pub keys: Vec<KeyRecord>,
}

impl EntrySnapshot {
    pub fn from_entry(entry: &CacheEntry, keys: Vec<KeyRecord>) -> Self {
        EntrySnapshot {
            cache_id: entry.cache_id,
            num_tensors: entry.num_tensors,
            layout: entry.layout,
            placement: entry.placement,
            stride: entry.stride,
            tensor_size: entry.tensor_size,
            num_blocks: entry.num_blocks,
            addrs: entry.cache_addrs.clone(),
            keys,
        }
    }
}

fn layout_byte(layout: CacheLayout) -> u8 {
    match layout {
        CacheLayout::Contiguous => 0,
        CacheLayout::Blocks => 1,
        CacheLayout::Mix => 2,
    }
}

fn layout_from_byte(b: u8) -> Result<CacheLayout> {
    match b {
        0 => Ok(CacheLayout::Contiguous),
        1 => Ok(CacheLayout::Blocks),
        2 => Ok(CacheLayout::Mix),
        other => Err(EngineError::ParamInvalid(format!("bad layout byte: {other}"))),
    }
}

/// Encodes `{version, num_entries}` followed by each entry's fixed fields,
/// its tensor addresses, and its key records.
pub fn encode_table(version: u64, entries: &[EntrySnapshot]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(4096);
    buf.put_u64_le(version);
    buf.put_u64_le(entries.len() as u64);
    for entry in entries {
        buf.put_i64_le(entry.cache_id);
        buf.put_u32_le(entry.num_tensors);
        buf.put_u8(layout_byte(entry.layout));
        buf.put_u8(if entry.placement == CachePlacement::Device { 1 } else { 0 });
        buf.put_u64_le(entry.stride);
        buf.put_u64_le(entry.tensor_size);
        buf.put_u64_le(entry.num_blocks);
        for addr in &entry.addrs {
            buf.put_u64_le(*addr);
        }
        buf.put_u32_le(entry.keys.len() as u32);
        for key in &entry.keys {
            buf.put_u64_le(key.req_id);
            buf.put_u64_le(key.model_id);
            buf.put_u64_le(key.batch_index);
            buf.put_u64_le(key.size);
        }
    }
    if buf.len() > ACCESS_TABLE_BUFFER_SIZE {
        return Err(EngineError::ParamInvalid(format!(
            "cache access table snapshot of {} bytes exceeds the {ACCESS_TABLE_BUFFER_SIZE}-byte region",
            buf.len()
        )));
    }
    Ok(buf.freeze())
}

pub fn decode_table(mut bytes: &[u8]) -> Result<(u64, Vec<EntrySnapshot>)> {
    if bytes.remaining() < 16 {
        return Err(EngineError::ParamInvalid("access table header truncated".into()));
    }
    let version = bytes.get_u64_le();
    let num_entries = bytes.get_u64_le();
    let mut entries = Vec::with_capacity(num_entries as usize);
    for _ in 0..num_entries {
        if bytes.remaining() < 8 + 4 + 1 + 1 + 8 + 8 + 8 {
            return Err(EngineError::ParamInvalid("access table entry truncated".into()));
        }
        let cache_id = bytes.get_i64_le();
        let num_tensors = bytes.get_u32_le();
        let layout = layout_from_byte(bytes.get_u8())?;
        let placement = if bytes.get_u8() == 1 {
            CachePlacement::Device
        } else {
            CachePlacement::Host
        };
        let stride = bytes.get_u64_le();
        let tensor_size = bytes.get_u64_le();
        let num_blocks = bytes.get_u64_le();
        if bytes.remaining() < num_tensors as usize * 8 + 4 {
            return Err(EngineError::ParamInvalid("access table addrs truncated".into()));
        }
        let mut addrs = Vec::with_capacity(num_tensors as usize);
        for _ in 0..num_tensors {
            addrs.push(bytes.get_u64_le());
        }
        let num_keys = bytes.get_u32_le();
        if bytes.remaining() < num_keys as usize * 32 {
            return Err(EngineError::ParamInvalid("access table keys truncated".into()));
        }
        let mut keys = Vec::with_capacity(num_keys as usize);
        for _ in 0..num_keys {
            keys.push(KeyRecord {
                req_id: bytes.get_u64_le(),
                model_id: bytes.get_u64_le(),
                batch_index: bytes.get_u64_le(),
                size: bytes.get_u64_le(),
            });
        }
        entries.push(EntrySnapshot {
            cache_id,
            num_tensors,
            layout,
            placement,
            stride,
            tensor_size,
            num_blocks,
            addrs,
            keys,
        });
    }
    Ok((version, entries))
}

/// Writer-side handle: owns the monotonic version counter and the
/// currently-published payload. `publish` only returns once both have been
/// updated, payload first; a reader that observes version `V` is guaranteed
/// to see the payload that was current as of `V` or later.
pub struct CacheAccessTable {
    version: AtomicU64,
    payload: RwLock<Bytes>,
}

impl Default for CacheAccessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheAccessTable {
    pub fn new() -> Self {
        CacheAccessTable {
            version: AtomicU64::new(0),
            payload: RwLock::new(Bytes::new()),
        }
    }

    pub fn publish(&self, entries: &[EntrySnapshot]) -> Result<u64> {
        let next_version = self.version.load(Ordering::SeqCst) + 1;
        let payload = encode_table(next_version, entries)?;
        *self.payload.write() = payload;
        self.version.store(next_version, Ordering::SeqCst);
        Ok(next_version)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Bytes {
        self.payload.read().clone()
    }
}

/// Reader-side handle, held by a peer link: caches the last-seen version so
/// it only re-deserializes when the version has actually advanced.
#[derive(Default)]
pub struct CacheAccessTableView {
    last_seen_version: u64,
    entries_by_id: HashMap<CacheId, EntrySnapshot>,
}

impl CacheAccessTableView {
    pub fn refresh(&mut self, raw: &[u8]) -> Result<bool> {
        let (version, entries) = decode_table(raw)?;
        if version == self.last_seen_version {
            return Ok(false);
        }
        self.last_seen_version = version;
        self.entries_by_id = entries.into_iter().map(|e| (e.cache_id, e)).collect();
        Ok(true)
    }

    pub fn version(&self) -> u64 {
        self.last_seen_version
    }

    pub fn get(&self, cache_id: CacheId) -> Option<&EntrySnapshot> {
        self.entries_by_id.get(&cache_id)
    }
}
