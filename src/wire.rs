// Bit-exact wire layouts. All integers are little-endian. Encoding is
// hand-rolled (not `serde`) because these buffers are written directly
// into pre-registered request/response slots and read back by a peer that
// only knows the byte layout, not a Rust type: the same constraint a
// `rac::interconnect` message envelope works under, hand-packing into
// `BytesMut` with `Buf`/`BufMut` rather than going through `serde_json`.

use crate::common::{CacheId, ModelId, ReqId};
use crate::error::{EngineError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const REQUEST_SLOT_SIZE: usize = 112 * 1024;
pub const RESPONSE_SLOT_SIZE: usize = 16 * 1024;
pub const FLAG_REGION_SIZE: usize = 8; // flag:u8, _pad:u56

/// One destination pointer, or one block-index/length pair, depending on
/// its position in the `TransferCacheReq` tail layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub block_start_index: u64,
    pub buffer_len: u64,
}

#[derive(Debug, Clone)]
pub struct TransferCacheReq {
    pub is_pull_block: bool,
    pub num_tensors: u32,
    pub cache_id: CacheId,
    pub batch_index: u64,
    pub req_id: ReqId,
    pub prefix_id: u64,
    pub model_id: ModelId,
    pub block_size: u64,
    pub pull_size: u64,
    pub max_block_index: u64,
    pub dst_placement: i32,
    pub timeout_in_ms: i32,
    pub dst_addr_count: u32,
    pub dst_buffer_size: u64,
    pub buffer_info_count: u32,
    pub src_tensor_indices_size: u32,
    pub src_tensor_start_index: u32,
    /// `dst_addr_count` raw destination pointers.
    pub dst_addrs: Vec<u64>,
    /// `buffer_info_count` source block descriptors.
    pub src_buffer_infos: Vec<BufferInfo>,
    /// `buffer_info_count` destination block descriptors.
    pub dst_buffer_infos: Vec<BufferInfo>,
}

const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 8 + 4 + 4 + 4 + 8 + 4 + 4 + 4;

impl TransferCacheReq {
    pub fn encode(&self) -> Result<Bytes> {
        let tail_len = (self.dst_addrs.len() * 8) + (self.src_buffer_infos.len() * 16)
            + (self.dst_buffer_infos.len() * 16);
        let total = HEADER_LEN + tail_len;
        if total + FLAG_REGION_SIZE > REQUEST_SLOT_SIZE {
            return Err(EngineError::ParamInvalid(format!(
                "request of {total} bytes exceeds the {REQUEST_SLOT_SIZE}-byte request slot"
            )));
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(self.is_pull_block as u32);
        buf.put_u32_le(self.num_tensors);
        buf.put_i64_le(self.cache_id);
        buf.put_u64_le(self.batch_index);
        buf.put_u64_le(self.req_id);
        buf.put_u64_le(self.prefix_id);
        buf.put_u64_le(self.model_id);
        buf.put_u64_le(self.block_size);
        buf.put_u64_le(self.pull_size);
        buf.put_u64_le(self.max_block_index);
        buf.put_i32_le(self.dst_placement);
        buf.put_i32_le(self.timeout_in_ms);
        buf.put_u32_le(self.dst_addr_count);
        buf.put_u64_le(self.dst_buffer_size);
        buf.put_u32_le(self.buffer_info_count);
        buf.put_u32_le(self.src_tensor_indices_size);
        buf.put_u32_le(self.src_tensor_start_index);
        for addr in &self.dst_addrs {
            buf.put_u64_le(*addr);
        }
        for info in &self.src_buffer_infos {
            buf.put_u64_le(info.block_start_index);
            buf.put_u64_le(info.buffer_len);
        }
        for info in &self.dst_buffer_infos {
            buf.put_u64_le(info.block_start_index);
            buf.put_u64_le(info.buffer_len);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(EngineError::ParamInvalid("request header truncated".into()));
        }
        let is_pull_block = bytes.get_u32_le() != 0;
        let num_tensors = bytes.get_u32_le();
        let cache_id = bytes.get_i64_le();
        let batch_index = bytes.get_u64_le();
        let req_id = bytes.get_u64_le();
        let prefix_id = bytes.get_u64_le();
        let model_id = bytes.get_u64_le();
        let block_size = bytes.get_u64_le();
        let pull_size = bytes.get_u64_le();
        let max_block_index = bytes.get_u64_le();
        let dst_placement = bytes.get_i32_le();
        let timeout_in_ms = bytes.get_i32_le();
        let dst_addr_count = bytes.get_u32_le();
        let dst_buffer_size = bytes.get_u64_le();
        let buffer_info_count = bytes.get_u32_le();
        let src_tensor_indices_size = bytes.get_u32_le();
        let src_tensor_start_index = bytes.get_u32_le();

        let need = (dst_addr_count as usize * 8) + (buffer_info_count as usize * 16 * 2);
        if bytes.remaining() < need {
            return Err(EngineError::ParamInvalid("request tail truncated".into()));
        }
        let mut dst_addrs = Vec::with_capacity(dst_addr_count as usize);
        for _ in 0..dst_addr_count {
            dst_addrs.push(bytes.get_u64_le());
        }
        let mut src_buffer_infos = Vec::with_capacity(buffer_info_count as usize);
        for _ in 0..buffer_info_count {
            src_buffer_infos.push(BufferInfo {
                block_start_index: bytes.get_u64_le(),
                buffer_len: bytes.get_u64_le(),
            });
        }
        let mut dst_buffer_infos = Vec::with_capacity(buffer_info_count as usize);
        for _ in 0..buffer_info_count {
            dst_buffer_infos.push(BufferInfo {
                block_start_index: bytes.get_u64_le(),
                buffer_len: bytes.get_u64_le(),
            });
        }

        Ok(TransferCacheReq {
            is_pull_block,
            num_tensors,
            cache_id,
            batch_index,
            req_id,
            prefix_id,
            model_id,
            block_size,
            pull_size,
            max_block_index,
            dst_placement,
            timeout_in_ms,
            dst_addr_count,
            dst_buffer_size,
            buffer_info_count,
            src_tensor_indices_size,
            src_tensor_start_index,
            dst_addrs,
            src_buffer_infos,
            dst_buffer_infos,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResponseInfo {
    pub req_id: ReqId,
    pub model_id: ModelId,
    pub ret_code: i32,
    pub transfer_count: u32,
    pub block_size: u32,
    pub sync_flag_addresses: Vec<u64>,
}

impl ResponseInfo {
    pub fn success(req_id: ReqId, model_id: ModelId, transfer_count: u32, block_size: u32) -> Self {
        ResponseInfo {
            req_id,
            model_id,
            ret_code: 0,
            transfer_count,
            block_size,
            sync_flag_addresses: Vec::new(),
        }
    }

    pub fn failure(req_id: ReqId, model_id: ModelId, err: &EngineError) -> Self {
        ResponseInfo {
            req_id,
            model_id,
            ret_code: err.ret_code(),
            transfer_count: 0,
            block_size: 0,
            sync_flag_addresses: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let total = 8 + 8 + 4 + 4 + 4 + 4 + self.sync_flag_addresses.len() * 8;
        if total + FLAG_REGION_SIZE > RESPONSE_SLOT_SIZE {
            return Err(EngineError::ParamInvalid(format!(
                "response of {total} bytes exceeds the {RESPONSE_SLOT_SIZE}-byte response slot"
            )));
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u64_le(self.req_id);
        buf.put_u64_le(self.model_id);
        buf.put_i32_le(self.ret_code);
        buf.put_u32_le(self.transfer_count);
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.sync_flag_addresses.len() as u32);
        for addr in &self.sync_flag_addresses {
            buf.put_u64_le(*addr);
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.remaining() < 28 {
            return Err(EngineError::ParamInvalid("response truncated".into()));
        }
        let req_id = bytes.get_u64_le();
        let model_id = bytes.get_u64_le();
        let ret_code = bytes.get_i32_le();
        let transfer_count = bytes.get_u32_le();
        let block_size = bytes.get_u32_le();
        let count = bytes.get_u32_le();
        if bytes.remaining() < count as usize * 8 {
            return Err(EngineError::ParamInvalid("response sync flag tail truncated".into()));
        }
        let mut sync_flag_addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            sync_flag_addresses.push(bytes.get_u64_le());
        }
        Ok(ResponseInfo {
            req_id,
            model_id,
            ret_code,
            transfer_count,
            block_size,
            sync_flag_addresses,
        })
    }

    pub fn ok(&self) -> bool {
        self.ret_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = TransferCacheReq {
            is_pull_block: false,
            num_tensors: 8,
            cache_id: 3,
            batch_index: 1,
            req_id: 42,
            prefix_id: crate::common::NOT_A_PREFIX,
            model_id: 7,
            block_size: 0,
            pull_size: 512,
            max_block_index: 0,
            dst_placement: 1,
            timeout_in_ms: 1000,
            dst_addr_count: 2,
            dst_buffer_size: 0,
            buffer_info_count: 1,
            src_tensor_indices_size: 0,
            src_tensor_start_index: 0,
            dst_addrs: vec![0x1000, 0x2000],
            src_buffer_infos: vec![BufferInfo { block_start_index: 0, buffer_len: 512 }],
            dst_buffer_infos: vec![BufferInfo { block_start_index: 0, buffer_len: 512 }],
        };
        let encoded = req.encode().unwrap();
        let decoded = TransferCacheReq::decode(&encoded).unwrap();
        assert_eq!(decoded.cache_id, 3);
        assert_eq!(decoded.dst_addrs, vec![0x1000, 0x2000]);
        assert_eq!(decoded.src_buffer_infos[0].buffer_len, 512);
    }

    #[test]
    fn oversized_request_rejected() {
        let req = TransferCacheReq {
            is_pull_block: false,
            num_tensors: 1,
            cache_id: 0,
            batch_index: 0,
            req_id: 0,
            prefix_id: crate::common::NOT_A_PREFIX,
            model_id: 0,
            block_size: 0,
            pull_size: 0,
            max_block_index: 0,
            dst_placement: 0,
            timeout_in_ms: 0,
            dst_addr_count: 0,
            dst_buffer_size: 0,
            buffer_info_count: (REQUEST_SLOT_SIZE / 16) as u32 + 1,
            src_tensor_indices_size: 0,
            src_tensor_start_index: 0,
            dst_addrs: vec![],
            src_buffer_infos: vec![
                BufferInfo { block_start_index: 0, buffer_len: 0 };
                (REQUEST_SLOT_SIZE / 16) + 1
            ],
            dst_buffer_infos: vec![
                BufferInfo { block_start_index: 0, buffer_len: 0 };
                (REQUEST_SLOT_SIZE / 16) + 1
            ],
        };
        assert!(req.encode().is_err());
    }

    #[test]
    fn response_round_trips() {
        let resp = ResponseInfo {
            req_id: 1,
            model_id: 2,
            ret_code: 0,
            transfer_count: 4,
            block_size: 128,
            sync_flag_addresses: vec![0xAAAA, 0xBBBB],
        };
        let encoded = resp.encode().unwrap();
        let decoded = ResponseInfo::decode(&encoded).unwrap();
        assert!(decoded.ok());
        assert_eq!(decoded.sync_flag_addresses, vec![0xAAAA, 0xBBBB]);
    }
}
