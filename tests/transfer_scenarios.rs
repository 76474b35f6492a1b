// End-to-end exercises of the FSM-mediated transfer path against the
// simulated fabric/accelerator backends, covering the scenario classes the
// engine is expected to handle correctly: a plain contiguous pull, a blocked
// pull that remaps block indices, a device-to-host pull staged through a
// bounce buffer, a tensor-subset ("layer-range") pull, a pull built from
// thousands of non-mergeable descriptors, and timeout-then-recovery on one
// link.

use kv_transfer_engine::cache::CacheEntry;
use kv_transfer_engine::comm::Mailbox;
use kv_transfer_engine::common::{CacheLayout, CachePlacement, NOT_A_PREFIX};
use kv_transfer_engine::fabric::sim::{SimAccelerator, SimFabric};
use kv_transfer_engine::wire::{BufferInfo, TransferCacheReq};
use kv_transfer_engine::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn opts(extra: &[(&str, &str)]) -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("device_id".into(), "0".into());
    m.insert("mem_pool_config".into(), r#"{"memory_size": 1048576}"#.into());
    for (k, v) in extra {
        m.insert((*k).into(), (*v).into());
    }
    m
}

/// Links `owner` and `requester` over a shared mailbox: `owner` is the side
/// that actually executes inbound jobs, `requester` only posts requests and
/// waits on responses (`responds_to_requests` split, see `comm::entity`).
fn linked_pair(
    owner_opts: &HashMap<String, String>,
    requester_opts: &HashMap<String, String>,
) -> (Engine, Engine, Arc<SimAccelerator>, Arc<SimAccelerator>) {
    let owner_accel = Arc::new(SimAccelerator::new());
    let requester_accel = Arc::new(SimAccelerator::new());
    let owner_fabric = Arc::new(SimFabric::new(owner_accel.clone()));
    owner_fabric.register_peer(1, 0, requester_accel.clone());
    let requester_fabric = Arc::new(SimFabric::new(requester_accel.clone()));
    requester_fabric.register_peer(2, 0, owner_accel.clone());

    let owner = Engine::initialize(owner_opts, owner_fabric, owner_accel.clone()).unwrap();
    let requester =
        Engine::initialize(requester_opts, requester_fabric, requester_accel.clone()).unwrap();

    let mailbox = Arc::new(Mailbox::default());
    owner.link_with_mailbox(2, 0, mailbox.clone(), true).unwrap();
    requester.link_with_mailbox(1, 0, mailbox, false).unwrap();
    (owner, requester, owner_accel, requester_accel)
}

fn i32s_to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes.chunks(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
}

#[test]
fn scenario_1_contiguous_pull_lands_only_in_the_target_row() {
    let (owner, requester, owner_accel, requester_accel) = linked_pair(&opts(&[]), &opts(&[]));

    // Each tensor has 4 rows on the owner's side; `batch_index` alone
    // selects which row is the pull's source, and `dst_buffer_infos`'
    // `block_start_index` independently selects which row of the
    // requester's destination buffer it lands in.
    let row_bytes = 16u64; // 4 x i32
    let t0_src = owner_accel.alloc(row_bytes * 4);
    let t1_src = owner_accel.alloc(row_bytes * 4);
    for row in 0..4u64 {
        let values = [10 * row as i32 + 1, 10 * row as i32 + 2, 10 * row as i32 + 3, 10 * row as i32 + 4];
        owner_accel.write(t0_src + row * row_bytes, &i32s_to_bytes(&values));
        let values = [100 + 10 * row as i32 + 1, 100 + 10 * row as i32 + 2, 100 + 10 * row as i32 + 3, 100 + 10 * row as i32 + 4];
        owner_accel.write(t1_src + row * row_bytes, &i32s_to_bytes(&values));
    }

    let t0_dst = requester_accel.alloc(row_bytes * 4);
    let t1_dst = requester_accel.alloc(row_bytes * 4);

    let cache_id = owner
        .register_cache(CacheEntry {
            cache_id: 0,
            placement: CachePlacement::Device,
            layout: CacheLayout::Contiguous,
            num_tensors: 2,
            cache_addrs: vec![t0_src, t1_src],
            tensor_size: row_bytes * 4,
            batch_size: 4,
            num_blocks: 0,
            stride: row_bytes,
            is_owned: false,
            remote_accessible: true,
            id_to_batch_index_and_size: HashMap::new(),
        })
        .unwrap();

    let req = TransferCacheReq {
        is_pull_block: false,
        num_tensors: 2,
        cache_id,
        batch_index: 2,
        req_id: 1,
        prefix_id: NOT_A_PREFIX,
        model_id: 0,
        block_size: 0,
        pull_size: row_bytes,
        max_block_index: 0,
        dst_placement: CachePlacement::Device.to_wire(),
        timeout_in_ms: 2000,
        dst_addr_count: 2,
        dst_buffer_size: row_bytes,
        buffer_info_count: 1,
        src_tensor_indices_size: 0,
        src_tensor_start_index: 0,
        dst_addrs: vec![t0_dst, t1_dst],
        src_buffer_infos: vec![BufferInfo { block_start_index: 0, buffer_len: row_bytes }],
        dst_buffer_infos: vec![BufferInfo { block_start_index: 1, buffer_len: row_bytes }],
    };

    let resp = requester.transfer(2, 0, req, Duration::from_secs(2)).unwrap();
    assert!(resp.ok());

    let t0_rows = bytes_to_i32s(&requester_accel.read(t0_dst, row_bytes * 4));
    assert_eq!(&t0_rows[0..4], &[0, 0, 0, 0], "row 0 must stay untouched");
    assert_eq!(&t0_rows[4..8], &[21, 22, 23, 24], "row 1 must hold source row 2's data");
    assert_eq!(&t0_rows[8..16], &[0, 0, 0, 0, 0, 0, 0, 0], "rows 2-3 must stay untouched");

    let t1_rows = bytes_to_i32s(&requester_accel.read(t1_dst, row_bytes * 4));
    assert_eq!(&t1_rows[4..8], &[121, 122, 123, 124]);
    assert_eq!(&t1_rows[0..4], &[0, 0, 0, 0]);

    owner.finalize().unwrap();
    requester.finalize().unwrap();
}

#[test]
fn scenario_2_blocked_pull_remaps_block_indices() {
    let (owner, requester, owner_accel, requester_accel) = linked_pair(&opts(&[]), &opts(&[]));

    let block_bytes = 16u64; // 4 x i32
    let prompt_blocks = [0u64, 1, 4, 5, 6];
    let decoder_blocks = [1u64, 2, 4, 6, 9];

    let src_base = owner_accel.alloc(block_bytes * 8);
    for (i, &b) in prompt_blocks.iter().enumerate() {
        let values = [40 * i as i32 + 1, 40 * i as i32 + 2, 40 * i as i32 + 3, 40 * i as i32 + 4];
        owner_accel.write(src_base + b * block_bytes, &i32s_to_bytes(&values));
    }
    let dst_base = requester_accel.alloc(block_bytes * 10);

    let cache_id = owner
        .register_cache(CacheEntry {
            cache_id: 0,
            placement: CachePlacement::Device,
            layout: CacheLayout::Blocks,
            num_tensors: 1,
            cache_addrs: vec![src_base],
            tensor_size: block_bytes * 8,
            batch_size: 0,
            num_blocks: 8,
            stride: block_bytes,
            is_owned: false,
            remote_accessible: true,
            id_to_batch_index_and_size: HashMap::new(),
        })
        .unwrap();

    let src_buffer_infos: Vec<BufferInfo> = prompt_blocks
        .iter()
        .map(|&b| BufferInfo { block_start_index: b, buffer_len: block_bytes })
        .collect();
    let dst_buffer_infos: Vec<BufferInfo> = decoder_blocks
        .iter()
        .map(|&b| BufferInfo { block_start_index: b, buffer_len: block_bytes })
        .collect();

    let req = TransferCacheReq {
        is_pull_block: true,
        num_tensors: 1,
        cache_id,
        batch_index: 0,
        req_id: 2,
        prefix_id: NOT_A_PREFIX,
        model_id: 0,
        block_size: block_bytes,
        pull_size: block_bytes * prompt_blocks.len() as u64,
        max_block_index: 7,
        dst_placement: CachePlacement::Device.to_wire(),
        timeout_in_ms: 2000,
        dst_addr_count: 1,
        dst_buffer_size: block_bytes * 10,
        buffer_info_count: src_buffer_infos.len() as u32,
        src_tensor_indices_size: 0,
        src_tensor_start_index: 0,
        dst_addrs: vec![dst_base],
        src_buffer_infos,
        dst_buffer_infos,
    };

    let resp = requester.transfer(2, 0, req, Duration::from_secs(2)).unwrap();
    assert!(resp.ok());

    for (i, (&p, &d)) in prompt_blocks.iter().zip(decoder_blocks.iter()).enumerate() {
        let expected = [40 * i as i32 + 1, 40 * i as i32 + 2, 40 * i as i32 + 3, 40 * i as i32 + 4];
        let got = bytes_to_i32s(&requester_accel.read(dst_base + d * block_bytes, block_bytes));
        assert_eq!(got, expected, "decoder block {d} should mirror prompt block {p}");
    }
    for untouched in [0u64, 3, 5, 7, 8] {
        let got = bytes_to_i32s(&requester_accel.read(dst_base + untouched * block_bytes, block_bytes));
        assert_eq!(got, vec![0, 0, 0, 0], "decoder block {untouched} must stay untouched");
    }

    owner.finalize().unwrap();
    requester.finalize().unwrap();
}

#[test]
fn scenario_3_device_to_host_pull_scatters_blocks_through_a_bounce_buffer() {
    let owner_opts = opts(&[("host_mem_pool_config", r#"{"memory_size": 65536}"#)]);
    let (owner, requester, owner_accel, requester_accel) = linked_pair(&owner_opts, &opts(&[]));

    let block_bytes = 16u64;
    let src_base = owner_accel.alloc(block_bytes * 4);
    for block in 0..4u64 {
        let values = [10 * block as i32 + 1, 10 * block as i32 + 2, 10 * block as i32 + 3, 10 * block as i32 + 4];
        owner_accel.write(src_base + block * block_bytes, &i32s_to_bytes(&values));
    }
    let dst_base = requester_accel.alloc(block_bytes * 8);

    let cache_id = owner
        .register_cache(CacheEntry {
            cache_id: 0,
            placement: CachePlacement::Device,
            layout: CacheLayout::Blocks,
            num_tensors: 1,
            cache_addrs: vec![src_base],
            tensor_size: block_bytes * 4,
            batch_size: 0,
            num_blocks: 4,
            stride: block_bytes,
            is_owned: false,
            remote_accessible: true,
            id_to_batch_index_and_size: HashMap::new(),
        })
        .unwrap();

    let decoder_blocks = [1u64, 3, 5, 7];
    let src_buffer_infos: Vec<BufferInfo> =
        (0..4u64).map(|b| BufferInfo { block_start_index: b, buffer_len: block_bytes }).collect();
    let dst_buffer_infos: Vec<BufferInfo> = decoder_blocks
        .iter()
        .map(|&b| BufferInfo { block_start_index: b, buffer_len: block_bytes })
        .collect();

    let req = TransferCacheReq {
        is_pull_block: true,
        num_tensors: 1,
        cache_id,
        batch_index: 0,
        req_id: 3,
        prefix_id: NOT_A_PREFIX,
        model_id: 0,
        block_size: block_bytes,
        pull_size: block_bytes * 4,
        max_block_index: 3,
        dst_placement: CachePlacement::Host.to_wire(),
        timeout_in_ms: 2000,
        dst_addr_count: 1,
        dst_buffer_size: block_bytes * 8,
        buffer_info_count: 4,
        src_tensor_indices_size: 0,
        src_tensor_start_index: 0,
        dst_addrs: vec![dst_base],
        src_buffer_infos,
        dst_buffer_infos,
    };

    let resp = requester.transfer(2, 0, req, Duration::from_secs(2)).unwrap();
    assert!(resp.ok());

    for (block, &decoder_block) in decoder_blocks.iter().enumerate() {
        let expected =
            [10 * block as i32 + 1, 10 * block as i32 + 2, 10 * block as i32 + 3, 10 * block as i32 + 4];
        let got = bytes_to_i32s(&requester_accel.read(dst_base + decoder_block * block_bytes, block_bytes));
        assert_eq!(got, expected);
    }
    for untouched in [0u64, 2, 4, 6] {
        let got = bytes_to_i32s(&requester_accel.read(dst_base + untouched * block_bytes, block_bytes));
        assert_eq!(got, vec![0, 0, 0, 0]);
    }

    owner.finalize().unwrap();
    requester.finalize().unwrap();
}

#[test]
fn scenario_4_tensor_subset_pull_restricts_to_the_named_layer_range() {
    let (owner, requester, owner_accel, requester_accel) = linked_pair(&opts(&[]), &opts(&[]));

    let row_bytes = 16u64;
    let full_srcs: Vec<u64> = (0..8).map(|_| owner_accel.alloc(row_bytes)).collect();
    for (i, &addr) in full_srcs.iter().enumerate() {
        let v = i as i32;
        owner_accel.write(addr, &i32s_to_bytes(&[v, v, v, v]));
    }
    let full_dsts: Vec<u64> = (0..8).map(|_| requester_accel.alloc(row_bytes)).collect();

    let cache_id = owner
        .register_cache(CacheEntry {
            cache_id: 0,
            placement: CachePlacement::Device,
            layout: CacheLayout::Contiguous,
            num_tensors: 8,
            cache_addrs: full_srcs.clone(),
            tensor_size: row_bytes,
            batch_size: 1,
            num_blocks: 0,
            stride: row_bytes,
            is_owned: false,
            remote_accessible: true,
            id_to_batch_index_and_size: HashMap::new(),
        })
        .unwrap();

    // Restrict the pull to the layer range [2, 6) of the full 8-tensor
    // source: only those 4 tensors should move.
    let req = TransferCacheReq {
        is_pull_block: false,
        num_tensors: 8,
        cache_id,
        batch_index: 0,
        req_id: 4,
        prefix_id: NOT_A_PREFIX,
        model_id: 0,
        block_size: 0,
        pull_size: row_bytes,
        max_block_index: 0,
        dst_placement: CachePlacement::Device.to_wire(),
        timeout_in_ms: 2000,
        dst_addr_count: 4,
        dst_buffer_size: row_bytes,
        buffer_info_count: 1,
        src_tensor_indices_size: 4,
        src_tensor_start_index: 2,
        dst_addrs: full_dsts[2..6].to_vec(),
        src_buffer_infos: vec![BufferInfo { block_start_index: 0, buffer_len: row_bytes }],
        dst_buffer_infos: vec![BufferInfo { block_start_index: 0, buffer_len: row_bytes }],
    };

    let resp = requester.transfer(2, 0, req, Duration::from_secs(2)).unwrap();
    assert!(resp.ok());

    for i in 2..6 {
        let got = bytes_to_i32s(&requester_accel.read(full_dsts[i], row_bytes));
        assert_eq!(got, vec![i as i32; 4], "tensor {i} should have arrived");
    }
    for i in [0usize, 1, 6, 7] {
        let got = bytes_to_i32s(&requester_accel.read(full_dsts[i], row_bytes));
        assert_eq!(got, vec![0, 0, 0, 0], "tensor {i} is outside the restricted range and must stay untouched");
    }

    owner.finalize().unwrap();
    requester.finalize().unwrap();
}

#[test]
fn scenario_5_large_descriptor_count_completes_in_one_pull_across_several_fabric_batches() {
    use kv_transfer_engine::fabric::traits::{Fabric, OneSideOpDesc};
    use kv_transfer_engine::transfer::{DataRange, TaskBatcher};

    const NUM_ELEMENTS: usize = 2048;
    const MAX_OPS_PER_BATCH: usize = 64; // mirrors transfer::d2d::MAX_OPS_PER_BATCH

    let local = Arc::new(SimAccelerator::new());
    let peer = Arc::new(SimAccelerator::new());
    let src_base = local.alloc(NUM_ELEMENTS as u64 * 4);
    let values: Vec<i32> = (0..NUM_ELEMENTS as i32).collect();
    local.write(src_base, &i32s_to_bytes(&values));
    let dst_base = peer.alloc(NUM_ELEMENTS as u64 * 4);

    let fabric = SimFabric::new(local.clone());
    fabric.register_peer(1, 0, peer.clone());
    fabric.comm_init(1, 0).unwrap();

    // Every element is requested as its own reverse-order range, so none of
    // them merge into a larger slice — a worst case for descriptor count,
    // forcing the scheduler to span many `NextBatch`/`batch_put` calls.
    let ranges: Vec<DataRange> = (0..NUM_ELEMENTS)
        .rev()
        .map(|i| DataRange { tensor_index: 0, offset: (i * 4) as u64, len: 4 })
        .collect();
    let mut batcher = TaskBatcher::new(ranges);

    let mut next_batch_calls = 0usize;
    let mut fabric_batch_calls = 0usize;
    let mut total_bytes = 0u64;
    while !batcher.is_done() {
        let slices = batcher.next_batch(None);
        next_batch_calls += 1;
        let ops: Vec<OneSideOpDesc> = slices
            .iter()
            .map(|s| OneSideOpDesc {
                local_addr: src_base + s.data_offset,
                remote_addr: dst_base + s.data_offset,
                len: s.data_size,
            })
            .collect();
        for chunk in ops.chunks(MAX_OPS_PER_BATCH) {
            fabric.comm_prepare(1, 0, chunk.len()).unwrap();
            fabric.batch_put(1, 0, chunk).unwrap();
            fabric_batch_calls += 1;
        }
        total_bytes += ops.iter().map(|op| op.len).sum::<u64>();
    }

    assert_eq!(total_bytes, NUM_ELEMENTS as u64 * 4);
    assert!(next_batch_calls >= 2, "a single NextBatch call must not cover every descriptor");
    assert!(fabric_batch_calls >= 2, "descriptors must span multiple fabric batch_put calls");
    assert_eq!(peer.read(dst_base, NUM_ELEMENTS as u64 * 4), local.read(src_base, NUM_ELEMENTS as u64 * 4));
}

#[test]
fn scenario_6_timeout_then_a_normal_pull_on_the_same_link_succeeds() {
    use kv_transfer_engine::cache::CacheAccessTable;
    use kv_transfer_engine::cache::CacheManager;
    use kv_transfer_engine::comm::{CommEntity, FsmState};
    use kv_transfer_engine::error::EngineError;
    use kv_transfer_engine::fabric::Fabric;

    let local_accel = Arc::new(SimAccelerator::new());
    let peer_accel = Arc::new(SimAccelerator::new());
    let fabric = Arc::new(SimFabric::new(local_accel.clone()));
    fabric.register_peer(1, 0, peer_accel.clone());
    fabric.comm_init(1, 0).unwrap();

    let cache_manager = Arc::new(CacheManager::new(Arc::new(CacheAccessTable::new())));
    let entity = CommEntity::new(
        1,
        0,
        cache_manager.clone(),
        fabric,
        local_accel.clone(),
        None,
        Arc::new(Mailbox::default()),
        true,
    );

    let src_addr = local_accel.alloc(16);
    local_accel.write(src_addr, &i32s_to_bytes(&[1, 2, 3, 4]));
    let dst_addr = peer_accel.alloc(16);

    let cache_id = cache_manager
        .register(CacheEntry {
            cache_id: 0,
            placement: CachePlacement::Device,
            layout: CacheLayout::Contiguous,
            num_tensors: 1,
            cache_addrs: vec![src_addr],
            tensor_size: 16,
            batch_size: 1,
            num_blocks: 0,
            stride: 16,
            is_owned: false,
            remote_accessible: true,
            id_to_batch_index_and_size: HashMap::new(),
        })
        .unwrap();

    let make_req = |req_id: u64, timeout_in_ms: i32| TransferCacheReq {
        is_pull_block: false,
        num_tensors: 1,
        cache_id,
        batch_index: 0,
        req_id,
        prefix_id: NOT_A_PREFIX,
        model_id: 0,
        block_size: 0,
        pull_size: 16,
        max_block_index: 0,
        dst_placement: CachePlacement::Device.to_wire(),
        timeout_in_ms,
        dst_addr_count: 1,
        dst_buffer_size: 16,
        buffer_info_count: 1,
        src_tensor_indices_size: 0,
        src_tensor_start_index: 0,
        dst_addrs: vec![dst_addr],
        src_buffer_infos: vec![BufferInfo { block_start_index: 0, buffer_len: 16 }],
        dst_buffer_infos: vec![BufferInfo { block_start_index: 0, buffer_len: 16 }],
    };

    // A 1ms deadline that we let actually elapse before the entity gets a
    // chance to service the request models an artificially slow responder.
    entity.mailbox().post_request(make_req(10, 1)).unwrap();
    entity.service_tick().unwrap();
    assert_eq!(entity.cur_state(), FsmState::Receiving);
    std::thread::sleep(Duration::from_millis(5));
    entity.service_tick().unwrap();
    assert_eq!(entity.cur_state(), FsmState::Idle, "an expired request returns the entity to Idle");

    let resp = entity.mailbox().take_response().unwrap();
    assert!(!resp.ok());
    assert_eq!(EngineError::from_ret_code(resp.ret_code, "").unwrap().kind(), "Timeout");
    assert!(peer_accel.read(dst_addr, 16).iter().all(|&b| b == 0), "no partial write from the discarded job");

    // A second, normally-timed request on the same link must still succeed.
    entity.mailbox().post_request(make_req(11, 2000)).unwrap();
    entity.service_tick().unwrap();
    assert_eq!(entity.cur_state(), FsmState::Receiving);
    entity.service_tick().unwrap();
    assert_eq!(entity.cur_state(), FsmState::Sending);
    while entity.cur_state() == FsmState::Sending {
        entity.service_tick().unwrap();
    }
    assert_eq!(entity.cur_state(), FsmState::Idle);

    let resp = entity.mailbox().take_response().unwrap();
    assert!(resp.ok());
    assert_eq!(peer_accel.read(dst_addr, 16), i32s_to_bytes(&[1, 2, 3, 4]));
}
