//! Integration tests for the chunked cache engine.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use kv_blend_cache::cache::{
    CacheEngine, CacheEngineKey, KvLayout, KvTensors, RetrievedKv, TokenHasher, TokenId,
};
use kv_blend_cache::config::{EngineConfig, EngineMetadata};
use kv_blend_cache::error::CacheError;
use kv_blend_cache::storage::{LocalMemoryBackend, StorageBackend};

const NUM_LAYERS: usize = 4;
const NUM_HEADS: usize = 2;
const HEAD_SIZE: usize = 8;

fn metadata(fmt: KvLayout) -> EngineMetadata {
    EngineMetadata::new(
        "test_model",
        3,
        123,
        fmt,
        DType::F32,
        vec![NUM_LAYERS, 2, 256, NUM_HEADS, HEAD_SIZE],
    )
}

fn engine_with_backend(fmt: KvLayout, chunk_size: usize) -> (CacheEngine, Arc<LocalMemoryBackend>) {
    let backend = Arc::new(LocalMemoryBackend::new(1 << 30));
    let config = EngineConfig {
        chunk_size,
        ..EngineConfig::default()
    };
    let engine = CacheEngine::new(config, metadata(fmt), backend.clone()).unwrap();
    (engine, backend)
}

fn engine(fmt: KvLayout) -> CacheEngine {
    engine_with_backend(fmt, 256).0
}

fn generate_kv(num_tokens: usize, fmt: KvLayout) -> KvTensors {
    let shape = match fmt {
        KvLayout::Vllm => (num_tokens, NUM_HEADS, HEAD_SIZE),
        KvLayout::HuggingFace => (NUM_HEADS, num_tokens, HEAD_SIZE),
    };
    (0..NUM_LAYERS)
        .map(|_| {
            (
                Tensor::rand(0f32, 1f32, shape, &Device::Cpu).unwrap(),
                Tensor::rand(0f32, 1f32, shape, &Device::Cpu).unwrap(),
            )
        })
        .collect()
}

fn generate_tokens(num_tokens: usize, seed: u32) -> Vec<TokenId> {
    (0..num_tokens as u32)
        .map(|i| (i.wrapping_mul(2_654_435_761).wrapping_add(seed) >> 8) % 10_000)
        .collect()
}

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

/// Assert tokens `[start, end)` of `left` equal tokens `[0, end - start)` of `right`.
fn check_kv_equal(left: &KvTensors, right: &KvTensors, start: usize, end: usize, fmt: KvLayout) {
    let dim = fmt.token_dim();
    assert_eq!(left.len(), right.len());
    for ((lk, lv), (rk, rv)) in left.iter().zip(right) {
        assert_eq!(
            values(&lk.narrow(dim, start, end - start).unwrap()),
            values(&rk.narrow(dim, 0, end - start).unwrap())
        );
        assert_eq!(
            values(&lv.narrow(dim, start, end - start).unwrap()),
            values(&rv.narrow(dim, 0, end - start).unwrap())
        );
    }
}

fn nested(kv: Option<RetrievedKv>) -> KvTensors {
    match kv {
        Some(RetrievedKv::Nested(kv)) => kv,
        other => panic!("expected nested KV, got {other:?}"),
    }
}

#[test]
fn test_store_retrieve_full() {
    for fmt in [KvLayout::Vllm, KvLayout::HuggingFace] {
        let engine = engine(fmt);
        let tokens = generate_tokens(1000, 1);
        let kv = generate_kv(1000, fmt);

        let stored = engine.store(&tokens, &kv, None, true, true).unwrap();
        assert_eq!(stored, 4);

        let retrieval = engine.retrieve(&tokens, None, true).unwrap();
        assert!(retrieval.ret_mask.iter().all(|m| *m));
        let retrieved = nested(retrieval.kv);
        assert_eq!(retrieved[0].0.dim(fmt.token_dim()).unwrap(), 1000);
        check_kv_equal(&kv, &retrieved, 0, 1000, fmt);
    }
}

#[test]
fn test_retrieve_stacked() {
    let engine = engine(KvLayout::HuggingFace);
    let tokens = generate_tokens(300, 2);
    let kv = generate_kv(300, KvLayout::HuggingFace);
    engine.store(&tokens, &kv, None, true, true).unwrap();

    let retrieval = engine.retrieve(&tokens, None, false).unwrap();
    match retrieval.kv {
        Some(RetrievedKv::Stacked(blob)) => {
            assert_eq!(blob.dims(), &[NUM_LAYERS, 2, NUM_HEADS, 300, HEAD_SIZE]);
            let back = engine.codec().stacked_to_nested(&blob).unwrap();
            check_kv_equal(&kv, &back, 0, 300, KvLayout::HuggingFace);
        }
        other => panic!("expected stacked KV, got {other:?}"),
    }
}

#[test]
fn test_partial_prefix_stops_at_first_miss() {
    let fmt = KvLayout::Vllm;
    let (engine, backend) = engine_with_backend(fmt, 256);
    let tokens = generate_tokens(1000, 3);
    let kv = generate_kv(1000, fmt);

    // Chunks 0 and 1 through the engine.
    let prefix_kv: KvTensors = kv
        .iter()
        .map(|(k, v)| (k.narrow(0, 0, 512).unwrap(), v.narrow(0, 0, 512).unwrap()))
        .collect();
    engine
        .store(&tokens[..512], &prefix_kv, None, true, true)
        .unwrap();

    // Chunk 3 planted directly; chunk 2 stays missing.
    let hashes: Vec<_> = TokenHasher::new(256).unwrap().prefix_hashes(&tokens).collect();
    let key = CacheEngineKey {
        fmt,
        model_name: "test_model".into(),
        world_size: 3,
        worker_id: 123,
        chunk_hash: hashes[3].clone(),
    };
    let blob = engine
        .codec()
        .nested_to_stacked(&generate_kv(232, fmt))
        .unwrap();
    backend.batched_put(vec![(key, blob)], true).unwrap();

    let retrieval = engine.retrieve(&tokens, None, true).unwrap();
    assert_eq!(retrieval.num_hit_tokens(), 512);
    assert!(retrieval.ret_mask[..512].iter().all(|m| *m));
    assert!(retrieval.ret_mask[512..].iter().all(|m| !*m));
    check_kv_equal(&kv, &nested(retrieval.kv), 0, 512, fmt);
}

#[test]
fn test_retrieve_miss_is_empty() {
    let engine = engine(KvLayout::Vllm);
    let tokens = generate_tokens(100, 4);
    let retrieval = engine.retrieve(&tokens, None, true).unwrap();
    assert!(retrieval.kv.is_none());
    assert_eq!(retrieval.ret_mask, vec![false; 100]);

    let stats = engine.stats();
    assert_eq!(stats.hit_tokens, 0);
    assert_eq!(stats.miss_tokens, 100);
    assert_eq!(stats.hit_rate, 0.0);
}

#[test]
fn test_hit_rate() {
    let engine = engine(KvLayout::Vllm);
    let tokens = generate_tokens(512, 5);
    engine
        .store(&tokens[..256], &generate_kv(256, KvLayout::Vllm), None, true, true)
        .unwrap();

    engine.retrieve(&tokens, None, true).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.hit_tokens, 256);
    assert_eq!(stats.miss_tokens, 256);
    assert!((stats.hit_rate - 0.5).abs() < 1e-12);
}

#[test]
fn test_lookup() {
    let engine = engine(KvLayout::Vllm);
    let tokens = generate_tokens(1000, 6);
    assert_eq!(engine.lookup(&tokens).unwrap(), 0);

    let kv = generate_kv(512, KvLayout::Vllm);
    engine.store(&tokens[..512], &kv, None, true, true).unwrap();
    assert_eq!(engine.lookup(&tokens).unwrap(), 512);
    assert_eq!(engine.lookup(&tokens[..700]).unwrap(), 512);
    assert_eq!(engine.lookup(&tokens[..200]).unwrap(), 0);

    engine
        .store(&tokens, &generate_kv(1000, KvLayout::Vllm), None, true, true)
        .unwrap();
    let cached = engine.lookup(&tokens).unwrap();
    assert_eq!(cached, 1000);
    assert!(cached <= tokens.len());
}

#[test]
fn test_store_and_retrieve_with_mask() {
    let fmt = KvLayout::HuggingFace;
    let engine = engine(fmt);
    let tokens = generate_tokens(1000, 7);
    let mut mask = vec![true; 1000];
    mask[..256].fill(false);
    let kv = generate_kv(744, fmt);

    assert_eq!(engine.store(&tokens, &kv, Some(mask.as_slice()), true, true).unwrap(), 3);

    let retrieval = engine.retrieve(&tokens, Some(mask.as_slice()), true).unwrap();
    assert!(retrieval.ret_mask[..256].iter().all(|m| !*m));
    assert!(retrieval.ret_mask[256..].iter().all(|m| *m));
    check_kv_equal(&kv, &nested(retrieval.kv), 0, 744, fmt);

    // The masked-out chunk was never stored.
    assert_eq!(engine.lookup(&tokens).unwrap(), 0);
}

#[test]
fn test_retrieve_with_unaligned_mask_trims_first_chunk() {
    let fmt = KvLayout::Vllm;
    let engine = engine(fmt);
    let tokens = generate_tokens(1000, 8);
    let kv = generate_kv(1000, fmt);
    engine.store(&tokens, &kv, None, true, true).unwrap();

    let mut mask = vec![true; 1000];
    mask[..300].fill(false);
    let retrieval = engine.retrieve(&tokens, Some(mask.as_slice()), true).unwrap();
    assert_eq!(retrieval.num_hit_tokens(), 700);
    assert!(retrieval.ret_mask[..300].iter().all(|m| !*m));

    let retrieved = nested(retrieval.kv);
    assert_eq!(retrieved[0].0.dim(0).unwrap(), 700);
    check_kv_equal(&kv, &retrieved, 300, 1000, fmt);
}

#[test]
fn test_store_rejects_bad_masks() {
    let fmt = KvLayout::Vllm;
    let engine = engine(fmt);
    let tokens = generate_tokens(512, 9);

    // Leading false run not chunk aligned.
    let mut mask = vec![true; 512];
    mask[..100].fill(false);
    let result = engine.store(&tokens, &generate_kv(412, fmt), Some(mask.as_slice()), true, true);
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));

    // Not a suffix mask.
    let mut mask = vec![true; 512];
    mask[300] = false;
    let result = engine.store(&tokens, &generate_kv(511, fmt), Some(mask.as_slice()), true, true);
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));

    // Mask length mismatch.
    let result = engine.store(&tokens, &generate_kv(512, fmt), Some(&[true; 10][..]), true, true);
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));

    // KV token count mismatch.
    let result = engine.store(&tokens, &generate_kv(500, fmt), None, true, true);
    assert!(matches!(result, Err(CacheError::InvalidArgument(_))));

    // Nothing was written.
    assert_eq!(engine.lookup(&tokens).unwrap(), 0);
}

#[test]
fn test_skip_existing() {
    let fmt = KvLayout::Vllm;
    let engine = engine(fmt);
    let tokens = generate_tokens(1000, 10);
    let kv = generate_kv(1000, fmt);

    let prefix_kv: KvTensors = kv
        .iter()
        .map(|(k, v)| (k.narrow(0, 0, 512).unwrap(), v.narrow(0, 0, 512).unwrap()))
        .collect();
    assert_eq!(engine.store(&tokens[..512], &prefix_kv, None, true, true).unwrap(), 2);
    assert_eq!(engine.store(&tokens, &kv, None, true, true).unwrap(), 2);
    assert_eq!(engine.store(&tokens, &kv, None, true, true).unwrap(), 0);
    assert_eq!(engine.store(&tokens, &kv, None, false, true).unwrap(), 4);

    let retrieval = engine.retrieve(&tokens, None, true).unwrap();
    check_kv_equal(&kv, &nested(retrieval.kv), 0, 1000, fmt);
}

#[test]
fn test_non_blocking_store() {
    let fmt = KvLayout::Vllm;
    let engine = engine(fmt);
    let tokens = generate_tokens(600, 11);
    let kv = generate_kv(600, fmt);
    assert_eq!(engine.store(&tokens, &kv, None, true, false).unwrap(), 3);
    assert_eq!(engine.lookup(&tokens).unwrap(), 600);
}

#[test]
fn test_different_metadata_does_not_share_chunks() {
    let backend = Arc::new(LocalMemoryBackend::new(1 << 30));
    let a = CacheEngine::new(
        EngineConfig::default(),
        metadata(KvLayout::Vllm),
        backend.clone(),
    )
    .unwrap();
    let mut other = metadata(KvLayout::Vllm);
    other.worker_id = 0;
    let b = CacheEngine::new(EngineConfig::default(), other, backend).unwrap();

    let tokens = generate_tokens(256, 12);
    a.store(&tokens, &generate_kv(256, KvLayout::Vllm), None, true, true)
        .unwrap();
    assert_eq!(a.lookup(&tokens).unwrap(), 256);
    assert_eq!(b.lookup(&tokens).unwrap(), 0);
}

#[test]
fn test_close() {
    let engine = engine(KvLayout::Vllm);
    engine.close().unwrap();
    engine.close().unwrap();
    assert!(engine.is_closed());
    assert!(matches!(
        engine.lookup(&[1, 2, 3]),
        Err(CacheError::InvalidState(_))
    ));
}
