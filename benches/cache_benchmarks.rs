//! Cache benchmarks for stowage

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use std::hint::black_box;
use std::time::Duration;

use stowage::{
    CacheConfig, CacheManager, HashMode, InMemoryCache, KeyCodec, Serializer, SerializerFormat,
    TagMode,
};

fn manager(config: &CacheConfig) -> CacheManager<InMemoryCache> {
    CacheManager::with_config(InMemoryCache::new(), config).unwrap()
}

fn key_codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_codec");
    group.throughput(Throughput::Elements(1));

    for mode in [HashMode::None, HashMode::Md5, HashMode::Sha1] {
        let codec = KeyCodec::new(Some("app"), mode, HashMode::None);
        group.bench_function(format!("prepare_key_{}", mode), |b| {
            b.iter(|| black_box(codec.prepare_key(black_box("user:12345:profile"))));
        });
    }

    let codec = KeyCodec::default();
    group.bench_function("prepare_tags_5", |b| {
        b.iter(|| black_box(codec.prepare_tags(&["users", "orders", "admin", "users", "eu"])));
    });

    group.finish();
}

fn serializer_benchmark(c: &mut Criterion) {
    let value = json!({
        "id": 42,
        "name": "Alice",
        "roles": ["admin", "editor"],
        "settings": {"theme": "dark", "notifications": true}
    });

    let mut group = c.benchmark_group("serializer");

    for format in [SerializerFormat::Native, SerializerFormat::Json] {
        let serializer = Serializer::new(format);
        let encoded = serializer.encode(&value).unwrap();

        group.bench_function(format!("encode_{}", format), |b| {
            b.iter(|| black_box(serializer.encode(black_box(&value)).unwrap()));
        });

        group.bench_function(format!("decode_{}", format), |b| {
            b.iter(|| {
                black_box(
                    serializer
                        .decode(black_box(&encoded), stowage::DecodeMode::Strict)
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn cache_set_get_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = manager(&CacheConfig::memory());

    rt.block_on(async {
        cache
            .set("existing_key", "existing_value", None, &[])
            .await
            .unwrap();
    });

    let mut group = c.benchmark_group("cache_ops");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_no_ttl", |b| {
        b.to_async(&rt).iter(|| async {
            cache
                .set("benchmark_key", "benchmark_value", None, &[])
                .await
                .unwrap();
        });
    });

    group.bench_function("set_with_ttl", |b| {
        b.to_async(&rt).iter(|| async {
            cache
                .set(
                    "benchmark_key",
                    "benchmark_value",
                    Some(Duration::from_secs(60)),
                    &[],
                )
                .await
                .unwrap();
        });
    });

    group.bench_function("get_hit", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.get("existing_key").await.unwrap()) });
    });

    group.bench_function("get_miss", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(cache.get("missing_key").await.is_err()) });
    });

    group.bench_function("increment", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(cache.increment("counter", 1, None, true).await.unwrap())
        });
    });

    group.finish();
}

fn tag_mode_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("tag_invalidation");

    for members in [10usize, 100] {
        for mode in [TagMode::KeyList, TagMode::Versioning] {
            let cache = manager(&CacheConfig::memory().with_tag_mode(mode));
            let keys: Vec<String> = (0..members).map(|i| format!("tagged_{}", i)).collect();

            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", mode), members),
                &members,
                |b, _| {
                    b.to_async(&rt).iter(|| async {
                        for key in &keys {
                            cache.set(key, &1, None, &["group"]).await.unwrap();
                        }
                        black_box(cache.remove_tag("group").await.unwrap())
                    });
                },
            );
        }
    }

    group.finish();
}

fn lock_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = manager(&CacheConfig::memory());

    c.bench_function("lock_unlock", |b| {
        b.to_async(&rt).iter(|| async {
            assert!(cache.lock_with("job", 0).await.unwrap());
            black_box(cache.unlock("job").await.unwrap())
        });
    });
}

criterion_group!(
    benches,
    key_codec_benchmark,
    serializer_benchmark,
    cache_set_get_benchmark,
    tag_mode_benchmark,
    lock_benchmark,
);

criterion_main!(benches);
