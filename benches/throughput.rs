//! Throughput benchmarks for bulk security operations.
//!
//! Run with: `cargo bench --bench throughput`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use uuid::Uuid;

use aegis_authz::{risk_label, Action, Permission, Resource};
use aegis_core::{Cache, MemoryCache};

/// Generate a permission set resembling a mid-sized role.
fn generate_permissions(count: usize) -> Vec<Permission> {
    let resources = [
        Resource::Account,
        Resource::Portfolio,
        Resource::Transaction,
        Resource::Report,
        Resource::AuditLog,
    ];
    let actions = [
        Action::Read,
        Action::Create,
        Action::Update,
        Action::Transfer,
        Action::Export,
    ];
    let mut rng = rand::thread_rng();

    (0..count)
        .map(|_| {
            let resource = resources[rng.gen_range(0..resources.len())].clone();
            let action = actions[rng.gen_range(0..actions.len())];
            Permission::new(resource, action)
        })
        .collect()
}

/// Generate a batch of decision inputs with random amounts.
fn generate_label_inputs(count: usize) -> Vec<(Resource, Action, Option<Decimal>)> {
    let resources = [
        Resource::Account,
        Resource::Transaction,
        Resource::Report,
        Resource::SystemConfig,
    ];
    let actions = [Action::Read, Action::Update, Action::Transfer, Action::Manage];
    let mut rng = rand::thread_rng();

    (0..count)
        .map(|_| {
            let resource = resources[rng.gen_range(0..resources.len())].clone();
            let action = actions[rng.gen_range(0..actions.len())];
            let amount = Some(Decimal::from(rng.gen_range(1..100_000i64)));
            (resource, action, amount)
        })
        .collect()
}

/// Benchmark scanning a permission set for a grant.
fn bench_bulk_permission_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("permission_checks");

    for permission_count in [10, 50, 100, 500, 1000].iter() {
        let permissions = generate_permissions(*permission_count);

        group.throughput(Throughput::Elements(*permission_count as u64));
        group.bench_with_input(
            BenchmarkId::new("scan_grants", permission_count),
            &permissions,
            |b, permissions| {
                b.iter(|| {
                    let granted: Vec<_> = permissions
                        .iter()
                        .filter(|permission| {
                            permission.grants(&Resource::Transaction, &Action::Transfer)
                        })
                        .collect();
                    black_box(granted)
                })
            },
        );
    }

    group.finish();
}

/// Benchmark labelling batches of access decisions.
fn bench_bulk_risk_labels(c: &mut Criterion) {
    let mut group = c.benchmark_group("risk_labels");

    for input_count in [100, 500, 1000, 5000].iter() {
        let inputs = generate_label_inputs(*input_count);

        group.throughput(Throughput::Elements(*input_count as u64));
        group.bench_with_input(
            BenchmarkId::new("label_batch", input_count),
            &inputs,
            |b, inputs| {
                b.iter(|| {
                    let labels: Vec<_> = inputs
                        .iter()
                        .map(|(resource, action, amount)| {
                            risk_label(resource, action, *amount, 10_000)
                        })
                        .collect();
                    black_box(labels)
                })
            },
        );
    }

    group.finish();
}

/// Benchmark minting batches of access tokens for one session.
fn bench_bulk_token_issuance(c: &mut Criterion) {
    use aegis_auth::{MemorySessionStore, SessionManager, TokenService};
    use aegis_core::config::{SessionConfig, TimeoutConfig, TokenConfig};

    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("token_issuance");

    let sessions = Arc::new(SessionManager::new(
        Arc::new(MemorySessionStore::new()),
        Arc::new(MemoryCache::new()),
        SessionConfig::default(),
        TimeoutConfig::default(),
    ));
    let service = TokenService::new(TokenConfig::default(), sessions.clone());
    let user_id = Uuid::new_v4();
    let session = rt
        .block_on(sessions.create(
            user_id,
            "bench-device",
            "203.0.113.7",
            "bench-agent",
            0.1,
            None,
        ))
        .unwrap();

    for token_count in [100, 500, 1000].iter() {
        group.throughput(Throughput::Elements(*token_count as u64));
        group.bench_with_input(
            BenchmarkId::new("issue_access", token_count),
            token_count,
            |b, &count| {
                b.iter(|| {
                    let tokens: Vec<_> = (0..count)
                        .map(|_| service.issue_access(user_id, &session.session_id).unwrap())
                        .collect();
                    black_box(tokens)
                })
            },
        );
    }

    group.finish();
}

/// Benchmark validating batches of live sessions against the cache mirror.
fn bench_bulk_session_validation(c: &mut Criterion) {
    use aegis_auth::{MemorySessionStore, SessionManager};
    use aegis_core::config::{SessionConfig, TimeoutConfig};

    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("session_validation");

    for session_count in [10, 50, 100, 500].iter() {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryCache::new()),
            SessionConfig::default(),
            TimeoutConfig::default(),
        ));

        let ids: Vec<String> = rt.block_on(async {
            let mut ids = Vec::with_capacity(*session_count);
            for _ in 0..*session_count {
                let session = sessions
                    .create(
                        Uuid::new_v4(),
                        "bench-device",
                        "203.0.113.7",
                        "bench-agent",
                        0.1,
                        None,
                    )
                    .await
                    .unwrap();
                ids.push(session.session_id);
            }
            ids
        });

        group.throughput(Throughput::Elements(*session_count as u64));
        group.bench_with_input(
            BenchmarkId::new("validate_all", session_count),
            &ids,
            |b, ids| {
                b.iter(|| {
                    rt.block_on(async {
                        let mut live = 0usize;
                        for id in ids {
                            if sessions.validate(id).await.unwrap() {
                                live += 1;
                            }
                        }
                        black_box(live)
                    })
                })
            },
        );
    }

    group.finish();
}

/// Benchmark symmetric encryption across payload sizes.
fn bench_encryption_throughput(c: &mut Criterion) {
    use aegis_crypto::cipher;

    let mut group = c.benchmark_group("encryption");
    let key = [0x42u8; 32];

    for size in [1024, 16 * 1024, 64 * 1024, 256 * 1024].iter() {
        let payload = vec![0x5au8; *size];

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(
            BenchmarkId::new("aes_gcm", size),
            &payload,
            |b, payload| {
                b.iter(|| black_box(cipher::encrypt_aes_gcm(&key, black_box(payload)).unwrap()))
            },
        );

        group.bench_with_input(
            BenchmarkId::new("fernet", size),
            &payload,
            |b, payload| {
                b.iter(|| black_box(cipher::fernet_encrypt(&key, black_box(payload)).unwrap()))
            },
        );
    }

    group.finish();
}

/// Benchmark the sliding-window counter under many distinct identifiers.
fn bench_window_counters(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("window_counters");

    for key_count in [100, 1000].iter() {
        let cache = MemoryCache::new();
        let keys: Vec<String> = (0..*key_count)
            .map(|i| format!("ratelimit:login:user_{}", i))
            .collect();

        group.throughput(Throughput::Elements(*key_count as u64));
        group.bench_with_input(
            BenchmarkId::new("incr_all", key_count),
            &keys,
            |b, keys| {
                b.iter(|| {
                    rt.block_on(async {
                        let mut allowed = 0usize;
                        for key in keys {
                            let decision = cache
                                .incr_window(key, u32::MAX, Duration::from_secs(60))
                                .await
                                .unwrap();
                            if decision.allowed {
                                allowed += 1;
                            }
                        }
                        black_box(allowed)
                    })
                })
            },
        );
    }

    group.finish();
}

/// Benchmark bulk cache writes, the pattern session mirrors produce.
fn bench_cache_bulk_writes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cache_writes");

    for write_count in [100, 1000, 5000].iter() {
        let entries: Vec<(String, String)> = (0..*write_count)
            .map(|i| {
                (
                    format!("session:{}", Uuid::new_v4()),
                    format!("{{\"seq\":{}}}", i),
                )
            })
            .collect();

        group.throughput(Throughput::Elements(*write_count as u64));
        group.bench_with_input(
            BenchmarkId::new("set_all", write_count),
            &entries,
            |b, entries| {
                b.iter(|| {
                    rt.block_on(async {
                        let cache = MemoryCache::new();
                        for (key, value) in entries {
                            cache
                                .set(key, value, Some(Duration::from_secs(3600)))
                                .await
                                .unwrap();
                        }
                        black_box(cache)
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_bulk_permission_checks,
    bench_bulk_risk_labels,
    bench_bulk_token_issuance,
    bench_bulk_session_validation,
    bench_encryption_throughput,
    bench_window_counters,
    bench_cache_bulk_writes,
);

criterion_main!(benches);
