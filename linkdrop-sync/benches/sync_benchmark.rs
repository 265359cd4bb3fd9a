use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use linkdrop_core::{LinkPatch, LinkStore};
use linkdrop_sync::{ConnectionId, DataChannel, PeerId, ReplicaStore, StoreConfig, SyncEngine, SyncMessage};
use std::hint::black_box;
use std::sync::Arc;

fn bench_frame_encode(c: &mut Criterion) {
    let delta = vec![7u8; 64];

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::Update(black_box(delta.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = SyncMessage::Update(vec![7u8; 64]).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_handshake(c: &mut Criterion) {
    let source = Arc::new(LinkStore::new().unwrap());
    for i in 0..500 {
        source
            .add_link(&format!("https://site{i}.example"), LinkPatch::default())
            .unwrap();
    }
    let empty = LinkStore::new().unwrap();
    let step1 = SyncMessage::SyncStep1(empty.state_vector()).encode().unwrap();

    let mut group = c.benchmark_group("Engine");
    group.throughput(Throughput::Elements(1));

    // Answering a fresh peer's step1 against 500 links.
    group.bench_function("step1_response_500", |b| {
        let mut engine = SyncEngine::new(source.clone());
        let peer = PeerId::from("bench");
        b.iter(|| {
            let (local, remote) = DataChannel::pair();
            let connection = ConnectionId::next();
            engine.peer_opened(peer.clone(), connection, false, local.sender);
            engine.handle_frame(&peer, connection, black_box(&step1));
            black_box(remote);
        })
    });

    group.bench_function("broadcast_local_8_peers", |b| {
        let mut engine = SyncEngine::new(Arc::new(LinkStore::new().unwrap()));
        let mut remotes = Vec::new();
        for i in 0..8 {
            let (local, remote) = DataChannel::pair();
            engine.peer_opened(PeerId::new(format!("p{i}")), ConnectionId::next(), false, local.sender);
            remotes.push(remote);
        }
        let update = linkdrop_core::DocUpdate {
            update: vec![1u8; 128],
            origin: linkdrop_core::UpdateOrigin::Local,
        };
        b.iter(|| {
            engine.broadcast_local(black_box(&update));
            for remote in remotes.iter_mut() {
                while remote.events.try_recv().is_ok() {}
            }
        })
    });

    group.finish();
}

fn bench_storage(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let rocks = ReplicaStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let replica = ReplicaStore::replica_key("bench");

    let source = LinkStore::new().unwrap();
    for i in 0..500 {
        source
            .add_link(&format!("https://site{i}.example"), LinkPatch::default())
            .unwrap();
    }
    let state = source.encode_state();

    let mut group = c.benchmark_group("Storage");
    group.throughput(Throughput::Bytes(state.len() as u64));

    group.bench_function("save_snapshot_500", |b| {
        b.iter(|| black_box(rocks.save_snapshot(replica, black_box(&state)).unwrap()))
    });

    group.bench_function("load_snapshot_500", |b| {
        b.iter(|| black_box(rocks.load_snapshot(replica).unwrap()))
    });

    group.bench_function("append_update_128B", |b| {
        let update = vec![3u8; 128];
        b.iter(|| black_box(rocks.append_update(replica, black_box(&update)).unwrap()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_handshake,
    bench_storage,
);
criterion_main!(benches);
