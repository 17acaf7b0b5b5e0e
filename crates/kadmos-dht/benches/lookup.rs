use std::net::SocketAddrV4;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::{Rng, RngCore};

use kadmos_dht::{Contact, Journey, NodeId, RoutingTable, K};

fn random_id(rng: &mut impl RngCore) -> NodeId {
    let mut id = [0u8; 32];
    rng.fill_bytes(&mut id);
    NodeId(id)
}

fn random_contact(rng: &mut impl RngCore) -> Contact {
    Contact::new(
        random_id(rng),
        SocketAddrV4::new([127, 0, 0, 1].into(), rng.gen_range(1024..u16::MAX)),
    )
}

fn populated_table(rng: &mut impl RngCore, nodes: usize) -> RoutingTable {
    let local = Contact::new(random_id(rng), SocketAddrV4::new([127, 0, 0, 1].into(), 9000));
    let table = RoutingTable::new(local, Duration::from_secs(3600));

    for _ in 0..nodes {
        let contact = random_contact(rng);
        table.insert(contact.id, contact.address, Duration::ZERO);
    }

    table
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing_table");
    let mut rng = rand::thread_rng();

    let table = populated_table(&mut rng, 10_000);

    group.bench_function("insert", |b| {
        let contact = random_contact(&mut rng);
        b.iter(|| {
            table.insert(
                std::hint::black_box(contact.id),
                contact.address,
                Duration::ZERO,
            )
        });
    });

    group.bench_function("closest_n", |b| {
        let target = random_id(&mut rng);
        b.iter(|| table.closest_n(std::hint::black_box(target.as_bytes()), K));
    });

    group.bench_function("seen", |b| {
        let contact = random_contact(&mut rng);
        table.insert(contact.id, contact.address, Duration::ZERO);
        b.iter(|| table.seen(std::hint::black_box(&contact.id)));
    });

    group.finish();
}

fn bench_journey(c: &mut Criterion) {
    let mut group = c.benchmark_group("journey");
    let mut rng = rand::thread_rng();

    let batches: Vec<Vec<Contact>> = (0..1000)
        .map(|_| (0..5).map(|_| random_contact(&mut rng)).collect())
        .collect();

    group.bench_function("add", |b| {
        let journey = Journey::new(random_id(&mut rng), *random_id(&mut rng).as_bytes(), K);
        let mut i = 0;
        b.iter(|| {
            journey.add(std::hint::black_box(&batches[i % batches.len()]));
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_routing, bench_journey);
criterion_main!(benches);
