//! Micro-benchmarks for RoutingTable operations: add, closest, and remove
//! at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use std::time::Instant;

use kadnode::{Address, Contact, Id, RoutingTable};

fn main() {
    println!("routing_table\n");

    bench_add();
    bench_closest();
    bench_remove();
}

fn contacts(count: usize) -> Vec<Contact> {
    (0..count)
        .map(|i| Contact::new(Id::random(), Address::new("127.0.0.1", 1024 + i as u16)))
        .collect()
}

fn filled(count: usize) -> (RoutingTable, Vec<Contact>) {
    let mut table = RoutingTable::new(Id::random());
    let contacts = contacts(count);

    for contact in contacts.iter().cloned() {
        table.add_contact(contact);
    }

    (table, contacts)
}

fn bench_add() {
    println!("add");

    // Pre-generate contacts outside the timed section
    let contacts = contacts(1000);

    for prefill in [0, 100, 400] {
        let (mut table, _) = filled(prefill);

        let start = Instant::now();
        for contact in contacts.iter().cloned() {
            table.add_contact(contact);
        }
        let per_op = start.elapsed().as_nanos() / contacts.len() as u128;

        println!(
            "prefilled {prefill:>3}: {per_op}ns/op (final size: {})",
            table.size()
        );
    }

    println!();
}

fn bench_closest() {
    println!("closest_contacts_to_key");

    for size in [20, 100, 400] {
        let (table, _) = filled(size);
        let keys: Vec<Id> = (0..1000).map(|_| Id::random()).collect();

        let start = Instant::now();
        for key in &keys {
            let _ = table.closest_contacts_to_key(key, 20);
        }
        let per_op = start.elapsed().as_nanos() / keys.len() as u128;

        println!("table size {:>3}: {per_op}ns/op", table.size());
    }

    println!();
}

fn bench_remove() {
    println!("remove_contact");

    let (mut table, contacts) = filled(1000);
    let size = table.size();

    let start = Instant::now();
    for contact in &contacts {
        table.remove_contact(contact.id());
    }
    let per_op = start.elapsed().as_nanos() / contacts.len() as u128;

    println!("from {size} contacts: {per_op}ns/op (final size: {})\n", table.size());
}
