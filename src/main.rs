use std::sync::Arc;

use strata::buffer::BufferPoolManager;
use strata::index::{DefaultHashFunction, ExtendibleHashTable, IntegerComparator};
use strata::storage::disk::DiskManager;

fn main() {
    env_logger::init();

    println!("Strata - a disk-oriented storage engine in Rust");
    println!("===============================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    // Small pool so the demo exercises eviction
    let bpm = Arc::new(BufferPoolManager::new(10, 2, disk_manager));
    println!("Created buffer pool manager with 10 frames\n");

    let table = ExtendibleHashTable::new(
        Arc::clone(&bpm),
        4,
        4,
        Box::new(DefaultHashFunction),
        Box::new(IntegerComparator),
        1,
        9,
        64,
    )
    .expect("Failed to create hash table");
    println!("Created extendible hash table (header page {})", table.header_page_id());

    // Insert enough keys to force bucket splits
    let count = 500u32;
    for i in 0..count {
        let inserted = table
            .insert(&i.to_le_bytes(), &(i * 10).to_le_bytes())
            .expect("Insert failed");
        assert!(inserted);
    }
    println!("Inserted {} keys", count);

    if let Some(depth) = table.directory_global_depth(0).expect("stat failed") {
        println!("Directory 0 global depth: {}", depth);
    }

    // Point lookups
    for i in (0..count).step_by(100) {
        let values = table.get_value(&i.to_le_bytes()).expect("Lookup failed");
        println!("key {} -> {:?}", i, values.first().map(|v| {
            u32::from_le_bytes([v[0], v[1], v[2], v[3]])
        }));
    }

    // Remove half the keys; empty buckets merge back
    for i in 0..count / 2 {
        let removed = table.remove(&i.to_le_bytes()).expect("Remove failed");
        assert!(removed);
    }
    println!("\nRemoved {} keys", count / 2);

    table.verify_integrity().expect("integrity check failed");
    println!("Directory invariants hold");

    bpm.flush_all_pages().expect("Flush failed");
    println!(
        "Flushed all pages ({} disk writes, {} disk reads)",
        bpm.disk_manager().get_num_writes(),
        bpm.disk_manager().get_num_reads()
    );

    // Cleanup the demo file
    let _ = std::fs::remove_file(db_path);
}
