use std::error::Error;
use std::sync::Arc;
use std::thread;

use strata::common::{EngineConfig, PageId, RecordId, SlotId};
use strata::concurrency::{IsolationLevel, LockMode};
use strata::index::OrdComparator;
use strata::StorageEngine;

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt::try_init()?;

    println!("Strata - storage core demo");
    println!("==========================\n");

    let db_path = "demo.db";
    let config = EngineConfig {
        pool_size: 64,
        ..EngineConfig::default()
    };
    let engine = StorageEngine::open(db_path, config)?;
    println!("Opened {} with {} frames", db_path, engine.buffer_pool().pool_size());

    // Index 1000 keys through a small tree so it grows a few levels
    let index = Arc::new(engine.open_index::<i64, _>("demo_pk", OrdComparator, 8, 8)?);
    let workers: Vec<_> = (0..4)
        .map(|w| {
            let index = Arc::clone(&index);
            thread::spawn(move || -> strata::Result<()> {
                for k in (w..1000).step_by(4) {
                    let rid = RecordId::new(PageId::new(k as u32 / 16), SlotId::new((k % 16) as u16));
                    index.insert(&k, rid)?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        if let Ok(result) = worker.join() {
            result?;
        }
    }
    index.check_integrity()?;
    println!("Inserted 1000 keys, tree height {}", index.height()?);

    let first: Vec<i64> = index
        .begin_at(&500)?
        .take(5)
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<strata::Result<_>>()?;
    println!("Five keys from 500: {:?}", first);

    // Two transactions sharing a table and contending on one row
    let lock_manager = engine.lock_manager();
    let reader = engine.begin(IsolationLevel::RepeatableRead);
    let writer = engine.begin(IsolationLevel::ReadCommitted);
    let rid = RecordId::new(PageId::new(1), SlotId::new(0));

    lock_manager.lock_table(&reader, LockMode::IntentionShared, 1)?;
    lock_manager.lock_row(&reader, LockMode::Shared, 1, rid)?;
    lock_manager.lock_table(&writer, LockMode::IntentionExclusive, 1)?;
    println!("{} holds S on {}, {} holds IX on table 1", reader.id(), rid, writer.id());

    let handle = {
        let lock_manager = Arc::clone(lock_manager);
        let writer = Arc::clone(&writer);
        thread::spawn(move || lock_manager.lock_row(&writer, LockMode::Exclusive, 1, rid))
    };
    engine.transaction_manager().commit(&reader);
    if let Ok(granted) = handle.join() {
        println!("{} got X on {} after commit: {}", writer.id(), rid, granted?);
    }
    engine.transaction_manager().commit(&writer);

    drop(index);
    drop(engine);
    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed successfully!");
    Ok(())
}
