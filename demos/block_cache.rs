//! A miniature block cache: fixed-size file blocks cached by block number,
//! charged by their byte size, with a deleter reporting evictions to a
//! background thread.

use pin_cache::sync::Cache;
use std::{
    sync::{mpsc, Arc},
    thread,
};

const BLOCK_SIZE: usize = 16 * 1024;
const NUM_BLOCKS: u64 = 64;

fn read_block(block: u64) -> Arc<Vec<u8>> {
    // stands in for a disk read
    Arc::new(vec![block as u8; BLOCK_SIZE])
}

fn main() {
    let (tx, rx) = mpsc::channel::<u64>();

    let bg_thread = thread::spawn(move || {
        for block in rx {
            println!("Evicted block {block}");
        }
    });

    // room for half the blocks
    let cache = Cache::<u64, Arc<Vec<u8>>>::new(NUM_BLOCKS / 2 * BLOCK_SIZE as u64);
    for block in 0..NUM_BLOCKS {
        let data = match cache.get(&block) {
            Some(pinned) => pinned.value(),
            None => {
                let data = read_block(block);
                let tx = tx.clone();
                let pinned = cache.insert_with_deleter(
                    block,
                    data,
                    BLOCK_SIZE as u64,
                    Box::new(move |key, _value| {
                        let _ = tx.send(key);
                    }),
                );
                pinned.value()
            }
        };
        assert_eq!(data[0], block as u8);
    }
    println!(
        "usage {} of {} across {} blocks",
        cache.usage(),
        cache.capacity(),
        cache.len()
    );
    drop(cache);
    drop(tx);

    bg_thread.join().unwrap();
}
