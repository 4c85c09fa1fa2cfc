use crate::shim::{
    sync::{Arc, Barrier},
    thread,
};

use shuttle::rand::{self, Rng};

#[test]
fn test_pins_under_contention() {
    let mut config = shuttle::Config::default();
    config.max_steps = shuttle::MaxSteps::None;
    let check_determinism = std::env::var("CHECK_DETERMINISM").is_ok_and(|s| !s.is_empty());
    if let Ok(seed) = std::env::var("SEED") {
        let seed = std::fs::read_to_string(&seed).unwrap_or(seed.clone());
        let scheduler = shuttle::scheduler::ReplayScheduler::new_from_encoded(&seed);
        let runner = shuttle::Runner::new(scheduler, config);
        runner.run(test_pins_under_contention_stub);
    } else {
        let max_iterations: usize = std::env::var("MAX_ITERATIONS")
            .map(|s| s.parse().unwrap())
            .unwrap_or(1000);
        let scheduler = shuttle::scheduler::RandomScheduler::new(max_iterations);
        if check_determinism {
            let scheduler =
                shuttle::scheduler::UncontrolledNondeterminismCheckScheduler::new(scheduler);
            let runner = shuttle::Runner::new(scheduler, config);
            runner.run(test_pins_under_contention_stub);
        } else {
            let runner = shuttle::Runner::new(scheduler, config);
            runner.run(test_pins_under_contention_stub);
        }
    }
}

fn test_pins_under_contention_stub() {
    const THREADS: usize = 3;
    const KEYS: u64 = 4;
    const OPS: usize = 10;
    let cache_ = Arc::new(crate::sync::Cache::<u64, u64>::new(2));
    let wg = Arc::new(Barrier::new(THREADS));
    let mut threads = Vec::new();
    for _ in 0..THREADS {
        let cache = cache_.clone();
        let wg = wg.clone();
        let thread = thread::spawn(move || {
            wg.wait();
            for _ in 0..OPS {
                let key = rand::thread_rng().gen_range(0..KEYS);
                match rand::thread_rng().gen_range(0..3) {
                    0 => {
                        cache.insert(key, key * 10, 1).release();
                    }
                    1 => {
                        if let Some(pinned) = cache.get(&key) {
                            // a pinned entry answers even if overwritten or
                            // removed concurrently
                            assert_eq!(pinned.value(), key * 10);
                            shuttle::thread::yield_now();
                            pinned.release();
                        }
                    }
                    _ => {
                        cache.remove(&key);
                    }
                }
            }
        });
        threads.push(thread);
    }
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(cache_.pinned_usage(), 0);
    assert!(cache_.usage() <= cache_.capacity());
    assert_eq!(cache_.len() as u64, cache_.usage());
}
