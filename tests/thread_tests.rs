//! Multi-threaded sessions: per-thread tables and wait time

mod utils;

use callgraph_prof::config::ProfilerConfig;
use callgraph_prof::{Profiler, Qualifier, ThreadKey};
use serial_test::serial;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use utils::{assert_invariants, graph};

fn kernel() -> Qualifier {
    Qualifier::Module("Kernel".into())
}

#[test]
#[serial]
fn test_join_accumulates_wait() {
    let profiler = Arc::new(Profiler::new(ProfilerConfig::wall()).unwrap());
    profiler.start().unwrap();
    let main_key = ThreadKey::current();

    let worker_key = {
        let _join = profiler.scope(&Qualifier::Class("Thread".into()), "join").unwrap();
        let worker_profiler = Arc::clone(&profiler);
        let handle = thread::spawn(move || {
            let _sleep = worker_profiler.scope(&kernel(), "sleep").unwrap();
            thread::sleep(Duration::from_millis(200));
            ThreadKey::current()
        });
        handle.join().unwrap()
    };
    {
        let _sleep = profiler.scope(&kernel(), "sleep").unwrap();
        thread::sleep(Duration::from_millis(50));
    }

    let result = graph(profiler.stop().unwrap());
    assert_eq!(result.threads().len(), 2);

    let main = result.thread(main_key).unwrap();
    let join = main.method("Thread#join").unwrap();
    assert!(join.wait_time >= 0.2 && join.wait_time < 0.35, "wait {}", join.wait_time);
    assert!(join.self_time < 0.05, "self {}", join.self_time);
    let sleep = main.method("Kernel#sleep").unwrap();
    assert!(sleep.total_time >= 0.05 && sleep.total_time < 0.2);
    assert!(sleep.wait_time < 1e-9);
    assert_invariants(main, 1e-6);

    let worker = result.thread(worker_key).unwrap();
    let worker_sleep = worker.method("Kernel#sleep").unwrap();
    assert!(worker_sleep.total_time >= 0.2);
    assert_invariants(worker, 1e-6);
}

#[test]
fn test_concurrent_threads_keep_separate_tables() {
    let profiler = Arc::new(Profiler::new(ProfilerConfig::wall()).unwrap());
    profiler.start().unwrap();

    let workers = 4;
    let iterations = 200;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let profiler = Arc::clone(&profiler);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let worker = Qualifier::Class("Worker".into());
                for _ in 0..iterations {
                    let _outer = profiler.scope(&worker, "outer").unwrap();
                    let _inner = profiler.scope(&worker, "inner").unwrap();
                    std::hint::black_box(Vec::<u8>::with_capacity(16));
                }
                ThreadKey::current()
            })
        })
        .collect();
    let keys: Vec<ThreadKey> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let result = graph(profiler.stop().unwrap());
    assert_eq!(result.threads().len(), workers);
    assert!(!result.is_tainted());

    for key in keys {
        let profile = result.thread(key).unwrap();
        assert_eq!(profile.methods().len(), 3);
        assert_eq!(profile.method("Worker#outer").unwrap().called, iterations);
        let inner = profile.method("Worker#inner").unwrap();
        assert_eq!(inner.called, iterations);
        assert_eq!(profile.caller(profile.parents(inner).next().unwrap()).name, "Worker#outer");
        assert_invariants(profile, 1e-6);
    }
}

#[test]
fn test_violation_on_one_thread_leaves_others_valid() {
    let profiler = Arc::new(Profiler::new(ProfilerConfig::wall()).unwrap());
    profiler.start().unwrap();

    let bad = {
        let profiler = Arc::clone(&profiler);
        thread::spawn(move || {
            let key = ThreadKey::current();
            assert!(profiler.on_call_exit(key).is_err());
            key
        })
        .join()
        .unwrap()
    };
    {
        let _guard = profiler.scope(&Qualifier::Class("Main".into()), "run").unwrap();
    }

    let result = graph(profiler.stop().unwrap());
    assert!(result.thread(bad).unwrap().is_tainted());
    let main = result.thread(ThreadKey::current()).unwrap();
    assert!(!main.is_tainted());
    assert_eq!(main.method("Main#run").unwrap().called, 1);
}
