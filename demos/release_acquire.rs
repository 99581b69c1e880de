//! Two nodes, one shared counter, no hardware coherence: node 0 bumps a
//! value and releases, node 1 spins on an acquire-load until it sees the
//! new value and the line it lives on.
//!
//! Run with `cargo run --example release_acquire`.

use std::sync::Arc;
use std::time::Duration;

use racoherence::config::RuntimeConfig;
use racoherence::runtime::Runtime;
use racoherence::VectorClock;

fn main() {
    tracing_subscriber::fmt::init();

    let config = RuntimeConfig {
        node_count: 2,
        ..RuntimeConfig::default()
    };
    let rt = Arc::new(Runtime::new(config).expect("valid config"));

    let mut shared_counter: u64 = 0;
    let counter_addr = &mut shared_counter as *mut u64 as u64;

    let writer_rt = rt.clone();
    let writer = std::thread::spawn(move || {
        let mut ops = writer_rt.new_thread_ops(0);
        unsafe { std::ptr::write_volatile(counter_addr as *mut u64, 42) };
        ops.log_store(counter_addr & !(racoherence::config::CACHE_LINE_SIZE - 1));
        let rel_clk = ops.thread_release();
        println!("node 0 released at clock {rel_clk}");
        rel_clk
    });
    let rel_clk = writer.join().unwrap();

    let reader_rt = rt.clone();
    let reader = std::thread::spawn(move || {
        let mut ops = reader_rt.new_thread_ops(1);
        let mut target = VectorClock::new(2);
        target.set(0, rel_clk);
        ops.thread_acquire(&target);

        let value = unsafe { std::ptr::read_volatile(counter_addr as *const u64) };
        println!("node 1 acquired at clock {} and read {value}", ops.thread_clock());
        assert_eq!(value, 42);
    });
    reader.join().unwrap();

    std::thread::sleep(Duration::from_millis(10));
    Arc::try_unwrap(rt)
        .unwrap_or_else(|_| panic!("runtime still shared"))
        .shutdown();
}
