//! 同じ優先度の32スレッドを複数CPUで動かすストレステスト

mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use common::{interrupt_point, kernel, spawn};
use mochios_task::task::{Channel, ThreadState, WakeReason};

const THREADS: usize = 32;

static GO: AtomicBool = AtomicBool::new(false);
static STARTED: AtomicU64 = AtomicU64::new(0);

fn spinner(index: usize) -> i32 {
    STARTED.fetch_or(1 << index, Ordering::SeqCst);
    while !GO.load(Ordering::SeqCst) {
        interrupt_point();
    }
    index as i32 + 100
}

fn main_thread(_: usize) -> i32 {
    let kernel = kernel();
    let threads: Vec<_> = (0..THREADS)
        .map(|i| spawn(&format!("spinner{}", i), spinner, i))
        .collect();

    // 誰も起こさないチャネルなので、1秒後にタイムアウトで戻る
    let timer = Channel::new(0x7100);
    let woken = kernel.pm.sleep(timer, "wait", Some(Duration::from_secs(1))).unwrap();
    assert_eq!(woken, WakeReason::Timeout);
    assert_eq!(STARTED.load(Ordering::SeqCst), (1u64 << THREADS) - 1);

    GO.store(true, Ordering::SeqCst);
    kernel.pm.sleep(timer, "wait", Some(Duration::from_secs(1))).unwrap();

    for (i, thread) in threads.iter().enumerate() {
        let info = kernel.pm.thread_info(*thread).unwrap();
        assert_eq!(info.state, ThreadState::Terminated, "{}", info.name);
        assert_eq!(info.exit_code, Some(i as i32 + 100));
    }
    0
}

#[test]
fn test_spinners_start_and_terminate() {
    common::run(4, main_thread, Duration::from_secs(60));
}
