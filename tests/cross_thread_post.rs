use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loopnet::EventLoop;

#[test]
fn queue_in_loop_runs_on_the_loop_thread() {
    let event_loop = EventLoop::new().expect("event loop");
    let ran_on_loop_thread = Arc::new(AtomicBool::new(false));

    let loop_for_thread = event_loop.clone();
    let handle = std::thread::spawn(move || {
        let _ = loop_for_thread.run();
    });
    std::thread::sleep(Duration::from_millis(20));

    let flag = ran_on_loop_thread.clone();
    let loop_for_check = event_loop.clone();
    event_loop.queue_in_loop(move || {
        flag.store(loop_for_check.is_in_loop_thread(), Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(50));
    event_loop.quit();
    handle.join().unwrap();

    assert!(ran_on_loop_thread.load(Ordering::SeqCst));
}

#[test]
fn many_posted_tasks_all_run_exactly_once() {
    let event_loop = EventLoop::new().expect("event loop");
    let count = Arc::new(AtomicUsize::new(0));

    let loop_for_thread = event_loop.clone();
    let handle = std::thread::spawn(move || {
        let _ = loop_for_thread.run();
    });
    std::thread::sleep(Duration::from_millis(20));

    for _ in 0..200 {
        let count = count.clone();
        event_loop.queue_in_loop(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    std::thread::sleep(Duration::from_millis(100));
    event_loop.quit();
    handle.join().unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 200);
}
