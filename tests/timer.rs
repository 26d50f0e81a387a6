use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopnet::EventLoop;

#[test]
fn run_after_fires_once_after_the_delay() {
    let event_loop = EventLoop::new().expect("event loop");
    let fired = Arc::new(AtomicUsize::new(0));

    {
        let fired = fired.clone();
        event_loop.run_after(Duration::from_millis(30), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    let loop_for_thread = event_loop.clone();
    let handle = std::thread::spawn(move || {
        let _ = loop_for_thread.run();
    });

    std::thread::sleep(Duration::from_millis(150));
    event_loop.quit();
    handle.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn run_every_fires_multiple_times_in_order() {
    let event_loop = EventLoop::new().expect("event loop");
    let ticks: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicUsize::new(0));

    {
        let ticks = ticks.clone();
        let counter = counter.clone();
        event_loop.run_every(Duration::from_millis(20), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) as u32;
            ticks.lock().unwrap().push(n);
        });
    }

    let loop_for_thread = event_loop.clone();
    let handle = std::thread::spawn(move || {
        let _ = loop_for_thread.run();
    });

    std::thread::sleep(Duration::from_millis(150));
    event_loop.quit();
    handle.join().unwrap();

    let recorded = ticks.lock().unwrap().clone();
    assert!(recorded.len() >= 3, "expected several ticks, got {recorded:?}");
    assert!(recorded.windows(2).all(|w| w[0] < w[1]), "ticks must fire in order");
}

#[test]
fn timers_registered_from_another_thread_still_fire() {
    let event_loop = EventLoop::new().expect("event loop");
    let fired = Arc::new(AtomicUsize::new(0));

    let loop_for_thread = event_loop.clone();
    let handle = std::thread::spawn(move || {
        let _ = loop_for_thread.run();
    });

    std::thread::sleep(Duration::from_millis(20));
    {
        let fired = fired.clone();
        // Posted from the test thread, not the loop's own thread.
        event_loop.run_after(Duration::from_millis(30), move || {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    std::thread::sleep(Duration::from_millis(150));
    event_loop.quit();
    handle.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
