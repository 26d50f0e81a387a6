use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use loopnet::asynclog::AsyncLog;

#[test]
fn concurrent_writers_all_reach_disk_in_order_per_thread() {
    let dir = std::env::temp_dir().join(format!("loopnet-asynclog-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let basename = dir.join("concurrent").to_string_lossy().into_owned();

    let log = AsyncLog::new(basename, 8 * 1024 * 1024, Duration::from_millis(30));
    log.start();

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let log: Arc<AsyncLog> = log.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let line = format!("writer-{w}-line-{i}\n");
                    log.append(line.as_bytes());
                }
            })
        })
        .collect();

    for w in writers {
        w.join().unwrap();
    }
    log.stop();

    let mut contents = String::new();
    for entry in std::fs::read_dir(&dir).unwrap() {
        let entry = entry.unwrap();
        let mut file_contents = String::new();
        std::fs::File::open(entry.path())
            .unwrap()
            .read_to_string(&mut file_contents)
            .unwrap();
        contents.push_str(&file_contents);
    }

    assert_eq!(contents.lines().count(), 8 * 500);
    for w in 0..8 {
        let mut last_seen = -1i64;
        for line in contents.lines() {
            let prefix = format!("writer-{w}-line-");
            if let Some(rest) = line.strip_prefix(&prefix) {
                let n: i64 = rest.parse().unwrap();
                assert!(n > last_seen, "writer {w} lines arrived out of order");
                last_seen = n;
            }
        }
        assert_eq!(last_seen, 499);
    }

    let _ = std::fs::remove_dir_all(&dir);
}
