//! Multi-thread invariants: one open file per path, interleaved writers,
//! and counter linearizability.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use tempfile::TempDir;
use veilfs::vault::Counter;
use veilfs::{
    CryptoFileSystem, CryptoFsOptions, MasterKey, OpenOptions, StaticMasterkeyLoader,
};

fn open_fs(vault: &std::path::Path) -> Arc<CryptoFileSystem> {
    let loader = StaticMasterkeyLoader::new(MasterKey::new([7u8; 32], [13u8; 32]));
    Arc::new(CryptoFileSystem::open(vault, &loader, CryptoFsOptions::default()).unwrap())
}

#[test]
fn concurrent_opens_share_one_open_file() {
    let vault = TempDir::new().unwrap();
    let fs = open_fs(vault.path());
    fs.write_file("/shared", b"contents").unwrap();

    let barrier = Arc::new(std::sync::Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let channel = fs.open_file("/shared", OpenOptions::new()).unwrap();
                // All channels alive at once must map to a single instance.
                assert_eq!(fs.open_file_count(), 1);
                let mut buf = [0u8; 8];
                assert_eq!(channel.read_at(0, &mut buf).unwrap(), 8);
                assert_eq!(&buf, b"contents");
                channel.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fs.open_file_count(), 0, "all channels released");
    assert_eq!(fs.read_file("/shared").unwrap(), b"contents");
}

#[test]
fn two_threads_appending_blocks_interleaved() {
    // Same shape as the big appender scenario, scaled for CI: two threads
    // claim 64 KiB block slots from a shared counter and write them
    // concurrently through separate channels on the same file.
    const BLOCK: usize = 64 * 1024;
    const BLOCKS: u64 = 64;

    let vault = TempDir::new().unwrap();
    let fs = open_fs(vault.path());

    fn block_content(index: u64) -> Vec<u8> {
        vec![(index % 251) as u8 + 1; BLOCK]
    }

    let next_block = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let next_block = Arc::clone(&next_block);
            thread::spawn(move || {
                let channel = fs
                    .open_file("/appended", OpenOptions::new().write(true).create(true))
                    .unwrap();
                loop {
                    let index = next_block.fetch_add(1, Ordering::SeqCst);
                    if index >= BLOCKS {
                        break;
                    }
                    let offset = index * BLOCK as u64;
                    channel.write_at(offset, &block_content(index)).unwrap();
                }
                channel.close().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let data = fs.read_file("/appended").unwrap();
    assert_eq!(data.len() as u64, BLOCKS * BLOCK as u64);
    for index in 0..BLOCKS {
        let start = (index * BLOCK as u64) as usize;
        let expected = (index % 251) as u8 + 1;
        assert!(
            data[start..start + BLOCK].iter().all(|b| *b == expected),
            "block {index} corrupted"
        );
    }
}

#[test]
fn readers_run_while_writer_mutates() {
    let vault = TempDir::new().unwrap();
    let fs = open_fs(vault.path());
    fs.write_file("/churn", &vec![0xCC; 200_000]).unwrap();

    let writer = {
        let fs = Arc::clone(&fs);
        thread::spawn(move || {
            let channel = fs
                .open_file("/churn", OpenOptions::new().read(true).write(true))
                .unwrap();
            for round in 0u8..20 {
                channel.write_at(50_000, &vec![round; 10_000]).unwrap();
                channel.flush().unwrap();
            }
            channel.close().unwrap();
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                let channel = fs.open_file("/churn", OpenOptions::new()).unwrap();
                for _ in 0..50 {
                    let mut buf = vec![0u8; 10_000];
                    let n = channel.read_at(50_000, &mut buf).unwrap();
                    assert_eq!(n, 10_000);
                    // The write region is updated atomically under the file
                    // lock: a read must never observe a torn block.
                    let first = buf[0];
                    assert!(
                        buf.iter().all(|b| *b == first),
                        "torn read: saw {first} and {:?}",
                        buf.iter().find(|b| **b != first)
                    );
                }
                channel.close().unwrap();
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(fs.open_file_count(), 0);
}

#[test]
fn concurrent_operations_on_distinct_files() {
    let vault = TempDir::new().unwrap();
    let fs = open_fs(vault.path());
    fs.create_directory("/dir").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                let path = format!("/dir/file-{i}");
                let payload = vec![i as u8; 10_000 + i * 100];
                fs.write_file(&path, &payload).unwrap();
                assert_eq!(fs.read_file(&path).unwrap(), payload);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fs.list_directory("/dir").unwrap().len(), 8);
}

#[test]
fn counter_polls_account_for_every_increment() {
    // One million increments across 8 threads; the first poll returns the
    // total, the next returns zero.
    let counter = Arc::new(Counter::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..125_000 {
                    counter.add(1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counter.poll(), 1_000_000);
    assert_eq!(counter.poll(), 0);
}

#[test]
fn polls_interleaved_with_increments_sum_to_total() {
    let counter = Arc::new(Counter::new());
    let polled = Arc::new(AtomicU64::new(0));

    let adders: Vec<_> = (0..4)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..250_000 {
                    counter.add(1);
                }
            })
        })
        .collect();
    let pollers: Vec<_> = (0..2)
        .map(|_| {
            let counter = Arc::clone(&counter);
            let polled = Arc::clone(&polled);
            thread::spawn(move || {
                for _ in 0..500 {
                    polled.fetch_add(counter.poll(), Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in adders {
        handle.join().unwrap();
    }
    for handle in pollers {
        handle.join().unwrap();
    }

    let total = polled.load(Ordering::Relaxed) + counter.poll();
    assert_eq!(total, 1_000_000);
}
