use hitsz_logfs::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn mount(config: Config) -> (Arc<MemDisk>, Arc<FileSystem>) {
    let image = MemDisk::new(2000);
    let params = MkfsParams {
        num_blocks: 2000,
        num_inodes: 64,
        num_log_blocks: 31,
    };
    mkfs(&image, &params).unwrap();
    let disk = Arc::new(image.snapshot());
    let fs = Arc::new(FileSystem::open(disk.clone(), config).unwrap());
    (disk, fs)
}

#[test]
fn test_block_lock_is_exclusive() {
    const THREADS: usize = 8;
    const ROUNDS: u64 = 500;
    let (_disk, fs) = mount(Config::default());
    let block_no = fs.super_block().num_blocks as usize - 1;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let mut block = fs.cache().acquire(block_no);
                    let mut counter = [0u8; 8];
                    counter.copy_from_slice(&block.data()[..8]);
                    let next = u64::from_le_bytes(counter) + 1;
                    thread::yield_now();
                    block.data_mut()[..8].copy_from_slice(&next.to_le_bytes());
                    fs.cache().release(block);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let block = fs.cache().acquire(block_no);
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&block.data()[..8]);
    assert_eq!(u64::from_le_bytes(counter), THREADS as u64 * ROUNDS);
}

#[test]
fn test_admission_never_overruns_the_log() {
    let config = Config {
        log_max_size: 2 * OP_MAX_NUM_BLOCKS,
        ..Config::default()
    };
    let (_disk, fs) = mount(config);
    assert_eq!(fs.log_stats().log_size, 2 * OP_MAX_NUM_BLOCKS);

    let done = Arc::new(AtomicBool::new(false));
    let monitor = {
        let fs = Arc::clone(&fs);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                let stats = fs.log_stats();
                assert!(stats.log_used <= stats.log_size, "{stats:?}");
                assert!(stats.outstanding <= 2, "{stats:?}");
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                for _ in 0..20 {
                    let mut ctx = fs.begin_op();
                    let block_no = fs.cache().alloc(&mut ctx);
                    fs.cache().free(&mut ctx, block_no);
                    fs.end_op(ctx);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    done.store(true, Ordering::Relaxed);
    monitor.join().unwrap();

    let stats = fs.log_stats();
    assert_eq!(stats.phase, LogPhase::Idle);
    assert_eq!(stats.log_used, 0);
    assert_eq!(stats.outstanding, 0);
}

#[test]
fn test_concurrent_transactions_share_one_commit() {
    let (disk, fs) = mount(Config::default());
    let log_start = fs.super_block().log_start as usize;
    let commits = fs.log_stats().commits;
    let header_writes = disk.writes_to(log_start);

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = fs.begin_op();
                let block_no = fs.cache().alloc(&mut ctx);
                // both are inside before either ends
                barrier.wait();
                fs.end_op(ctx);
                block_no
            })
        })
        .collect();
    let blocks: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_ne!(blocks[0], blocks[1]);
    let stats = fs.log_stats();
    assert_eq!(stats.commits, commits + 1);
    // the commit record and the cleared header
    assert_eq!(disk.writes_to(log_start), header_writes + 2);
    // one bitmap block and the two zeroed blocks
    assert_eq!(stats.installed_blocks, 3);
}

#[test]
fn test_parallel_writers_in_separate_files() {
    const THREADS: usize = 4;
    let (disk, fs) = mount(Config::default());

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || {
                let mut files = FileTable::new(fs);
                let fd = files.open(&format!("/t{i}"), OpenFlags::CREATE).unwrap();
                let data = vec![i as u8 + 1; 4 * BSIZE + 7];
                assert_eq!(files.write(fd, &data).unwrap(), data.len());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    drop(fs);

    let fs = Arc::new(FileSystem::open(Arc::new(disk.snapshot()), Config::default()).unwrap());
    let mut files = FileTable::new(fs);
    for i in 0..THREADS {
        let fd = files.open(&format!("t{i}"), OpenFlags::READ).unwrap();
        let mut buf = vec![0u8; 8 * BSIZE];
        let n = files.read(fd, &mut buf).unwrap();
        assert_eq!(n, 4 * BSIZE + 7);
        assert!(buf[..n].iter().all(|&b| b == i as u8 + 1));
    }
}
