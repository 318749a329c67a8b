use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tinyweb::pool::{ConnPool, PoolError};

#[test]
fn test_conn_pool_hands_out_each_handle() {
    let pool = ConnPool::new(vec![1, 2]);
    assert_eq!(pool.max_conn(), 2);

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_eq!(pool.free_count(), 0);
    assert_eq!(*a + *b, 3);

    drop(a);
    assert_eq!(pool.free_count(), 1);
    b.release();
    assert_eq!(pool.free_count(), 2);
}

#[test]
fn test_conn_pool_acquire_blocks_until_release() {
    let pool = Arc::new(ConnPool::new(vec!["only"]));
    let held = pool.acquire().unwrap();
    let acquired = Arc::new(AtomicBool::new(false));

    let waiter = {
        let pool = Arc::clone(&pool);
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            let conn = pool.acquire().unwrap();
            acquired.store(true, Ordering::SeqCst);
            assert_eq!(*conn, "only");
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!acquired.load(Ordering::SeqCst));

    drop(held);
    waiter.join().unwrap();
    assert!(acquired.load(Ordering::SeqCst));
    assert_eq!(pool.free_count(), 1);
}

#[test]
fn test_conn_pool_acquire_timeout() {
    let pool = ConnPool::new(vec![()]);
    let _held = pool.acquire().unwrap();

    let result = pool.acquire_timeout(Duration::from_millis(20));

    assert_eq!(result.err(), Some(PoolError::Timeout(Duration::from_millis(20))));
}

#[test]
fn test_conn_pool_close_fails_waiters() {
    let pool = Arc::new(ConnPool::new(vec![0u8]));
    let held = pool.acquire().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().err())
    };
    thread::sleep(Duration::from_millis(20));
    pool.close();

    assert_eq!(waiter.join().unwrap(), Some(PoolError::Closed));
    drop(held);
    assert_eq!(pool.free_count(), 0);
    assert_eq!(pool.acquire().err(), Some(PoolError::Closed));
}

#[test]
fn test_conn_pool_guard_derefs_mutably() {
    let pool = ConnPool::new(vec![String::from("a")]);
    {
        let mut conn = pool.acquire().unwrap();
        conn.push('b');
    }

    assert_eq!(*pool.acquire().unwrap(), "ab");
}
