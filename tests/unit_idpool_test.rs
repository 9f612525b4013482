use timbre::core::idpool::SessionIdPool;

#[test]
fn test_ids_start_at_one_and_increment() {
    let mut pool = SessionIdPool::new();
    assert_eq!(pool.acquire(), 1);
    assert_eq!(pool.acquire(), 2);
    assert_eq!(pool.acquire(), 3);
    assert_eq!(pool.in_use(), 3);
}

#[test]
fn test_released_ids_are_reused_smallest_first() {
    let mut pool = SessionIdPool::new();
    let a = pool.acquire();
    let b = pool.acquire();
    let c = pool.acquire();
    pool.release(b);
    pool.release(a);
    assert_eq!(pool.acquire(), a);
    assert_eq!(pool.acquire(), b);
    let d = pool.acquire();
    assert!(d > c);
}

#[test]
fn test_release_of_unknown_id_is_ignored()
{
    let mut pool = SessionIdPool::new();
    pool.release(42);
    assert_eq!(pool.acquire(), 1);
    assert_eq!(pool.in_use(), 1);
}

#[test]
fn test_zero_is_never_handed_out() {
    let mut pool = SessionIdPool::new();
    pool.release(0);
    for _ in 0..16 {
        assert_ne!(pool.acquire(), 0);
    }
}
