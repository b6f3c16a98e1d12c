use super::*;

use std::collections::HashSet;

use proptest::prelude::*;

#[test]
fn bounded_pool_backpressure() {
    let mut pool = FreeList::new(PoolConfig::bounded("frags", 4), |_| 0u32).unwrap();
    let refs: Vec<_> = (0..4).map(|_| pool.get_element_no_lock(0).unwrap()).collect();
    assert_eq!(refs.iter().collect::<HashSet<_>>().len(), 4);

    let err = pool.get_element_no_lock(0).unwrap_err();
    assert!(matches!(err, Error::TempOutOfResource(_)));
    assert!(err.is_retryable());

    assert!(pool.return_element_no_lock(refs[2]));
    let again = pool.get_element_no_lock(0).unwrap();
    assert!(!refs.iter().enumerate().any(|(i, r)| i != 2 && *r == again));
    assert_eq!(again.index(), refs[2].index());
    assert_ne!(again, refs[2]);
}

#[test]
fn stale_return_is_ignored() {
    let mut pool = FreeList::new(PoolConfig::bounded("frags", 2), |_| ()).unwrap();
    let r = pool.get_element_no_lock(0).unwrap();
    assert!(pool.return_element_no_lock(r));
    assert!(!pool.return_element_no_lock(r));
    assert_eq!(pool.num_free(), 1);
    assert!(pool.get(r).is_none());
}

#[test]
fn exhaustion_becomes_permanent_after_retries() {
    let cfg = PoolConfig {
        max_retries: 2,
        ..PoolConfig::bounded("frags", 1)
    };
    let mut pool = FreeList::new(cfg, |_| ()).unwrap();
    let _held = pool.get_element_no_lock(0).unwrap();
    assert!(pool.get_element_no_lock(0).unwrap_err().is_retryable());
    assert!(pool.get_element_no_lock(0).unwrap_err().is_retryable());
    let err = pool.get_element_no_lock(0).unwrap_err();
    assert!(matches!(err, Error::OutOfResource(_)));
    assert!(err.is_resource() && !err.is_retryable());
}

#[test]
fn pool_grows_by_chunks() {
    let cfg = PoolConfig {
        pages_per_list: 1,
        ..PoolConfig::new("descs", 1024)
    };
    let mut pool = FreeList::new(cfg, |_| ()).unwrap();
    assert_eq!(pool.capacity(), 4);
    let refs: Vec<_> = (0..5).map(|_| pool.get_element_no_lock(0).unwrap()).collect();
    assert_eq!(pool.capacity(), 8);
    assert_eq!(pool.pages(0), 2);
    assert_eq!(refs.iter().collect::<HashSet<_>>().len(), 5);
}

#[test]
fn pool_grows_at_the_threshold() {
    let cfg = PoolConfig {
        pages_per_list: 1,
        grow_threshold: 1,
        ..PoolConfig::new("descs", 1024)
    };
    let mut pool = FreeList::new(cfg, |_| ()).unwrap();
    for _ in 0..3 {
        pool.get_element_no_lock(0).unwrap();
    }
    assert_eq!(pool.capacity(), 4);
    assert_eq!(pool.num_free(), 1);

    // One free is not below the threshold, but it is at it.
    pool.get_element_no_lock(0).unwrap();
    assert_eq!(pool.capacity(), 8);
    assert_eq!(pool.num_free(), 4);
}

#[test]
fn parent_budget_caps_growth() {
    let budget = PageBudget::new(3);
    let cfg = |label| PoolConfig {
        parent: Some(budget.clone()),
        ..PoolConfig::bounded(label, 8)
    };
    let mut a = FreeList::new(cfg("a"), |_| ()).unwrap();
    let mut b = FreeList::new(cfg("b"), |_| ()).unwrap();

    a.get_element_no_lock(0).unwrap();
    a.get_element_no_lock(0).unwrap();
    b.get_element_no_lock(0).unwrap();
    assert_eq!(budget.used(), 3);
    assert!(b.get_element_no_lock(0).unwrap_err().is_retryable());
    assert!(a.get_element_no_lock(0).unwrap_err().is_retryable());
}

#[test]
fn affinity_selects_list() {
    let cfg = PoolConfig {
        num_lists: 2,
        affinity: vec![7, 3],
        enforce_affinity: true,
        ..PoolConfig::bounded("numa", 2)
    };
    let mut pool = FreeList::new(cfg, |list| list).unwrap();

    let r = pool.get_element_no_lock(3).unwrap();
    assert_eq!(pool.get(r), Some(&1));
    let r = pool.get_element_no_lock(7).unwrap();
    assert_eq!(pool.get(r), Some(&0));

    // Both lists are at the page limit: enforced affinity cannot borrow.
    assert!(pool.get_element_no_lock(3).is_err());
}

#[test]
fn affinity_borrows_when_not_enforced() {
    let cfg = PoolConfig {
        num_lists: 2,
        pages_per_list: 1,
        max_pages: Some(2),
        ..PoolConfig::bounded("numa", 2)
    };
    let mut pool = FreeList::new(cfg, |list| list).unwrap();
    let first = pool.get_element_no_lock(0).unwrap();
    let second = pool.get_element_no_lock(0).unwrap();
    assert_eq!(pool.get(first), Some(&0));
    assert_eq!(pool.get(second), Some(&1));
}

#[test]
fn bad_config_is_rejected() {
    let cfg = PoolConfig {
        num_lists: 2,
        affinity: vec![0],
        ..PoolConfig::new("bad", 64)
    };
    assert!(matches!(FreeList::new(cfg, |_| ()), Err(Error::Setup(_))));

    let cfg = PoolConfig {
        chunk_size: 100,
        ..PoolConfig::new("bad", 64)
    };
    assert!(matches!(FreeList::new(cfg, |_| ()), Err(Error::Setup(_))));
}

#[test]
fn locked_pool_waits_for_a_return() {
    let cfg = PoolConfig {
        retry_on_exhaustion: true,
        max_retries: usize::MAX,
        ..PoolConfig::bounded("shared", 1)
    };
    let pool = Arc::new(LockedFreeList::new(FreeList::new(cfg, |_| ()).unwrap(), true));
    let held = pool.get_element(0).unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            tx.send(()).unwrap();
            pool.get_element(0)
        })
    };
    rx.recv().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(pool.return_element(held));

    let got = waiter.join().unwrap().unwrap();
    assert_eq!(got.index(), held.index());
    assert_eq!(pool.num_free(), 0);
}

#[test]
fn locked_pool_runs_closures_on_live_elements() {
    let pool = LockedFreeList::new(FreeList::new(PoolConfig::bounded("ctr", 1), |_| 0u64).unwrap(), false);
    let r = pool.get_element(0).unwrap();
    assert_eq!(pool.with(r, |v| {
        *v += 5;
        *v
    }), Some(5));
    pool.return_element(r);
    assert_eq!(pool.with(r, |v| *v), None);
}

proptest! {
    #[test]
    fn live_refs_never_alias(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
        let mut pool = FreeList::new(PoolConfig::bounded("prop", 16), |_| ()).unwrap();
        let mut live: Vec<ElemRef> = Vec::new();
        for take in ops {
            if take {
                match pool.get_element_no_lock(0) {
                    Ok(r) => {
                        prop_assert!(live.iter().all(|l| l.index() != r.index()));
                        live.push(r);
                    }
                    Err(e) => {
                        prop_assert!(e.is_resource());
                        prop_assert_eq!(live.len(), 16);
                    }
                }
            } else if let Some(r) = live.pop() {
                prop_assert!(pool.return_element_no_lock(r));
            }
            prop_assert_eq!(live.len() + pool.num_free(), pool.capacity());
        }
    }
}
