//! Memory Safety Property Tests
//!
//! These tests exercise the runtime through its public surface:
//! - No reuse of freed memory before revocation
//! - Quota conservation across allocate, claim and free
//! - Seal/unseal round trips, opacity and destroy finality
//! - Epoch monotonicity and the two-epoch rule

use panther_rt::{
    epoch_finished, AllocatorCapability, Capability, HeapError, Permissions, RecordState,
    Runtime, RuntimeConfig, RevokerMode, Timeout,
};

fn runtime(size: usize, mode: RevokerMode) -> Runtime {
    Runtime::new(
        RuntimeConfig::new()
            .with_heap_size(size)
            .with_revoker_mode(mode)
            .with_sweep_slots(8),
    )
    .unwrap()
}

/// Kick a sweep and tick it to completion.
fn full_cycle(rt: &Runtime) {
    rt.kick();
    while !rt.tick() {}
}

fn alloc(rt: &Runtime, quota: &AllocatorCapability, size: usize) -> Capability {
    rt.allocate(&mut Timeout::non_blocking(), quota, size).unwrap()
}

#[test]
fn test_scenario_no_premature_reuse() {
    let rt = runtime(8192, RevokerMode::Background);
    let _space = rt.compartment_space();
    let quota = rt.quota_new(1024).unwrap();

    let first = alloc(&rt, &quota, 64);
    assert_eq!(rt.quota_remaining(&quota), Ok(960));
    rt.free(&quota, &first).unwrap();
    let freed_at = rt.epoch_get();
    assert_eq!(rt.quota_remaining(&quota), Ok(1024));

    // Immediate reallocation lands elsewhere.
    let second = alloc(&rt, &quota, 64);
    assert_ne!(second.base(), first.base());
    rt.free(&quota, &second).unwrap();

    // A sweep in progress is not enough.
    rt.kick();
    assert!(!rt.epoch_finished(freed_at, false));
    let during = alloc(&rt, &quota, 64);
    assert_ne!(during.base(), first.base());
    assert_ne!(during.base(), second.base());
    rt.free(&quota, &during).unwrap();
    while !rt.tick() {}

    full_cycle(&rt);
    assert!(rt.epoch_finished(freed_at, false));

    let reused = alloc(&rt, &quota, 64);
    assert_eq!(reused.base(), first.base());
    assert_ne!(reused.generation(), first.generation());
}

#[test]
fn test_stale_capabilities_fail_closed() {
    let rt = runtime(4096, RevokerMode::Synchronous);
    let space = rt.compartment_space();
    let quota = rt.quota_new(4096).unwrap();

    let cap = alloc(&rt, &quota, 128);
    let slot = space.lock().push(cap).unwrap();
    rt.store(&cap, 0, b"secret").unwrap();
    rt.free(&quota, &cap).unwrap();

    // The local copy never went through a sweep.
    let mut buf = [0u8; 6];
    assert_eq!(rt.load(&cap, 0, &mut buf), Err(HeapError::InvalidCapability));

    rt.quarantine_flush(&mut Timeout::new(1000)).unwrap();
    assert_eq!(rt.record_state(cap.base()), RecordState::Free);
    let held = space.lock().lookup(slot).unwrap();
    assert!(!held.is_valid());
    assert_eq!(rt.load(&held, 0, &mut buf), Err(HeapError::InvalidCapability));

    let fresh = alloc(&rt, &quota, 128);
    let mut contents = [0xffu8; 6];
    rt.load(&fresh, 0, &mut contents).unwrap();
    assert_eq!(contents, [0u8; 6]);
    assert_eq!(rt.load(&cap, 0, &mut buf), Err(HeapError::InvalidCapability));
}

#[test]
fn test_quota_conservation() {
    let rt = runtime(16384, RevokerMode::Synchronous);
    let quotas: Vec<_> = (0..3).map(|_| rt.quota_new(2048).unwrap()).collect();

    let a = alloc(&rt, &quotas[0], 100); // 104
    let b = alloc(&rt, &quotas[1], 256);
    let c = alloc(&rt, &quotas[2], 8);
    assert_eq!(rt.claim(&quotas[1], &a), Ok(104));
    assert_eq!(rt.claim(&quotas[2], &a), Ok(104));
    assert_eq!(rt.claim(&quotas[2], &a), Ok(104));
    assert_eq!(rt.claim(&quotas[0], &b), Ok(256));

    let charged = |ix: usize| 2048 - rt.quota_remaining(&quotas[ix]).unwrap();
    assert_eq!(charged(0), 104 + 256);
    assert_eq!(charged(1), 256 + 104);
    assert_eq!(charged(2), 8 + 104);

    rt.free(&quotas[0], &a).unwrap();
    rt.free(&quotas[2], &a).unwrap();
    assert_eq!(charged(0), 256);
    assert_eq!(charged(2), 8 + 104);
    rt.free(&quotas[2], &a).unwrap();
    assert_eq!(charged(2), 8);
    assert_eq!(rt.record_state(a.base()), RecordState::Allocated);
    rt.free(&quotas[1], &a).unwrap();
    assert_eq!(rt.record_state(a.base()), RecordState::PendingRevocation);

    assert_eq!(rt.free_all(&quotas[0]), Ok(256));
    assert_eq!(rt.free_all(&quotas[1]), Ok(256));
    rt.free(&quotas[2], &c).unwrap();
    for ix in 0..3 {
        assert_eq!(charged(ix), 0);
    }

    rt.quarantine_flush(&mut Timeout::new(1000)).unwrap();
    assert_eq!(rt.available(), 16384);
}

#[test]
fn test_scenario_seal_round_trip() {
    let rt = runtime(4096, RevokerMode::Synchronous);
    let quota = rt.quota_new(1024).unwrap();
    let key = rt.new_key().unwrap();
    let other = rt.new_key().unwrap();

    let (unsealed, sealed) = rt
        .seal_allocate(&mut Timeout::non_blocking(), &quota, &key, 16)
        .unwrap();
    let opened = rt.unseal(&key, &sealed).unwrap();
    assert_eq!(opened.address(), unsealed.address());
    assert_eq!(opened.length(), 16);
    assert!(rt.unseal(&other, &sealed).is_none());

    rt.store(&opened, 0, &[7; 16]).unwrap();
    let mut buf = [0u8; 16];
    rt.load(&unsealed, 0, &mut buf).unwrap();
    assert_eq!(buf, [7; 16]);
}

#[test]
fn test_seal_opacity() {
    let rt = runtime(4096, RevokerMode::Synchronous);
    let quota = rt.quota_new(1024).unwrap();
    let key = rt.new_key().unwrap();
    let (unsealed, sealed) = rt
        .seal_allocate(&mut Timeout::non_blocking(), &quota, &key, 32)
        .unwrap();
    let destroyed = rt
        .sealed_alloc(&mut Timeout::non_blocking(), &quota, &key, 32)
        .unwrap();
    rt.destroy(&quota, &key, &destroyed).unwrap();

    let failures = [
        rt.unseal(&rt.new_key().unwrap(), &sealed),
        rt.unseal(&key.permissions_and(Permissions::SEAL), &sealed),
        rt.unseal(&key, &unsealed),
        rt.unseal(&key, &sealed.with_address(sealed.address() + 8)),
        rt.unseal(&key, &destroyed),
        rt.unseal(&key, &Capability::null()),
    ];
    assert!(failures.iter().all(Option::is_none));
}

#[test]
fn test_destroy_finality() {
    let rt = runtime(4096, RevokerMode::Synchronous);
    let quota = rt.quota_new(1024).unwrap();
    let key = rt.new_key().unwrap();
    let (_, sealed) = rt
        .seal_allocate(&mut Timeout::non_blocking(), &quota, &key, 24)
        .unwrap();
    let copy = sealed;

    assert_eq!(rt.can_destroy(&quota, &key, &sealed), Ok(()));
    rt.destroy(&quota, &key, &sealed).unwrap();
    assert!(rt.unseal(&key, &copy).is_none());
    assert_eq!(
        rt.destroy(&quota, &key, &copy),
        Err(HeapError::InvalidCapability)
    );

    rt.quarantine_flush(&mut Timeout::new(1000)).unwrap();
    let _refill = alloc(&rt, &quota, 32);
    assert!(rt.unseal(&key, &copy).is_none());
}

#[test]
fn test_kick_always_advances() {
    let rt = runtime(4096, RevokerMode::Background);
    let _spaces: Vec<_> = (0..4).map(|_| rt.compartment_space()).collect();

    let mut last = rt.epoch_get();
    for round in 0..8 {
        if round % 3 == 1 {
            rt.tick();
        }
        let now = rt.kick();
        assert!(now.wrapping_sub(last) >= 1, "kick {} did not advance", round);
        assert_eq!(now, rt.epoch_get());
        last = now;
    }
}

#[test]
fn test_two_epoch_rule_mid_sweep() {
    let rt = runtime(1024, RevokerMode::Background);
    let quota = rt.quota_new(1024).unwrap();
    let whole = alloc(&rt, &quota, 1024);

    assert_eq!(rt.kick(), 1);
    rt.free(&quota, &whole).unwrap();
    let freed_at = rt.epoch_get();
    assert_eq!(freed_at, 1);

    let try_again = || rt.allocate(&mut Timeout::non_blocking(), &quota, 1024);

    while !rt.tick() {}
    assert_eq!(rt.epoch_get(), 2);
    assert!(!rt.epoch_finished(freed_at, false));
    assert!(rt.epoch_finished(freed_at, true));
    assert_eq!(try_again(), Err(HeapError::Timeout));

    assert_eq!(rt.kick(), 3);
    assert_eq!(try_again(), Err(HeapError::Timeout));
    while !rt.tick() {}
    assert!(rt.epoch_finished(freed_at, false));

    let reused = try_again().unwrap();
    assert_eq!(reused.base(), whole.base());
}

#[test]
fn test_epoch_rule_table() {
    for prev in [0u32, 1, 6, 7, u32::MAX - 1, u32::MAX] {
        let need = 2 + (prev & 1);
        for step in 0..need {
            assert!(!epoch_finished(prev.wrapping_add(step), prev, false));
        }
        assert!(epoch_finished(prev.wrapping_add(need), prev, false));
        assert!(epoch_finished(prev.wrapping_add(1), prev, true));
    }
}

#[test]
fn test_free_all_skips_sealed_objects() {
    let rt = runtime(4096, RevokerMode::Synchronous);
    let quota = rt.quota_new(1024).unwrap();
    let key = rt.new_key().unwrap();
    let _plain = alloc(&rt, &quota, 40);
    let sealed = rt
        .sealed_alloc(&mut Timeout::non_blocking(), &quota, &key, 16)
        .unwrap();

    assert_eq!(rt.free_all(&quota), Ok(40));
    assert!(rt.unseal(&key, &sealed).is_some());
    assert_eq!(rt.quota_remaining(&quota), Ok(1024 - 24));
}
