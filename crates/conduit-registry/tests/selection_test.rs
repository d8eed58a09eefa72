//! Selection guarantees across registry churn

use chrono::{Duration as ChronoDuration, Utc};
use conduit_registry::{
    DataPlaneInstance, DataPlaneRegistry, HealthStatus, RegistryError, Selector, TransportType,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn http_pull() -> TransportType {
    TransportType::new("HTTP-PULL")
}

#[test]
fn test_never_selects_unreachable_or_excluded() {
    let registry = Arc::new(DataPlaneRegistry::default());
    let t0 = Utc::now();

    // dp-0..dp-9, loads descending so the stale ones would otherwise win
    for n in 0..10u32 {
        let heartbeat = if n % 3 == 0 {
            t0
        } else {
            t0 + ChronoDuration::seconds(100)
        };
        registry.register_at(
            DataPlaneInstance::new(format!("dp-{}", n), ["HTTP-PULL"]).with_load(10 - n),
            heartbeat,
        );
    }
    registry.evict_stale(t0 + ChronoDuration::seconds(110), Duration::from_secs(30));

    let selector = Selector::new(registry.clone());
    let mut excluded: Vec<String> = Vec::new();

    loop {
        match selector.select(&http_pull(), &excluded) {
            Ok(chosen) => {
                assert_ne!(chosen.health(), HealthStatus::Unreachable);
                assert!(!excluded.contains(&chosen.id));
                excluded.push(chosen.id);
            }
            Err(RegistryError::NoEligibleDataPlane { .. }) => break,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    // Only the six instances with a fresh heartbeat were ever handed out
    assert_eq!(excluded.len(), 6);
    // ...in ascending load order
    assert_eq!(excluded.first().map(String::as_str), Some("dp-8"));
}

#[test]
fn test_concurrent_registration_and_selection() {
    let registry = Arc::new(DataPlaneRegistry::default());
    registry.register(DataPlaneInstance::new("anchor", ["HTTP-PULL"]).with_load(50));

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..200u32 {
                    registry.register(
                        DataPlaneInstance::new(format!("dp-{}-{}", w, i % 5), ["HTTP-PULL"])
                            .with_load(i % 40),
                    );
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let selector = Selector::new(registry.clone());
            thread::spawn(move || {
                for _ in 0..200 {
                    let chosen = selector.select(&http_pull(), &[]).unwrap();
                    assert!(chosen.load <= 50);
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    assert_eq!(registry.len(), 21);
}
