//! Circuit breaker integration tests - per-provider configuration

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use failover_relay::clock::{Clock, ManualClock};
use failover_relay::config::CircuitBreakerConfig;
use failover_relay::failsafe::{CircuitBreaker, CircuitState};
use failover_relay::provider::ProviderId;

fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let cb = CircuitBreaker::new(config, Arc::clone(&clock) as Arc<dyn Clock>);
    (cb, clock)
}

fn config(threshold: u32, open_for: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        failure_threshold: threshold,
        timeout_duration: open_for,
        retry_timeout: Duration::from_secs(300),
    }
}

#[test]
fn test_circuit_breaker_with_custom_config() {
    // Stricter than the default threshold of 5
    let (cb, _) = breaker(config(3, Duration::from_secs(60)));
    let provider = ProviderId::from("custom-provider");

    for _ in 0..2 {
        cb.record_failure(&provider);
    }
    assert!(cb.try_acquire(&provider).is_ok());

    cb.record_failure(&provider); // Third failure
    assert!(cb.try_acquire(&provider).is_err());
}

#[test]
fn test_per_provider_override_with_lenient_config() {
    let (cb, _) = breaker(config(5, Duration::from_secs(30)));
    let flaky = ProviderId::from("flaky-provider");
    cb.configure(&flaky, config(10, Duration::from_secs(30)));

    // Should still be closed after 5 failures (default would open)
    for _ in 0..5 {
        cb.record_failure(&flaky);
    }
    assert_eq!(cb.state(&flaky), CircuitState::Closed);

    for _ in 0..5 {
        cb.record_failure(&flaky);
    }
    assert_eq!(cb.state(&flaky), CircuitState::Open);
}

#[test]
fn test_status_message_format() {
    let (cb, clock) = breaker(config(3, Duration::from_secs(30)));
    let provider = ProviderId::from("test-provider");

    let message = cb.status_message(&provider);
    assert!(message.contains("test-provider"));
    assert!(message.contains("closed"));

    for _ in 0..3 {
        cb.record_failure(&provider);
    }
    clock.advance(Duration::from_millis(500));

    let message = cb.status_message(&provider);
    assert!(message.contains("Provider 'test-provider'"));
    assert!(message.contains("circuit breaker is open"));
    assert!(message.contains("3 failures"));
    assert!(message.contains("retry in 30 seconds"));
}

#[test]
fn test_disabled_circuit_breaker_config() {
    let (cb, _) = breaker(CircuitBreakerConfig {
        enabled: false,
        ..config(3, Duration::from_secs(30))
    });
    let provider = ProviderId::from("disabled-provider");

    // Should never open, even with many failures
    for _ in 0..100 {
        cb.record_failure(&provider);
    }
    assert!(cb.try_acquire(&provider).is_ok());
    assert!(cb.status_message(&provider).contains("closed"));
}

#[test]
fn test_half_open_state_message() {
    let (cb, clock) = breaker(config(2, Duration::from_millis(10)));
    let provider = ProviderId::from("recovery-provider");

    cb.record_failure(&provider);
    cb.record_failure(&provider);
    assert!(cb.try_acquire(&provider).is_err());

    clock.advance(Duration::from_millis(15));

    let message = cb.status_message(&provider);
    assert!(message.contains("half-open"));
    assert!(message.contains("testing recovery"));

    let permit = cb.try_acquire(&provider).unwrap();
    assert!(permit.is_trial());
    permit.success();
    assert_eq!(cb.state(&provider), CircuitState::Closed);
}

#[test]
fn test_multiple_providers_independent_state() {
    let (cb, _) = breaker(config(3, Duration::from_secs(30)));
    let first = ProviderId::from("provider-1");
    let second = ProviderId::from("provider-2");

    for _ in 0..3 {
        cb.record_failure(&first);
    }

    assert!(cb.try_acquire(&first).is_err());
    assert!(cb.status_message(&first).contains("is open"));

    assert!(cb.try_acquire(&second).is_ok());
    assert!(cb.status_message(&second).contains("closed"));
}

#[test]
fn test_half_open_admits_one_trial_across_threads() {
    let (cb, clock) = breaker(config(1, Duration::from_secs(5)));
    let cb = Arc::new(cb);
    let provider = ProviderId::from("contended");

    cb.record_failure(&provider);
    clock.advance(Duration::from_secs(5));

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cb = Arc::clone(&cb);
            let barrier = Arc::clone(&barrier);
            let provider = provider.clone();
            thread::spawn(move || {
                barrier.wait();
                // Keep the permit alive so no one else can take the slot
                cb.try_acquire(&provider).ok()
            })
        })
        .collect();

    let permits: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(permits.len(), 1);
    assert!(permits[0].is_trial());
}

#[test]
fn test_dropped_trial_frees_slot() {
    let (cb, clock) = breaker(config(1, Duration::from_secs(5)));
    let provider = ProviderId::from("abandoned");

    cb.record_failure(&provider);
    clock.advance(Duration::from_secs(5));

    let permit = cb.try_acquire(&provider).unwrap();
    assert!(cb.try_acquire(&provider).is_err());
    drop(permit);

    let permit = cb.try_acquire(&provider).unwrap();
    assert!(permit.is_trial());
    permit.failure();
    assert_eq!(cb.state(&provider), CircuitState::Open);
}
