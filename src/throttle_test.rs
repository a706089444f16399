use std::time::{Duration, Instant};

use uuid::Uuid;

use super::*;

#[test]
fn first_send_is_allowed() {
    let throttle: Throttle<Uuid> = Throttle::new(Duration::from_millis(50));
    assert!(throttle.allow(Uuid::new_v4()));
}

#[test]
fn second_send_inside_window_is_blocked() {
    let throttle: Throttle<Uuid> = Throttle::new(Duration::from_millis(50));
    let key = Uuid::new_v4();
    let now = Instant::now();

    assert!(throttle.allow_at(key, now));
    assert!(!throttle.allow_at(key, now + Duration::from_millis(10)));
    assert!(throttle.allow_at(key, now + Duration::from_millis(50)));
}

#[test]
fn keys_do_not_starve_each_other() {
    // One user dragging two entities: each entity gets its own window.
    let throttle: Throttle<Uuid> = Throttle::new(Duration::from_millis(50));
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let now = Instant::now();

    assert!(throttle.allow_at(a, now));
    assert!(throttle.allow_at(b, now + Duration::from_millis(1)));
    assert!(!throttle.allow_at(a, now + Duration::from_millis(2)));
    assert!(!throttle.allow_at(b, now + Duration::from_millis(2)));
}

#[test]
fn reset_reopens_the_window() {
    let throttle: Throttle<Uuid> = Throttle::new(Duration::from_millis(50));
    let key = Uuid::new_v4();
    let now = Instant::now();

    assert!(throttle.allow_at(key, now));
    assert!(!throttle.allow_at(key, now + Duration::from_millis(1)));
    throttle.reset(&key);
    assert!(throttle.allow_at(key, now + Duration::from_millis(2)));
}
