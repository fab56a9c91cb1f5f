use expensio::jobs::backoff::BackoffPolicy;
use std::time::Duration;

#[test]
fn default_policy_doubles_from_one_second_up_to_thirty() {
    let policy = BackoffPolicy::default();
    let secs: Vec<u64> = (1..=7).map(|k| policy.delay_for(k).as_secs()).collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
}

#[test]
fn delay_matches_formula_for_every_retry() {
    let policy = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(5));
    for k in 1..=10u32 {
        let expected = (Duration::from_millis(250) * 2u32.pow(k - 1)).min(Duration::from_secs(5));
        assert_eq!(policy.delay_for(k), expected, "retry {k}");
    }
}

#[test]
fn attempt_zero_is_treated_as_first_retry() {
    let policy = BackoffPolicy::default();
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
}

#[test]
fn huge_attempt_counts_saturate_at_cap() {
    let policy = BackoffPolicy::default();
    assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
}
