//! End-to-end scheduling scenarios against the loopback engine.

mod common;

use std::time::Duration;

use chirp::Mode;
use chirp_protocol::types::SessionId;
use common::{bundle_due_in, fixture, wait_until};

#[test]
fn preemption_dispatches_the_later_earlier_bundle_first() {
    let f = fixture(Mode::SharedMemory);

    // A: far future, tagged; B arrives 50ms later but is due much sooner
    let a = bundle_due_in(&f.supervisor, 2_000, 0);
    f.supervisor.send_with_options(&a, SessionId(0), Some("far")).unwrap();

    std::thread::sleep(Duration::from_millis(50));

    let b = bundle_due_in(&f.supervisor, 300, 0);
    f.supervisor.send_with_options(&b, SessionId(0), Some("soon")).unwrap();

    // within 400ms of the start: B dispatched, A still pending
    assert!(wait_until(Duration::from_millis(350), || f.log.bundles() == 1));

    let stats = f.supervisor.scheduler_stats().unwrap();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.pending, 1);

    f.supervisor.cancel_tag("far").unwrap();
    assert!(wait_until(Duration::from_millis(200), || {
        f.supervisor.scheduler_stats().unwrap().pending == 0
    }));
    assert_eq!(f.supervisor.scheduler_stats().unwrap().cancelled, 1);
}

#[test]
fn cancel_to_idle_then_active_again() {
    let f = fixture(Mode::SharedMemory);

    for _ in 0..10 {
        let bundle = bundle_due_in(&f.supervisor, 10_000, 0);
        f.supervisor.send_with_options(&bundle, SessionId(3), Some("batch")).unwrap();
    }

    assert!(wait_until(Duration::from_millis(200), || {
        f.supervisor.scheduler_stats().unwrap().pending == 10
    }));

    f.supervisor.cancel_all().unwrap();
    assert!(wait_until(Duration::from_millis(200), || {
        let stats = f.supervisor.scheduler_stats().unwrap();
        stats.pending == 0 && stats.cancelled == 10
    }));

    // idle heap re-arms for fresh work
    let bundle = bundle_due_in(&f.supervisor, 250, 0);
    f.supervisor.send(&bundle).unwrap();

    assert!(wait_until(Duration::from_millis(400), || {
        let stats = f.supervisor.scheduler_stats().unwrap();
        stats.dispatched == 1 && stats.pending == 0
    }));
    assert_eq!(f.log.bundles(), 1);
}

#[test]
fn suspended_host_backpressures_into_the_retry_queue() {
    let f = fixture(Mode::SharedMemory);

    f.supervisor.suspend().unwrap();

    // ~400 bundles of ~3KB each overflow the 768KB IN ring once the
    // prescheduler starts dispatching at due - lookahead
    for _ in 0..400 {
        let bundle = bundle_due_in(&f.supervisor, 1_000, 3_000);
        f.supervisor.send(&bundle).unwrap();
    }

    let stats = f.supervisor.scheduler_stats().unwrap();
    assert_eq!(stats.scheduled, 400);

    // wait past the dispatch deadline: the ring fills, the rest backlog
    assert!(wait_until(Duration::from_millis(1_500), || {
        f.supervisor.scheduler_stats().unwrap().retry_depth > 0
    }));

    let stats = f.supervisor.scheduler_stats().unwrap();
    assert!(stats.retry_peak > 0);
    assert_eq!(stats.retries_failed, 0);
    assert_eq!(
        stats.scheduled,
        stats.dispatched + stats.pending as u64 + stats.retry_depth as u64,
    );

    // resume: the worklet drains, retries go through
    let mut supervisor = f.supervisor;
    supervisor.resume().unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        let stats = supervisor.scheduler_stats().unwrap();
        stats.retry_depth == 0 && stats.pending == 0
    }));

    let stats = supervisor.scheduler_stats().unwrap();
    assert_eq!(stats.retries_failed, 0);
    assert_eq!(stats.dispatched, 400);
    assert!(stats.retries_succeeded > 0);
}

#[test]
fn headroom_gauge_is_observable_in_both_modes() {
    use chirp_protocol::metrics::MetricId;

    for mode in [Mode::SharedMemory, Mode::MessagePort] {
        let f = fixture(mode);

        let bundle = bundle_due_in(&f.supervisor, 400, 0);
        f.supervisor.send(&bundle).unwrap();

        assert!(wait_until(Duration::from_millis(600), || {
            f.supervisor.scheduler_stats().unwrap().dispatched == 1
        }));

        let report = f.supervisor.stats().unwrap();
        let headroom = report
            .metrics
            .iter()
            .find(|metric| metric.name == MetricId::MinHeadroomMs.name())
            .and_then(|metric| metric.value);
        assert!(headroom.is_some(), "headroom gauge unset in {mode} mode");
        assert!(report.render().contains("chirp_presched_min_headroom_ms"));
    }
}

#[test]
fn sequence_gap_on_the_reply_ring_is_counted() {
    use chirp_core::ring::{Ring, RingKind};
    use chirp_protocol::metrics::MetricId;

    let f = fixture(Mode::SharedMemory);

    // confirm the reply path works before the induced gap
    f.supervisor.sync(1, Duration::from_secs(2)).unwrap();

    // burn one sequence number on the OUT ring, as if the engine dropped
    // a reply on the floor
    let region = f.supervisor.shared_region().unwrap().clone();
    let layout = *f.supervisor.layout().unwrap();
    Ring::from_layout(region, &layout, RingKind::Out).skip_sequence();

    f.supervisor.sync(2, Duration::from_secs(2)).unwrap();

    assert!(wait_until(Duration::from_millis(500), || {
        let report = f.supervisor.stats().unwrap();
        report
            .metrics
            .iter()
            .find(|metric| metric.name == MetricId::OscInDropped.name())
            .and_then(|metric| metric.value)
            == Some(1)
    }));
}
