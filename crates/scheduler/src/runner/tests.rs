use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{Clock, DelayPolicy};

use crate::manager::ConnectorManager;
use crate::runner::TraversalScheduler;
use crate::testing::{scripted_config, test_config, wait_until, Fixture, Script};

fn scheduler(fx: &Fixture, connectors: &[(&str, &str)]) -> TraversalScheduler {
    let manager = Arc::new(ConnectorManager::new(Arc::clone(&fx.ctx)));
    for (name, schedule) in connectors {
        manager.set_connector_config(name, scripted_config("1")).unwrap();
        manager.set_connector_schedule(name, schedule).unwrap();
    }
    TraversalScheduler::new(manager, fx.sink.clone())
}

/// Run one pass and wait for every batch it started to report back.
fn pass(fx: &Fixture, scheduler: &TraversalScheduler) -> usize {
    let before = fx.sink.len();
    let started = scheduler.run_pass();
    assert!(wait_until(Duration::from_secs(2), || fx.sink.len() == before + started));
    started
}

#[test]
fn polling_connector_converges_to_spaced_polls() {
    let fx = Fixture::new(test_config(1), Script::with_pages(&[4]));
    let scheduler = scheduler(&fx, &[("T", "T:10:5000:0-24")]);

    for _ in 0..20 {
        if pass(&fx, &scheduler) > 0 {
            if let Some((_, last, _)) = fx.sink.entries().last() {
                if last.policy == DelayPolicy::Poll {
                    assert!(fx.ctx.throttle.should_delay("T"));
                }
            }
        }
        fx.clock.advance(Duration::from_secs(1));
    }

    let entries = fx.sink.entries();
    let results: Vec<_> = entries.iter().map(|(_, r, _)| (r.count, r.policy)).collect();
    assert_eq!(results[0], (4, DelayPolicy::Immediate));
    assert!(results.len() >= 4, "expected several polls, got {:?}", results);
    assert!(results[1..].iter().all(|r| *r == (0, DelayPolicy::Poll)));

    for pair in entries[1..].windows(2) {
        let spacing = pair[1].2 - pair[0].2;
        assert!(spacing >= chrono::Duration::seconds(5), "polls {}s apart", spacing.num_seconds());
    }

    // The backoff ends once the retry delay has elapsed.
    let last_poll = entries.last().unwrap().2;
    let waited = fx.clock.now() - last_poll;
    assert_eq!(fx.ctx.throttle.should_delay("T"), waited < chrono::Duration::seconds(5));
}

#[test]
fn pass_never_double_submits() {
    let fx = Fixture::new(test_config(2), Script::with_pages(&[4]));
    fx.script.block.store(true, Ordering::SeqCst);
    let scheduler = scheduler(&fx, &[("web", "web:100:5000:0-24")]);

    assert_eq!(scheduler.run_pass(), 1);
    assert_eq!(scheduler.run_pass(), 0);
    assert_eq!(scheduler.run_pass(), 0);
    assert!(wait_until(Duration::from_secs(1), || fx.script.entered.load(Ordering::SeqCst) == 1));
    assert_eq!(scheduler.metrics().running_batches, 1);

    scheduler.manager().remove_connector("web").unwrap();
    assert!(wait_until(Duration::from_secs(1), || fx.ctx.pool.busy_workers() == 0));
    assert_eq!(scheduler.run_pass(), 0);
    assert_eq!(scheduler.metrics().known_connectors, 0);
}

#[test]
fn pass_respects_window_and_load_budget() {
    let fx = Fixture::new(test_config(2), Script::with_pages(&[50, 50]));
    let scheduler = scheduler(
        &fx,
        &[("night", "night:100:5000:1-3"), ("day", "day:10:5000:0-24")],
    );

    assert_eq!(pass(&fx, &scheduler), 1);
    assert_eq!(fx.sink.entries()[0].0, "day");
    assert_eq!(fx.sink.results()[0].count, 10);
    let m = scheduler.metrics();
    assert_eq!(m.hours_until_window["night"], 13);
    assert_eq!(m.hours_until_window["day"], 0);

    // Budget for the minute is spent.
    assert_eq!(pass(&fx, &scheduler), 0);
    fx.clock.advance(Duration::from_secs(61));
    assert_eq!(pass(&fx, &scheduler), 1);
}

#[test]
fn metrics_follow_results() {
    let fx = Fixture::new(test_config(1), Script::with_pages(&[4]));
    let scheduler = scheduler(&fx, &[("web", "web:100:5000:0-24")]);

    pass(&fx, &scheduler);
    let m = scheduler.metrics();
    assert_eq!(m.passes, 1);
    assert_eq!(m.started_last_pass, 1);
    assert_eq!(m.known_connectors, 1);
    assert_eq!(m.live_workers, 1);
    assert_eq!(m.batches_completed["web"], 1);
    assert_eq!(m.items_traversed["web"], 4);
    assert_eq!(m.now, Some(fx.clock.now()));
    assert_eq!(m.hours_until_window["web"], 0);

    // The next pass sees the first batch's throughput.
    pass(&fx, &scheduler);
    assert_eq!(scheduler.metrics().throughput["web"], 240.0);

    scheduler.manager().remove_connector("web").unwrap();
    scheduler.run_pass();
    let m = scheduler.metrics();
    assert!(m.batches_completed.is_empty());
    assert!(m.throughput.is_empty());
}

#[test]
fn failing_connector_does_not_stop_the_pass() {
    let fx = Fixture::new(test_config(1), Script::with_pages(&[4]));
    let scheduler = scheduler(&fx, &[("a", "a:100:5000:0-24"), ("b", "b:100:5000:0-24")]);

    fx.ctx.pool.shutdown(false, Duration::from_millis(100));
    assert_eq!(scheduler.run_pass(), 0);
    assert_eq!(scheduler.metrics().passes, 1);
}

#[test]
fn spawned_loop_runs_until_shutdown() {
    let fx = Fixture::new(test_config(1), Script::with_pages(&[4]));
    let scheduler = Arc::new(scheduler(&fx, &[("web", "web:100:5000:0-24")]));

    let handle = Arc::clone(&scheduler).spawn().unwrap();
    assert!(wait_until(Duration::from_secs(2), || fx.sink.len() >= 2));

    assert!(scheduler.shutdown());
    handle.join().unwrap();
    assert!(fx.ctx.pool.is_shut_down());
    assert!(scheduler.metrics().passes >= 2);
}
