//! Polling round tests against mock nodes: threshold notifications, stop
//! relay, task pausing, skipped nodes and lifecycle alerts.

mod common;

use chrono::{Datelike, Local};
use common::{closed_address, MockNode};
use crawldeck::config::{self, Settings};
use crawldeck::events::EventBus;
use crawldeck::logstats;
use crawldeck::node_client::NodeClient;
use crawldeck::scheduler::{Scheduler, SchedulerConfig, SchedulerState};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn settings(addresses: &[String], extra: &str) -> Settings {
    let mut toml = String::from("[poll]\nrequest_interval_secs = 0\nrequest_timeout_secs = 5\n\n");
    for addr in addresses {
        toml.push_str(&format!("[[nodes]]\naddress = \"{}\"\n\n", addr));
    }
    toml.push_str(extra);
    config::parse_toml(&toml).unwrap()
}

fn build(settings: &Settings) -> (Scheduler, Arc<EventBus>) {
    let registry = Arc::new(settings.registry());
    let client = NodeClient::new().unwrap();
    let events = Arc::new(EventBus::new());
    let config = SchedulerConfig::from_settings(settings, &registry);
    let mut builder = Scheduler::builder(registry, client.clone(), Arc::clone(&events), config);
    if let Some(logs) = logstats::from_settings(settings, &client) {
        builder = builder.log_source(logs);
    }
    (builder.build(), events)
}

#[tokio::test]
async fn error_threshold_notifies_and_stops_job() {
    let node = MockNode::start().await;
    node.add_job("demo", "quotes", "j1", "running");
    node.set_log_count("demo", "quotes", "j1", "error_logs", 5);
    let s = settings(
        &[node.address()],
        "[notify.triggers.ERROR]\nthreshold = 3\nstop = true\n",
    );
    let (scheduler, events) = build(&s);

    let report = scheduler.run_round().await;

    assert_eq!(report.polled, vec![1]);
    assert_eq!(report.alerts, 1);
    assert_eq!(report.stopped_jobs, 1);
    let stops = node.stop_requests();
    assert_eq!(stops.len(), 1);
    assert_eq!((stops[0].project.as_str(), stops[0].job.as_str()), ("demo", "j1"));

    let notifs = events.recent_notifications(10);
    assert!(notifs.iter().any(|n| n.kind == "trigger" && n.title.contains("ERROR")));
    assert!(notifs.iter().any(|n| n.kind == "job_stopped"));
    assert!(!scheduler.task(1).unwrap().paused);
}

#[tokio::test]
async fn a_trigger_fires_once_per_job() {
    let node = MockNode::start().await;
    node.add_job("demo", "quotes", "j1", "running");
    node.set_log_count("demo", "quotes", "j1", "warning_logs", 10);
    let s = settings(&[node.address()], "[notify.triggers.WARNING]\nthreshold = 1\n");
    let (scheduler, events) = build(&s);

    let first = scheduler.run_round().await;
    node.set_log_count("demo", "quotes", "j1", "warning_logs", 20);
    let second = scheduler.run_round().await;

    assert_eq!(first.alerts, 1);
    assert_eq!(second.alerts, 0);
    assert!(node.stop_requests().is_empty());
    let triggers = events
        .recent_notifications(10)
        .into_iter()
        .filter(|n| n.kind == "trigger")
        .count();
    assert_eq!(triggers, 1);
}

#[tokio::test]
async fn force_stop_sends_twice_and_pauses_task() {
    let node = MockNode::start().await;
    node.add_job("demo", "quotes", "j1", "running");
    node.set_log_count("demo", "quotes", "j1", "critical_logs", 1);
    let s = settings(
        &[node.address()],
        "[notify.triggers.CRITICAL]\nthreshold = 1\nforce_stop = true\n",
    );
    let (scheduler, events) = build(&s);

    let report = scheduler.run_round().await;
    assert_eq!(report.stopped_jobs, 1);
    assert_eq!(node.stop_requests().len(), 2);
    assert!(scheduler.task(1).unwrap().paused);
    assert!(events
        .recent_notifications(10)
        .iter()
        .any(|n| n.kind == "task_paused"));

    let next = scheduler.run_round().await;
    assert_eq!(next.paused, vec![1]);
    assert!(next.polled.is_empty());

    scheduler.resume_task(1).unwrap();
    let resumed = scheduler.run_round().await;
    assert_eq!(resumed.polled, vec![1]);
    assert_eq!(node.stop_requests().len(), 2);
}

#[tokio::test]
async fn unreachable_node_is_skipped_others_polled() {
    let node = MockNode::start().await;
    node.add_project("demo");
    let down = closed_address().await;
    let s = settings(&[down, node.address()], "");
    let (scheduler, events) = build(&s);

    let report = scheduler.run_round().await;

    assert_eq!(report.skipped, vec![1]);
    assert_eq!(report.polled, vec![2]);
    assert!(scheduler.task(1).unwrap().last_error.is_some());
    assert!(scheduler.task(2).unwrap().last_polled.is_some());
    assert!(events.recent_events(10).iter().any(|e| e.kind == "warning"));
    assert!(events.recent_notifications(10).is_empty());
}

#[tokio::test]
async fn finished_job_is_announced_after_baseline() {
    let node = MockNode::start().await;
    node.add_job("demo", "quotes", "j1", "running");
    node.add_job("demo", "quotes", "old", "finished");
    let s = settings(&[node.address()], "[notify]\non_job_finished = true\n");
    let (scheduler, events) = build(&s);

    let baseline = scheduler.run_round().await;
    assert_eq!(baseline.alerts, 0);

    node.set_phase("demo", "j1", "finished");
    let report = scheduler.run_round().await;

    assert_eq!(report.alerts, 1);
    let notifs = events.recent_notifications(10);
    assert_eq!(notifs.len(), 1);
    assert_eq!(notifs[0].kind, "job_finished");
    assert!(notifs[0].title.contains("demo/quotes/j1"));
}

#[tokio::test]
async fn outside_working_days_stop_applies_without_alert() {
    let node = MockNode::start().await;
    node.add_job("demo", "quotes", "j1", "running");
    node.set_log_count("demo", "quotes", "j1", "error_logs", 9);
    let other_day = Local::now().weekday().number_from_monday() % 7 + 1;
    let extra = format!(
        "[notify]\nworking_days = [{}]\n\n[notify.triggers.ERROR]\nthreshold = 1\nstop = true\n",
        other_day
    );
    let s = settings(&[node.address()], &extra);
    let (scheduler, events) = build(&s);

    let report = scheduler.run_round().await;

    assert_eq!(report.alerts, 0);
    assert_eq!(node.stop_requests().len(), 1);
    assert!(events
        .recent_notifications(10)
        .iter()
        .all(|n| n.kind != "trigger"));
}

#[tokio::test]
async fn disabled_log_parser_means_no_evaluation() {
    let node = MockNode::start().await;
    node.add_job("demo", "quotes", "j1", "running");
    node.set_log_count("demo", "quotes", "j1", "error_logs", 9);
    let s = settings(
        &[node.address()],
        "[logparser]\nenable = false\n\n[notify.triggers.ERROR]\nthreshold = 1\nstop = true\n",
    );
    let (scheduler, _events) = build(&s);

    let report = scheduler.run_round().await;

    assert_eq!(report.polled, vec![1]);
    assert_eq!(report.alerts, 0);
    assert!(node.stop_requests().is_empty());
}

#[tokio::test]
async fn started_scheduler_polls_on_its_own() {
    let node = MockNode::start().await;
    node.add_project("demo");
    let mut s = settings(&[node.address()], "");
    s.poll.round_interval_secs = 3600;
    let (scheduler, _events) = build(&s);

    scheduler.start().unwrap();
    // The first tick of a tokio interval completes immediately.
    let mut polled = false;
    for _ in 0..100 {
        if scheduler.task(1).is_some_and(|t| t.rounds > 0) {
            polled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(polled);
    assert_eq!(scheduler.state(), SchedulerState::Running);

    scheduler.shutdown().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
}

#[tokio::test]
async fn pause_holds_ticks_and_resume_does_not_catch_up() {
    let node = MockNode::start().await;
    node.add_project("demo");
    let mut s = settings(&[node.address()], "");
    s.poll.round_interval_secs = 1;
    let (scheduler, _events) = build(&s);
    let rounds = |sch: &Scheduler| sch.task(1).map_or(0, |t| t.rounds);

    scheduler.start().unwrap();
    for _ in 0..100 {
        if rounds(&scheduler) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rounds(&scheduler), 1);

    scheduler.pause().unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(rounds(&scheduler), 1);

    // Two periods were missed while paused; none of them is replayed.
    scheduler.resume().unwrap();
    let resumed = Instant::now();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rounds(&scheduler), 1);

    while rounds(&scheduler) < 2 && resumed.elapsed() < Duration::from_millis(1800) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rounds(&scheduler), 2);
    assert!(resumed.elapsed() >= Duration::from_millis(900));

    scheduler.shutdown().await;
}
