mod common;

use common::{drain, realizations, wait_for_state, MockDriver};
use ensemble_scheduler::{
    realization::Realization,
    scheduler::{
        DispatchInfo, EnsembleOutcome, JobState, KillReason, Scheduler, SchedulerError,
        SchedulerOptions, CERT_FILE, JOBS_FILE,
    },
};
use std::{fs, sync::Arc};
use tokio::time::{sleep, Duration, Instant};

fn options(max_submit: u32) -> SchedulerOptions {
    SchedulerOptions {
        max_submit,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn empty_ensemble_stops_without_submissions() {
    let driver = Arc::new(MockDriver::new());
    let scheduler = Scheduler::new(driver.clone(), Vec::new(), options(2)).unwrap();

    assert_eq!(scheduler.execute(None).await.unwrap(), EnsembleOutcome::Stopped);
    assert!(driver.submission_times().is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_job_walks_through_all_states() {
    let driver = Arc::new(MockDriver::new());
    let scheduler = Scheduler::new(driver.clone(), realizations(1), options(5)).unwrap();
    let mut status = scheduler.take_status_events().unwrap();

    assert_eq!(scheduler.execute(None).await.unwrap(), EnsembleOutcome::Stopped);
    assert_eq!(driver.submissions_of(0), 1);

    let states: Vec<JobState> = drain(&mut status).into_iter().map(|event| event.state).collect();
    assert_eq!(
        states,
        [
            JobState::Waiting,
            JobState::Submitted,
            JobState::Running,
            JobState::Succeeded
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failing_job_is_attempted_max_submit_times() {
    for max_submit in 1..=3 {
        let driver = Arc::new(MockDriver::new().with_wait(|_| async { 1 }));
        let scheduler =
            Scheduler::new(driver.clone(), realizations(1), options(max_submit)).unwrap();

        assert_eq!(scheduler.execute(None).await.unwrap(), EnsembleOutcome::Stopped);
        assert_eq!(driver.submissions_of(0), max_submit as usize);

        let runtime = scheduler.runtime_state(0).unwrap();
        assert_eq!(runtime.state, JobState::Failed);
        assert_eq!(runtime.attempts, max_submit);
    }
}

#[tokio::test(start_paused = true)]
async fn successful_job_is_not_resubmitted() {
    let driver = Arc::new(MockDriver::new());
    let scheduler = Scheduler::new(driver.clone(), realizations(1), options(10)).unwrap();

    scheduler.execute(None).await.unwrap();
    assert_eq!(driver.submissions_of(0), 1);
    assert_eq!(scheduler.runtime_state(0).unwrap().state, JobState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn max_running_limits_concurrency() {
    for max_running in [0, 1, 2, 10] {
        let driver = Arc::new(MockDriver::new().with_wait(|_| async {
            sleep(Duration::from_millis(100)).await;
            0
        }));
        let options = SchedulerOptions {
            max_running,
            ..Default::default()
        };
        let scheduler = Scheduler::new(driver.clone(), realizations(10), options).unwrap();

        assert_eq!(scheduler.execute(None).await.unwrap(), EnsembleOutcome::Stopped);

        let expected = if max_running == 0 { 10 } else { max_running };
        assert_eq!(driver.max_concurrent(), expected, "max_running = {max_running}");
        assert_eq!(driver.submission_times().len(), 10);
    }
}

#[tokio::test(start_paused = true)]
async fn max_runtime_times_out_without_resubmit() {
    let driver = Arc::new(MockDriver::new().with_wait(|_| async {
        sleep(Duration::from_secs(100)).await;
        0
    }));
    let realization =
        Realization::new(0, "runs/realization-0", "job_dispatch").with_max_runtime(Duration::from_secs(1));
    let scheduler = Scheduler::new(driver.clone(), vec![realization], options(2)).unwrap();
    let mut status = scheduler.take_status_events().unwrap();

    assert_eq!(scheduler.execute(None).await.unwrap(), EnsembleOutcome::Stopped);
    assert_eq!(driver.submissions_of(0), 1);
    assert_eq!(driver.kills(), vec![0]);

    let runtime = scheduler.runtime_state(0).unwrap();
    assert_eq!(runtime.state, JobState::TimedOut);
    assert_eq!(runtime.kill_reason, Some(KillReason::Timeout));
    assert!(drain(&mut status)
        .iter()
        .any(|event| event.state == JobState::TimedOut));
}

#[tokio::test(start_paused = true)]
async fn cancel_all_jobs_returns_cancelled() {
    let driver = Arc::new(MockDriver::new().with_wait(|_| async {
        sleep(Duration::from_secs(100)).await;
        0
    }));
    let scheduler = Arc::new(Scheduler::new(driver.clone(), realizations(2), options(2)).unwrap());
    let mut status = scheduler.take_status_events().unwrap();

    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(None).await })
    };
    wait_for_state(&mut status, 0, JobState::Running).await;

    scheduler.cancel_all_jobs();
    // idempotent
    scheduler.kill_all_jobs();

    assert_eq!(run.await.unwrap().unwrap(), EnsembleOutcome::Cancelled);
    assert_eq!(driver.submissions_of(0), 1);
    assert_eq!(scheduler.runtime_state(0).unwrap().state, JobState::Killed);
    assert_eq!(scheduler.runtime_state(1).unwrap().state, JobState::Killed);
    assert!(!scheduler.is_active());
}

#[tokio::test(start_paused = true)]
async fn cancel_does_not_wait_for_submit_sleep() {
    let driver = Arc::new(MockDriver::new().with_wait(|_| async {
        sleep(Duration::from_secs(1000)).await;
        0
    }));
    let options = SchedulerOptions {
        max_running: 0,
        max_submit: 1,
        submit_sleep: Duration::from_secs(10),
    };
    let scheduler = Arc::new(Scheduler::new(driver.clone(), realizations(10), options).unwrap());
    let mut status = scheduler.take_status_events().unwrap();

    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(None).await })
    };
    loop {
        let event = status.recv().await.unwrap();
        if event.state == JobState::Running {
            break;
        }
    }

    let cancelled_at = Instant::now();
    scheduler.cancel_all_jobs();

    assert_eq!(run.await.unwrap().unwrap(), EnsembleOutcome::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(10));
    assert_eq!(driver.submission_times().len(), 1);
    for iens in 0..10 {
        assert_eq!(scheduler.runtime_state(iens).unwrap().state, JobState::Killed);
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_wins_over_timeout_during_slow_kill() {
    let driver = Arc::new(
        MockDriver::new()
            .with_wait(|_| async {
                sleep(Duration::from_secs(1000)).await;
                0
            })
            .with_kill(|_| sleep(Duration::from_secs(1))),
    );
    let realization =
        Realization::new(0, "runs/realization-0", "job_dispatch").with_max_runtime(Duration::from_secs(1));
    let scheduler = Arc::new(Scheduler::new(driver.clone(), vec![realization], options(2)).unwrap());
    let mut status = scheduler.take_status_events().unwrap();

    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(None).await })
    };
    wait_for_state(&mut status, 0, JobState::Running).await;
    sleep(Duration::from_millis(100)).await;
    scheduler.cancel_all_jobs();

    assert_eq!(run.await.unwrap().unwrap(), EnsembleOutcome::Cancelled);

    // the timer still fires while the kill is in flight
    let states: Vec<JobState> = drain(&mut status).into_iter().map(|event| event.state).collect();
    assert!(states.contains(&JobState::TimedOut));
    assert_eq!(states.last(), Some(&JobState::Killed));

    let runtime = scheduler.runtime_state(0).unwrap();
    assert_eq!(runtime.kill_reason, Some(KillReason::Cancel));
    assert_eq!(driver.kills(), vec![0]);
    assert_eq!(driver.submissions_of(0), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_timeout_kill_is_still_cancelled() {
    let driver = Arc::new(
        MockDriver::new()
            .with_wait(|_| async {
                sleep(Duration::from_secs(1000)).await;
                0
            })
            .with_kill(|_| sleep(Duration::from_secs(1))),
    );
    let realization =
        Realization::new(0, "runs/realization-0", "job_dispatch").with_max_runtime(Duration::from_secs(1));
    let scheduler = Arc::new(Scheduler::new(driver.clone(), vec![realization], options(2)).unwrap());
    let mut status = scheduler.take_status_events().unwrap();

    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(None).await })
    };
    wait_for_state(&mut status, 0, JobState::TimedOut).await;
    sleep(Duration::from_millis(500)).await;
    scheduler.cancel_all_jobs();

    assert_eq!(run.await.unwrap().unwrap(), EnsembleOutcome::Cancelled);
    assert_eq!(scheduler.runtime_state(0).unwrap().state, JobState::Killed);
    // no second kill for the cancel
    assert_eq!(driver.kills(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn min_required_realizations_stops_long_running_jobs() {
    let driver = Arc::new(MockDriver::new().with_wait(|iens| async move {
        if iens < 5 {
            sleep(Duration::from_millis(100)).await;
        } else {
            sleep(Duration::from_secs(100)).await;
        }
        0
    }));
    let scheduler = Scheduler::new(driver.clone(), realizations(10), options(2)).unwrap();

    assert_eq!(scheduler.execute(Some(5)).await.unwrap(), EnsembleOutcome::Stopped);

    let mut killed = driver.kills();
    killed.sort_unstable();
    assert_eq!(killed, (5..10).collect::<Vec<_>>());

    for iens in 0..5 {
        assert_eq!(scheduler.runtime_state(iens).unwrap().state, JobState::Succeeded);
    }
    for iens in 5..10 {
        let runtime = scheduler.runtime_state(iens).unwrap();
        assert_eq!(runtime.state, JobState::Killed);
        assert_eq!(runtime.kill_reason, Some(KillReason::StopLongRunning));
    }
}

#[tokio::test(start_paused = true)]
async fn stopping_skips_waiting_realizations() {
    let driver = Arc::new(MockDriver::new().with_wait(|_| async {
        sleep(Duration::from_millis(100)).await;
        0
    }));
    let options = SchedulerOptions {
        max_running: 1,
        ..Default::default()
    };
    let scheduler = Scheduler::new(driver.clone(), realizations(3), options).unwrap();

    assert_eq!(scheduler.execute(Some(1)).await.unwrap(), EnsembleOutcome::Stopped);
    assert_eq!(driver.submission_times().len(), 1);
    assert_eq!(scheduler.runtime_state(1).unwrap().state, JobState::Killed);
    assert_eq!(scheduler.runtime_state(2).unwrap().state, JobState::Killed);
}

#[tokio::test(start_paused = true)]
async fn one_failing_realization_among_ten() {
    let driver = Arc::new(MockDriver::new().with_wait(|iens| async move {
        if iens == 4 {
            1
        } else {
            0
        }
    }));
    let scheduler = Scheduler::new(driver.clone(), realizations(10), options(3)).unwrap();

    assert_eq!(scheduler.execute(None).await.unwrap(), EnsembleOutcome::Stopped);
    for iens in 0..10 {
        let expected = if iens == 4 { 3 } else { 1 };
        assert_eq!(driver.submissions_of(iens), expected, "realization {iens}");
    }
}

#[tokio::test(start_paused = true)]
async fn submit_sleep_spaces_submissions() {
    let driver = Arc::new(MockDriver::new());
    let options = SchedulerOptions {
        max_running: 0,
        max_submit: 1,
        submit_sleep: Duration::from_millis(100),
    };
    let scheduler = Scheduler::new(driver.clone(), realizations(10), options).unwrap();

    scheduler.execute(None).await.unwrap();

    let mut times = driver.submission_times();
    times.sort_unstable();
    assert_eq!(times.len(), 10);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(80));
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_submissions_count_as_attempts() {
    let driver = Arc::new(MockDriver::new().rejecting(0, 2));
    let scheduler = Scheduler::new(driver.clone(), realizations(1), options(3)).unwrap();

    scheduler.execute(None).await.unwrap();
    assert_eq!(driver.submissions_of(0), 3);
    let runtime = scheduler.runtime_state(0).unwrap();
    assert_eq!(runtime.state, JobState::Succeeded);
    assert_eq!(runtime.attempts, 3);

    let driver = Arc::new(MockDriver::new().rejecting(0, 5));
    let scheduler = Scheduler::new(driver.clone(), realizations(1), options(2)).unwrap();

    assert_eq!(scheduler.execute(None).await.unwrap(), EnsembleOutcome::Stopped);
    assert_eq!(driver.submissions_of(0), 2);
    assert_eq!(scheduler.runtime_state(0).unwrap().state, JobState::Failed);
}

#[tokio::test(start_paused = true)]
async fn inactive_realizations_are_skipped() {
    let driver = Arc::new(MockDriver::new());
    let mut ensemble = realizations(3);
    ensemble[1] = ensemble[1].clone().inactive();
    let scheduler = Scheduler::new(driver.clone(), ensemble, options(2)).unwrap();

    scheduler.execute(None).await.unwrap();
    assert_eq!(driver.submissions_of(0), 1);
    assert_eq!(driver.submissions_of(1), 0);
    assert_eq!(driver.submissions_of(2), 1);
    assert!(scheduler.runtime_state(1).is_none());
}

#[tokio::test(start_paused = true)]
async fn is_active_while_running() {
    let driver = Arc::new(MockDriver::new().with_wait(|_| async {
        sleep(Duration::from_secs(1)).await;
        0
    }));
    let scheduler = Arc::new(Scheduler::new(driver.clone(), realizations(1), options(1)).unwrap());
    let mut status = scheduler.take_status_events().unwrap();
    assert!(!scheduler.is_active());

    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(None).await })
    };
    wait_for_state(&mut status, 0, JobState::Running).await;
    assert!(scheduler.is_active());

    assert_eq!(run.await.unwrap().unwrap(), EnsembleOutcome::Stopped);
    assert!(!scheduler.is_active());
}

#[tokio::test(start_paused = true)]
async fn timed_out_job_is_active_until_its_kill_lands() {
    let driver = Arc::new(
        MockDriver::new()
            .with_wait(|_| async {
                sleep(Duration::from_secs(1000)).await;
                0
            })
            .with_kill(|_| sleep(Duration::from_secs(5))),
    );
    let realization =
        Realization::new(0, "runs/realization-0", "job_dispatch").with_max_runtime(Duration::from_secs(1));
    let scheduler = Arc::new(Scheduler::new(driver.clone(), vec![realization], options(1)).unwrap());
    let mut status = scheduler.take_status_events().unwrap();

    let run = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(None).await })
    };
    wait_for_state(&mut status, 0, JobState::TimedOut).await;
    assert!(scheduler.is_active());

    assert_eq!(run.await.unwrap().unwrap(), EnsembleOutcome::Stopped);
    assert_eq!(scheduler.runtime_state(0).unwrap().state, JobState::TimedOut);
    assert!(!scheduler.is_active());
}

#[tokio::test(start_paused = true)]
async fn driver_events_have_a_single_consumer() {
    let driver = Arc::new(MockDriver::new().with_wait(|_| async {
        sleep(Duration::from_secs(10)).await;
        0
    }));
    let first = Arc::new(Scheduler::new(driver.clone(), realizations(1), options(1)).unwrap());
    let mut status = first.take_status_events().unwrap();

    let run = {
        let scheduler = Arc::clone(&first);
        tokio::spawn(async move { scheduler.execute(None).await })
    };
    wait_for_state(&mut status, 0, JobState::Running).await;

    let second = Scheduler::new(driver.clone(), realizations(1), options(1)).unwrap();
    assert!(matches!(
        second.execute(None).await,
        Err(SchedulerError::AlreadyExecuting)
    ));

    assert_eq!(run.await.unwrap().unwrap(), EnsembleOutcome::Stopped);

    // the receiver is handed back after a run
    assert_eq!(second.execute(None).await.unwrap(), EnsembleOutcome::Stopped);
}

#[test]
fn zero_max_submit_is_rejected() {
    let driver = Arc::new(MockDriver::new());
    assert!(matches!(
        Scheduler::new(driver, realizations(1), options(0)),
        Err(SchedulerError::InvalidConfiguration(_))
    ));
}

fn ensemble_in(dir: &std::path::Path, count: usize) -> Vec<Realization> {
    (0..count)
        .map(|iens| {
            let runpath = dir.join(format!("realization-{iens}"));
            fs::create_dir_all(&runpath).unwrap();
            fs::write(
                runpath.join(JOBS_FILE),
                r#"{"jobList": [{"name": "eclipse"}], "run_id": "run-1"}"#,
            )
            .unwrap();
            Realization::new(iens, runpath, "job_dispatch")
        })
        .collect()
}

#[test]
fn dispatch_information_is_added_to_jobs_file() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockDriver::new());
    let scheduler = Scheduler::new(driver, ensemble_in(dir.path(), 2), options(1))
        .unwrap()
        .with_dispatch_info(DispatchInfo {
            ens_id: Some("ensemble-7".to_owned()),
            ee_uri: Some("wss://evaluator:51820/dispatch".to_owned()),
            ee_token: Some("secret".to_owned()),
            ee_cert: Some("-----BEGIN CERTIFICATE-----\n".to_owned()),
        });

    scheduler.add_dispatch_information_to_jobs_file().unwrap();

    let runpath = dir.path().join("realization-1");
    let content = fs::read_to_string(runpath.join(JOBS_FILE)).unwrap();
    let manifest: serde_json::Value = serde_json::from_str(&content).unwrap();

    assert_eq!(manifest["ens_id"], "ensemble-7");
    assert_eq!(manifest["real_id"], 1);
    assert_eq!(manifest["dispatch_url"], "wss://evaluator:51820/dispatch");
    assert_eq!(manifest["ee_token"], "secret");
    assert_eq!(
        manifest["ee_cert_path"],
        runpath.join(CERT_FILE).to_string_lossy().into_owned()
    );
    // existing content survives
    assert_eq!(manifest["run_id"], "run-1");
    assert_eq!(manifest["jobList"][0]["name"], "eclipse");

    assert_eq!(
        fs::read_to_string(runpath.join(CERT_FILE)).unwrap(),
        "-----BEGIN CERTIFICATE-----\n"
    );
}

#[test]
fn dispatch_information_without_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockDriver::new());
    let scheduler = Scheduler::new(driver, ensemble_in(dir.path(), 1), options(1))
        .unwrap()
        .with_dispatch_info(DispatchInfo {
            ee_uri: Some("ws://evaluator:51820".to_owned()),
            ..Default::default()
        });

    scheduler.add_dispatch_information_to_jobs_file().unwrap();

    let runpath = dir.path().join("realization-0");
    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(runpath.join(JOBS_FILE)).unwrap()).unwrap();
    assert!(manifest["ee_cert_path"].is_null());
    assert!(manifest["ens_id"].is_null());
    assert_eq!(manifest["real_id"], 0);
    assert!(!runpath.join(CERT_FILE).exists());
}

#[test]
fn missing_jobs_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MockDriver::new());
    let realization = Realization::new(0, dir.path().join("nowhere"), "job_dispatch");
    let scheduler = Scheduler::new(driver, vec![realization], options(1)).unwrap();

    assert!(matches!(
        scheduler.add_dispatch_information_to_jobs_file(),
        Err(SchedulerError::Io { .. })
    ));
}
