use essay_batch::error::OperationError;
use essay_batch::orchestrator::{
    run_stage, CancellationController, ItemOutcome, RetryOutcome, WaveObserver, WaveOptions,
};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct WaveLog {
    waves: Vec<Range<usize>>,
    settled: usize,
    completed_waves: usize,
}

impl WaveObserver<usize> for WaveLog {
    fn on_wave_start(&mut self, _wave: usize, _total_waves: usize, indices: Range<usize>) {
        self.waves.push(indices);
    }

    fn on_settled(&mut self, _index: usize, _outcome: &ItemOutcome<usize>, _attempts: u32) {
        self.settled += 1;
    }

    fn on_wave_complete(&mut self, _wave: usize, _total_waves: usize) {
        self.completed_waves += 1;
    }
}

fn options(concurrency: usize) -> WaveOptions {
    WaveOptions {
        concurrency,
        inter_wave_delay: Duration::from_millis(10),
        abort_on_unreachable: true,
    }
}

#[tokio::test]
async fn test_forty_items_run_in_three_waves_within_concurrency() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationController::new();
    let mut log = WaveLog::default();

    let (flight, top) = (in_flight.clone(), peak.clone());
    let summary = run_stage(
        (0..40).collect::<Vec<usize>>(),
        move |n| {
            let flight = flight.clone();
            let top = top.clone();
            async move {
                let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
                top.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5 + (n % 7) as u64)).await;
                flight.fetch_sub(1, Ordering::SeqCst);
                let result = if n % 13 == 0 {
                    Err(OperationError::permanent("坏图"))
                } else {
                    Ok(n * 2)
                };
                RetryOutcome {
                    result,
                    attempts: 1,
                }
            }
        },
        &options(15),
        &cancel,
        &mut log,
    )
    .await
    .unwrap();

    assert_eq!(summary.total_waves, 3);
    assert_eq!(log.waves, vec![0..15, 15..30, 30..40]);
    assert_eq!(log.completed_waves, 3);
    assert_eq!(log.settled, 40);
    assert!(peak.load(Ordering::SeqCst) <= 15);
    // 0、13、26、39 失败，不影响同波次的其他条目
    assert_eq!(summary.failed, 4);
    assert_eq!(summary.completed, 36);
    assert!(matches!(summary.outcomes[5], ItemOutcome::Completed(10)));
    assert!(summary.outcomes[13].is_failed());
}

#[tokio::test]
async fn test_cancel_between_waves_stops_dispatch() {
    let cancel = CancellationController::new();
    let trigger = cancel.clone();
    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();

    let summary = run_stage(
        (0..12).collect::<Vec<usize>>(),
        move |n| {
            let counter = counter.clone();
            let trigger = trigger.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if n == 3 {
                    trigger.cancel();
                }
                RetryOutcome {
                    result: Ok::<_, OperationError>(n),
                    attempts: 1,
                }
            }
        },
        &options(4),
        &cancel,
        &mut (),
    )
    .await
    .unwrap();

    assert!(summary.was_cancelled);
    assert_eq!(summary.waves_run, 1);
    assert_eq!(started.load(Ordering::SeqCst), 4);
    assert_eq!(summary.not_scheduled, 8);
    assert_eq!(summary.cancelled + summary.completed, 4);
    assert!(summary.cancelled >= 1);
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let cancel = CancellationController::new();
    let result = run_stage(
        vec![1usize],
        |n| async move {
            RetryOutcome {
                result: Ok::<_, OperationError>(n),
                attempts: 1,
            }
        },
        &options(0),
        &cancel,
        &mut (),
    )
    .await;
    assert!(result.is_err());
}
