use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

use crate::decoder::DecodeReport;
use crate::predict::{Pass, PassSource};
use crate::receiver::Receiver;
use crate::scheduler::capture::CaptureScheduler;
use crate::scheduler::state::{SchedulerSnapshot, StatusEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Cancel the active job and go idle.
    Stop,
    /// Re-run prediction now instead of waiting for the refresh period.
    Refresh,
}

/// What the outside world gets to see of a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub snapshot: Arc<RwLock<SchedulerSnapshot>>,
    pub events: broadcast::Sender<StatusEvent>,
    pub control: mpsc::Sender<Control>,
}

/// Owns the scheduler and drives it: fixed-period ticks, periodic
/// re-prediction off the async threads, decoder reports and manual control.
pub struct Runner<R> {
    scheduler: CaptureScheduler<R>,
    source: Arc<PassSource>,
    tick: Duration,
    refresh: Duration,
    reports: mpsc::UnboundedReceiver<DecodeReport>,
    control: mpsc::Receiver<Control>,
    events: broadcast::Sender<StatusEvent>,
    snapshot: Arc<RwLock<SchedulerSnapshot>>,
}

impl<R: Receiver> Runner<R> {
    pub fn new(
        scheduler: CaptureScheduler<R>,
        source: PassSource,
        tick: Duration,
        refresh: Duration,
        reports: mpsc::UnboundedReceiver<DecodeReport>,
    ) -> (Self, SchedulerHandle) {
        let (events, _) = broadcast::channel(64);
        let (control_tx, control) = mpsc::channel(8);
        let snapshot = Arc::new(RwLock::new(scheduler.snapshot(Utc::now())));
        let handle = SchedulerHandle {
            snapshot: snapshot.clone(),
            events: events.clone(),
            control: control_tx,
        };
        let runner = Self {
            scheduler,
            source: Arc::new(source),
            tick,
            refresh,
            reports,
            control,
            events,
            snapshot,
        };
        (runner, handle)
    }

    /// Run until `shutdown` resolves. Any active capture is cancelled on the
    /// way out so the receiver is released.
    pub async fn run<F: Future<Output = ()>>(mut self, shutdown: F) {
        let (predicted_tx, mut predicted) = mpsc::channel::<Vec<Pass>>(1);
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = interval(self.refresh);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        log::info!(
            "Scheduler running (tick {:?}, refresh {})",
            self.tick,
            humantime::format_duration(self.refresh)
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Some(event) = self.scheduler.tick(now) {
                        self.publish(event);
                    }
                    *self.snapshot.write().await = self.scheduler.snapshot(now);
                }
                _ = refresh.tick() => self.spawn_prediction(predicted_tx.clone()),
                Some(passes) = predicted.recv() => {
                    self.scheduler.set_passes(passes);
                    *self.snapshot.write().await = self.scheduler.snapshot(Utc::now());
                }
                Some(report) = self.reports.recv() => {
                    self.scheduler.on_decode_complete(report);
                }
                Some(control) = self.control.recv() => match control {
                    Control::Stop => {
                        log::info!("Manual stop requested");
                        let now = Utc::now();
                        if let Some(event) = self.scheduler.stop(now) {
                            self.publish(event);
                        }
                        *self.snapshot.write().await = self.scheduler.snapshot(now);
                    }
                    Control::Refresh => self.spawn_prediction(predicted_tx.clone()),
                },
                _ = &mut shutdown => {
                    log::info!("Shutting down scheduler");
                    if let Some(event) = self.scheduler.stop(Utc::now()) {
                        self.publish(event);
                    }
                    return;
                }
            }
        }
    }

    fn publish(&self, event: StatusEvent) {
        log::debug!("Status event: {:?}", event.status);
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn spawn_prediction(&self, tx: mpsc::Sender<Vec<Pass>>) {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || match source.predict(Utc::now()) {
            Ok(passes) => {
                log::info!("Predicted {} passes", passes.len());
                let _ = tx.blocking_send(passes);
            }
            Err(e) => log::error!("Pass prediction failed: {}", e),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodeError, DecodeRequest, Decoder};
    use crate::gain::{AutoGainController, GainConfig};
    use crate::predict::{PredictOptions, StationLocation};
    use crate::receiver::{CaptureStats, HardwareFault, Tuning};
    use crate::scheduler::capture::SchedulerSettings;
    use crate::scheduler::state::SchedulerStatus;
    use std::path::Path;

    struct IdleReceiver;

    impl Receiver for IdleReceiver {
        fn acquire(&mut self, _: &Tuning, _: f64, _: &Path) -> Result<(), HardwareFault> {
            Err(HardwareFault::NotAcquired)
        }
        fn set_gain(&mut self, _: f64) -> Result<(), HardwareFault> {
            Ok(())
        }
        fn poll(&mut self) -> Result<Vec<Vec<f32>>, HardwareFault> {
            Ok(Vec::new())
        }
        fn release(&mut self) -> Option<CaptureStats> {
            None
        }
    }

    struct NullDecoder;

    impl Decoder for NullDecoder {
        fn submit(&self, _: DecodeRequest) -> Result<(), DecodeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn publishes_snapshots_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SchedulerSettings {
            lead_time: chrono::Duration::seconds(120),
            guard: chrono::Duration::seconds(30),
            grace: chrono::Duration::seconds(60),
            los_tolerance: chrono::Duration::seconds(10),
            max_retries: 0,
            recordings_dir: dir.path().join("recordings"),
            history: 5,
        };
        let scheduler = CaptureScheduler::new(
            settings,
            Vec::new(),
            IdleReceiver,
            AutoGainController::new(GainConfig::default(), 20.0),
            Box::new(NullDecoder),
        );
        let source = PassSource {
            station: StationLocation::default(),
            options: PredictOptions::default(),
            tle_folder: dir.path().join("no-tle-here"),
            satellites: Vec::new(),
            high_quality_min_elevation: None,
        };
        let (_reports_tx, reports) = mpsc::unbounded_channel();
        let (runner, handle) = Runner::new(
            scheduler,
            source,
            Duration::from_millis(10),
            Duration::from_secs(3600),
            reports,
        );

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(runner.run(async {
            let _ = stop_rx.await;
        }));

        handle.control.send(Control::Refresh).await.unwrap();
        handle.control.send(Control::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let snapshot = handle.snapshot.read().await;
            assert_eq!(snapshot.status, SchedulerStatus::Idle);
            assert_eq!(snapshot.gain, 20.0);
            assert!(snapshot.upcoming.is_empty());
        }

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
