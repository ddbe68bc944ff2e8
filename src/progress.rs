//! Simulated progress. The backend only reports coarse per-service status, so
//! the displayed percentage is a timer-driven estimate and not authoritative.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::models::{GenerationMode, GenerationPayload};

/// Highest value reachable before the terminal event arrives.
pub const PROGRESS_CAP: f64 = 95.0;
pub const PROGRESS_DONE: f64 = 100.0;

/// Item counts above this stretch the estimate.
const LARGE_BATCH: u32 = 9;

/// Heuristic wall-clock estimate for one generation.
pub fn estimated_duration(mode: GenerationMode, payload: &GenerationPayload) -> Duration {
    let with_image = payload.has_reference_image();
    let base_secs: u64 = match (mode, with_image) {
        (GenerationMode::Icons, false) => 40,
        (GenerationMode::Icons, true) => 70,
        (GenerationMode::Illustrations, false) => 50,
        (GenerationMode::Illustrations, true) => 80,
        (GenerationMode::Labels, false) => 40,
        (GenerationMode::Labels, true) => 60,
        (GenerationMode::Mockups, false) => 60,
        (GenerationMode::Mockups, true) => 90,
        (GenerationMode::UiElements, _) => 70,
    };
    let items = payload
        .icon_count
        .unwrap_or(payload.individual_descriptions.len() as u32);
    let secs = if items > LARGE_BATCH {
        base_secs + base_secs / 2
    } else {
        base_secs
    };
    Duration::from_secs(secs)
}

/// Pure tick-driven estimator: each tick adds `95 / (duration / tick)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedProgress {
    increment: f64,
    value: f64,
}

impl SimulatedProgress {
    pub fn new(duration: Duration, tick: Duration) -> Self {
        let ticks = (duration.as_secs_f64() / tick.as_secs_f64()).max(1.0);
        Self {
            increment: PROGRESS_CAP / ticks,
            value: 0.0,
        }
    }

    pub fn tick(&mut self) -> f64 {
        self.value = (self.value + self.increment).min(PROGRESS_CAP);
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_capped(&self) -> bool {
        self.value >= PROGRESS_CAP
    }
}

/// Runs a [`SimulatedProgress`] on a tokio interval and publishes its value.
#[derive(Debug)]
pub struct ProgressTicker {
    tick: Duration,
    tx: watch::Sender<f64>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    pub fn new(tick: Duration) -> Self {
        let (tx, _) = watch::channel(0.0);
        Self {
            tick,
            tx,
            handle: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.tx.subscribe()
    }

    pub fn value(&self) -> f64 {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Restarts from zero with a new estimate.
    pub fn start(&mut self, duration: Duration) {
        self.reset();
        let tx = self.tx.clone();
        let tick = self.tick;
        self.handle = Some(tokio::spawn(async move {
            let mut estimator = SimulatedProgress::new(duration, tick);
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tx.send_replace(estimator.tick());
                if estimator.is_capped() {
                    break;
                }
            }
        }));
    }

    /// Terminal event: jump to 100.
    pub fn finish(&mut self) {
        self.stop();
        self.tx.send_replace(PROGRESS_DONE);
    }

    pub fn reset(&mut self) {
        self.stop();
        self.tx.send_replace(0.0);
    }

    /// Stops ticking and leaves the value where it is.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_payload() -> GenerationPayload {
        GenerationPayload {
            general_description: "cat logos".into(),
            ..Default::default()
        }
    }

    #[test]
    fn image_input_takes_longer_than_text() {
        let text = text_payload();
        let mut image = text_payload();
        image.reference_image = Some("iVBORw0KGgo=".into());
        assert_eq!(estimated_duration(GenerationMode::Icons, &text), Duration::from_secs(40));
        assert_eq!(estimated_duration(GenerationMode::Icons, &image), Duration::from_secs(70));
    }

    #[test]
    fn large_batches_stretch_the_estimate() {
        let mut payload = text_payload();
        payload.icon_count = Some(16);
        assert_eq!(estimated_duration(GenerationMode::Icons, &payload), Duration::from_secs(60));
    }

    #[test]
    fn estimator_reaches_cap_exactly_at_duration() {
        let mut progress = SimulatedProgress::new(Duration::from_secs(40), Duration::from_millis(100));
        for _ in 0..200 {
            progress.tick();
        }
        assert!((progress.value() - 47.5).abs() < 1e-6);
        for _ in 0..200 {
            progress.tick();
        }
        assert!((progress.value() - PROGRESS_CAP).abs() < 1e-6);
        for _ in 0..50 {
            progress.tick();
        }
        assert_eq!(progress.value(), PROGRESS_CAP);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_advances_and_caps_below_hundred() {
        let mut ticker = ProgressTicker::new(Duration::from_millis(100));
        let rx = ticker.subscribe();
        ticker.start(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(550)).await;
        let midway = *rx.borrow();
        assert!(midway > 40.0 && midway < 60.0, "midway was {midway}");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*rx.borrow(), PROGRESS_CAP);
        assert!(!ticker.is_running());

        ticker.finish();
        assert_eq!(ticker.value(), PROGRESS_DONE);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_stops_the_previous_run() {
        let mut ticker = ProgressTicker::new(Duration::from_millis(100));
        ticker.start(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert!(ticker.value() > 0.0);

        ticker.reset();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticker.value(), 0.0);
    }
}
