//! Resource monitor: host memory/CPU sampling with hysteretic pause/resume
//!
//! Samples at a fixed interval and classifies the host as `Ok` or `Paused`
//! through two independent hysteretic classifiers (memory and CPU). The
//! aggregate state is paused if either classifier is paused. Transitions
//! are published through a `watch` channel that only changes value on an
//! edge, so downstream consumers never see the same state twice in a row.
//!
//! If a sample cannot be taken the previous one is reused and marked stale;
//! three consecutive stale samples force a conservative pause.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::chunk::epoch_secs;
use crate::config::Settings;

/// Aggregate monitor state. `Paused` tells the scheduler to stop starting
/// workers and the degradation controller to accept-without-embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MonitorState {
    Ok,
    Paused,
}

/// One observation of the host, kept for `current()` and stats.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceSample {
    pub ts: u64,
    pub mem_used_pct: f32,
    pub cpu_pct: f32,
    pub state: MonitorState,
    pub stale: bool,
}

impl Default for ResourceSample {
    fn default() -> Self {
        Self {
            ts: 0,
            mem_used_pct: 0.0,
            cpu_pct: 0.0,
            state: MonitorState::Ok,
            stale: false,
        }
    }
}

/// One hysteresis band: pause at/above `stop`, resume at/below `resume`.
#[derive(Debug, Clone, Copy)]
pub struct Hysteresis {
    pub stop: f32,
    pub resume: f32,
}

/// Latched classifier over a hysteresis band.
#[derive(Debug)]
pub struct Classifier {
    band: Hysteresis,
    paused: bool,
}

impl Classifier {
    pub fn new(band: Hysteresis) -> Self {
        Self {
            band,
            paused: false,
        }
    }

    /// Feed one observation; returns whether this classifier is paused.
    pub fn observe(&mut self, value: f32) -> bool {
        if self.paused {
            if value <= self.band.resume {
                self.paused = false;
            }
        } else if value >= self.band.stop {
            self.paused = true;
        }
        self.paused
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

/// Source of raw host readings. Abstracted so the classifier loop is
/// drivable from tests without touching the real host.
pub trait Sampler: Send + 'static {
    /// `(mem_used_pct, cpu_pct)`, or `None` if the reading failed.
    fn sample(&mut self) -> Option<(f32, f32)>;
}

/// Real host readings via sysinfo.
pub struct SysinfoSampler {
    system: sysinfo::System,
    /// Rolling window of CPU readings; classification uses the mean so one
    /// spiky tick doesn't flap the state.
    cpu_window: std::collections::VecDeque<f32>,
}

const CPU_WINDOW: usize = 4;

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: sysinfo::System::new(),
            cpu_window: std::collections::VecDeque::with_capacity(CPU_WINDOW),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SysinfoSampler {
    fn sample(&mut self) -> Option<(f32, f32)> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        if total == 0 {
            return None;
        }
        let mem_used_pct = self.system.used_memory() as f32 / total as f32 * 100.0;

        if self.cpu_window.len() == CPU_WINDOW {
            self.cpu_window.pop_front();
        }
        self.cpu_window.push_back(self.system.global_cpu_usage());
        let cpu_pct =
            self.cpu_window.iter().sum::<f32>() / self.cpu_window.len() as f32;

        Some((mem_used_pct, cpu_pct))
    }
}

/// Handle to a running monitor: subscribe to transitions, poll the latest
/// sample. Cloneable; the sampling task stops when the last handle drops.
#[derive(Clone)]
pub struct MonitorHandle {
    state_rx: watch::Receiver<MonitorState>,
    latest: Arc<Mutex<ResourceSample>>,
}

impl MonitorHandle {
    /// Receiver that changes value exactly on each `Ok ↔ Paused` edge.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state_rx.clone()
    }

    /// Most recent sample.
    pub fn current(&self) -> ResourceSample {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn state(&self) -> MonitorState {
        *self.state_rx.borrow()
    }

    /// A handle that never changes state on its own; tests and the bench
    /// command drive it through the returned sender.
    pub fn fixed(state: MonitorState) -> (Self, watch::Sender<MonitorState>) {
        let (tx, rx) = watch::channel(state);
        let latest = Arc::new(Mutex::new(ResourceSample {
            state,
            ..Default::default()
        }));
        (
            Self {
                state_rx: rx,
                latest,
            },
            tx,
        )
    }
}

/// Periodic sampler + classifier, spawned on the runtime.
pub struct ResourceMonitor;

impl ResourceMonitor {
    /// Start sampling at `settings.sample_interval` with the real sampler.
    pub fn start(settings: &Settings) -> MonitorHandle {
        Self::start_with(settings, SysinfoSampler::new())
    }

    /// Start with a custom sampler (tests inject scripted readings).
    pub fn start_with(settings: &Settings, sampler: impl Sampler) -> MonitorHandle {
        let (state_tx, state_rx) = watch::channel(MonitorState::Ok);
        let latest = Arc::new(Mutex::new(ResourceSample::default()));

        let loop_ = MonitorLoop {
            sampler: Box::new(sampler),
            mem: Classifier::new(Hysteresis {
                stop: settings.mem_stop_pct,
                resume: settings.mem_resume_pct,
            }),
            cpu: Classifier::new(Hysteresis {
                stop: settings.cpu_stop_pct,
                resume: settings.cpu_resume_pct,
            }),
            stale_streak: 0,
            last_good: None,
        };
        let interval = settings.sample_interval;
        let latest_for_task = Arc::clone(&latest);

        tokio::spawn(run_monitor_loop(
            loop_,
            interval,
            state_tx,
            latest_for_task,
        ));

        MonitorHandle { state_rx, latest }
    }
}

struct MonitorLoop {
    sampler: Box<dyn Sampler>,
    mem: Classifier,
    cpu: Classifier,
    stale_streak: u32,
    last_good: Option<(f32, f32)>,
}

/// Stale samples tolerated before the monitor forces a pause.
const STALE_PAUSE_STREAK: u32 = 3;

impl MonitorLoop {
    /// One tick: read (or reuse) a sample and produce the classified result.
    fn tick(&mut self) -> ResourceSample {
        let (reading, stale) = match self.sampler.sample() {
            Some(reading) => {
                self.stale_streak = 0;
                self.last_good = Some(reading);
                (reading, false)
            }
            None => {
                self.stale_streak = self.stale_streak.saturating_add(1);
                (self.last_good.unwrap_or((0.0, 0.0)), true)
            }
        };

        let (mem_used_pct, cpu_pct) = reading;
        let mem_paused = self.mem.observe(mem_used_pct);
        let cpu_paused = self.cpu.observe(cpu_pct);
        let stale_forced = self.stale_streak >= STALE_PAUSE_STREAK;

        let state = if mem_paused || cpu_paused || stale_forced {
            MonitorState::Paused
        } else {
            MonitorState::Ok
        };

        ResourceSample {
            ts: epoch_secs(),
            mem_used_pct,
            cpu_pct,
            state,
            stale,
        }
    }
}

async fn run_monitor_loop(
    mut loop_: MonitorLoop,
    interval: Duration,
    state_tx: watch::Sender<MonitorState>,
    latest: Arc<Mutex<ResourceSample>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let sample = loop_.tick();

        let new_state = sample.state;
        {
            let mut slot = latest.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *slot = sample;
        }

        // Coalesced edge publication: same state twice never notifies.
        let changed = *state_tx.borrow() != new_state;
        if changed {
            match new_state {
                MonitorState::Paused => tracing::warn!("Resource monitor: pausing embedding work"),
                MonitorState::Ok => tracing::info!("Resource monitor: resuming embedding work"),
            }
            if state_tx.send(new_state).is_err() {
                // All handles dropped; stop sampling.
                return;
            }
        } else if state_tx.is_closed() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(stop: f32, resume: f32) -> Classifier {
        Classifier::new(Hysteresis { stop, resume })
    }

    #[test]
    fn test_classifier_pauses_at_stop() {
        let mut c = classifier(78.0, 69.0);
        assert!(!c.observe(50.0));
        assert!(!c.observe(77.9));
        assert!(c.observe(78.0));
        assert!(c.is_paused());
    }

    #[test]
    fn test_classifier_holds_pause_in_band() {
        let mut c = classifier(78.0, 69.0);
        c.observe(80.0);
        // Between resume and stop: still paused (hysteresis)
        assert!(c.observe(73.0));
        assert!(c.observe(70.0));
        // At/below resume: released
        assert!(!c.observe(69.0));
        // Climbing back into the band without hitting stop: stays ok
        assert!(!c.observe(75.0));
    }

    #[test]
    fn test_loop_aggregates_either_classifier() {
        let mut loop_ = MonitorLoop {
            sampler: Box::new(Scripted::new(vec![
                Some((50.0, 10.0)),
                Some((50.0, 90.0)), // cpu trips
                Some((50.0, 40.0)), // cpu releases
                Some((90.0, 10.0)), // mem trips
            ])),
            mem: classifier(78.0, 69.0),
            cpu: classifier(69.0, 49.0),
            stale_streak: 0,
            last_good: None,
        };
        assert_eq!(loop_.tick().state, MonitorState::Ok);
        assert_eq!(loop_.tick().state, MonitorState::Paused);
        assert_eq!(loop_.tick().state, MonitorState::Ok);
        assert_eq!(loop_.tick().state, MonitorState::Paused);
    }

    #[test]
    fn test_three_stale_samples_force_pause() {
        let mut loop_ = MonitorLoop {
            sampler: Box::new(Scripted::new(vec![Some((10.0, 10.0)), None, None, None])),
            mem: classifier(78.0, 69.0),
            cpu: classifier(69.0, 49.0),
            stale_streak: 0,
            last_good: None,
        };
        assert_eq!(loop_.tick().state, MonitorState::Ok);
        let s = loop_.tick();
        assert!(s.stale);
        assert_eq!(s.state, MonitorState::Ok);
        assert_eq!(loop_.tick().state, MonitorState::Ok);
        // Third consecutive stale sample: conservative pause
        assert_eq!(loop_.tick().state, MonitorState::Paused);
    }

    #[test]
    fn test_stale_reuses_last_good_reading() {
        let mut loop_ = MonitorLoop {
            sampler: Box::new(Scripted::new(vec![Some((42.0, 13.0)), None])),
            mem: classifier(78.0, 69.0),
            cpu: classifier(69.0, 49.0),
            stale_streak: 0,
            last_good: None,
        };
        loop_.tick();
        let s = loop_.tick();
        assert!(s.stale);
        assert_eq!(s.mem_used_pct, 42.0);
        assert_eq!(s.cpu_pct, 13.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_publishes_edges_only() {
        let settings = Settings {
            sample_interval: Duration::from_millis(10),
            ..Settings::default()
        };
        let handle = ResourceMonitor::start_with(
            &settings,
            Scripted::new(vec![
                Some((10.0, 10.0)),
                Some((95.0, 10.0)),
                Some((95.0, 10.0)), // same state: no notification
                Some((50.0, 10.0)),
            ]),
        );
        let mut rx = handle.subscribe();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), MonitorState::Paused);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), MonitorState::Ok);

        let sample = handle.current();
        assert_eq!(sample.mem_used_pct, 50.0);
    }

    /// Replays a fixed script of readings, then repeats the last one.
    struct Scripted {
        script: Vec<Option<(f32, f32)>>,
        at: usize,
    }

    impl Scripted {
        fn new(script: Vec<Option<(f32, f32)>>) -> Self {
            Self { script, at: 0 }
        }
    }

    impl Sampler for Scripted {
        fn sample(&mut self) -> Option<(f32, f32)> {
            let item = self
                .script
                .get(self.at)
                .copied()
                .unwrap_or_else(|| *self.script.last().expect("non-empty script"));
            if self.at < self.script.len() {
                self.at += 1;
            }
            item
        }
    }
}
