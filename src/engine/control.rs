use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Commands that can be sent to control a running load test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Override the ramp profile with a fixed VU count
    Ramp(usize),
    /// Hold VUs idle between iterations
    Pause,
    /// Resume execution
    Resume,
    /// Log current status
    Status,
    /// Graceful stop: drain in-flight iterations, then finish
    Stop,
}

/// Shared state between the control loop, VUs and outside callers
/// (signal handlers, interactive input).
pub struct ControlState {
    /// When true, VUs idle instead of starting new iterations
    paused: AtomicBool,
    /// Manual concurrency that replaces the ramp profile once set
    target_override: Mutex<Option<usize>>,
    stopped: AtomicBool,
    /// Accumulated paused duration in milliseconds
    total_paused_ms: AtomicU64,
    /// Offset from `reference_instant` when the current pause started, 0 if not paused
    pause_started_ms: AtomicU64,
    reference_instant: Instant,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            target_override: Mutex::new(None),
            stopped: AtomicBool::new(false),
            total_paused_ms: AtomicU64::new(0),
            pause_started_ms: AtomicU64::new(0),
            reference_instant: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        // +1 keeps a pause started at offset 0 distinguishable from "not paused"
        self.reference_instant.elapsed().as_millis() as u64 + 1
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.pause_started_ms.store(self.now_ms(), Ordering::SeqCst);
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            let started = self.pause_started_ms.swap(0, Ordering::SeqCst);
            if started > 0 {
                let paused_for = self.now_ms().saturating_sub(started);
                self.total_paused_ms.fetch_add(paused_for, Ordering::SeqCst);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Total time spent paused, including the current pause if active
    pub fn total_paused(&self) -> Duration {
        let mut total = self.total_paused_ms.load(Ordering::SeqCst);
        if self.is_paused() {
            let started = self.pause_started_ms.load(Ordering::SeqCst);
            if started > 0 {
                total += self.now_ms().saturating_sub(started);
            }
        }
        Duration::from_millis(total)
    }

    pub fn set_target_override(&self, target: usize) {
        *self.target_override.lock() = Some(target);
    }

    pub fn target_override(&self) -> Option<usize> {
        *self.target_override.lock()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a control command from user input
pub fn parse_control_command(input: &str) -> Option<ControlCommand> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let (first, rest) = parts.split_first()?;

    match first.to_lowercase().as_str() {
        "ramp" | "scale" => rest.first()?.parse::<usize>().ok().map(ControlCommand::Ramp),
        "pause" => Some(ControlCommand::Pause),
        "resume" | "unpause" => Some(ControlCommand::Resume),
        "status" | "stats" => Some(ControlCommand::Status),
        "stop" | "quit" | "exit" => Some(ControlCommand::Stop),
        _ => None,
    }
}
