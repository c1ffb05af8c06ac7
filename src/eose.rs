use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::watch;

/// per-subscription end-of-stored-events timing knobs.
///
/// `eose_timeout` bounds the wait for remaining relays once
/// `min_relays_before_timeout` of them have reported; `max_wait` bounds the
/// whole subscription regardless of what relays do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub eose_timeout: Duration,
    pub max_wait: Duration,
    pub min_relays_before_timeout: usize,
}

impl TimeoutConfig {
    const fn preset(eose_ms: u64, max_ms: u64) -> Self {
        Self {
            eose_timeout: Duration::from_millis(eose_ms),
            max_wait: Duration::from_millis(max_ms),
            min_relays_before_timeout: 1,
        }
    }

    pub const fn discovery() -> Self {
        Self::preset(500, 3000)
    }

    pub const fn chat_join() -> Self {
        Self::preset(300, 2000)
    }

    pub const fn profile() -> Self {
        Self::preset(400, 2500)
    }

    pub const fn zap_receipts() -> Self {
        Self::preset(600, 4000)
    }

    pub const fn follow_list() -> Self {
        Self::preset(800, 5000)
    }

    pub const fn exhaustive() -> Self {
        Self::preset(1500, 8000)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::discovery()
    }
}

/// where a tracked subscription currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// nothing worth rendering yet
    Waiting,
    /// enough relays reported stored events that the first batch can be
    /// shown; stragglers may still add to it
    InitialBatchReady,
    /// every relay reported, or the safety net gave up waiting
    Complete,
}

/// tracks EOSE signals for one subscription spread over `total_relays`
/// relays, so that one slow relay cannot hold the first render hostage.
///
/// the fast timer arms when `min_relays_before_timeout` relays have
/// reported; the safety timer arms at construction. either phase transition
/// fires at most once no matter how relay callbacks and timers interleave.
#[derive(Debug, Clone)]
pub struct EoseTracker {
    total_relays: usize,
    config: TimeoutConfig,
    reported: Arc<DashSet<String>>,
    fast_timer_armed: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    complete: Arc<AtomicBool>,
    phase: Arc<watch::Sender<Phase>>,
}

impl EoseTracker {
    pub fn new(total_relays: usize, config: TimeoutConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Waiting);

        let tracker = Self {
            total_relays,
            config,
            reported: Arc::new(DashSet::new()),
            fast_timer_armed: Arc::new(AtomicBool::new(false)),
            ready: Arc::new(AtomicBool::new(false)),
            complete: Arc::new(AtomicBool::new(false)),
            phase: Arc::new(phase),
        };

        // safety net: bounded wait even if no relay ever sends EOSE
        let safety = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(safety.config.max_wait).await;
            safety.fire_ready();
            safety.fire_complete();
        });

        tracker
    }

    /// record one relay's end-of-stored-events signal; counting is by relay
    /// identity, duplicates are no-ops
    pub fn on_eose(&self, relay: &str) {
        if self.complete.load(Ordering::SeqCst) {
            return;
        }

        if !self.reported.insert(relay.to_string()) {
            return;
        }

        let count = self.reported.len();

        if count >= self.total_relays {
            self.fire_ready();
            self.fire_complete();
            return;
        }

        if count >= self.config.min_relays_before_timeout
            && !self.fast_timer_armed.swap(true, Ordering::SeqCst)
        {
            let fast = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(fast.config.eose_timeout).await;
                fast.fire_ready();
            });
        }
    }

    /// stop tracking: both timers become no-ops and the phase jumps to
    /// Complete so nothing waiting on this subscription hangs
    pub fn cancel(&self) {
        self.ready.store(true, Ordering::SeqCst);
        if !self.complete.swap(true, Ordering::SeqCst) {
            self.phase.send_replace(Phase::Complete);
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.subscribe().borrow()
    }

    pub fn relays_reported(&self) -> usize {
        self.reported.len()
    }

    /// resolves once the initial batch is ready (or already was)
    pub async fn wait_ready(&self) {
        let mut rx = self.phase.subscribe();
        while *rx.borrow_and_update() < Phase::InitialBatchReady {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// resolves once the subscription is complete (or already was)
    pub async fn wait_complete(&self) {
        let mut rx = self.phase.subscribe();
        while *rx.borrow_and_update() < Phase::Complete {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn fire_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) && !self.complete.load(Ordering::SeqCst) {
            self.phase.send_replace(Phase::InitialBatchReady);
        }
    }

    fn fire_complete(&self) {
        if !self.complete.swap(true, Ordering::SeqCst) {
            self.phase.send_replace(Phase::Complete);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Instant};

    // two relays, fast timer 500ms, safety net 3000ms: relay A reports and
    // relay B never does, so ready fires at 500ms and complete at 3000ms
    #[tokio::test(start_paused = true)]
    async fn test_slow_relay_cannot_block_first_render() {
        let tracker = EoseTracker::new(2, TimeoutConfig::discovery());

        tracker.on_eose("wss://a.example");
        assert_eq!(tracker.phase(), Phase::Waiting);

        let start = Instant::now();
        tracker.wait_ready().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        assert_eq!(tracker.phase(), Phase::InitialBatchReady);

        tracker.wait_complete().await;
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
        assert_eq!(tracker.phase(), Phase::Complete);
    }

    // both relays report early: both transitions happen immediately and the
    // pending timers become no-ops
    #[tokio::test(start_paused = true)]
    async fn test_all_relays_short_circuit() {
        let tracker = EoseTracker::new(2, TimeoutConfig::discovery());

        advance(Duration::from_millis(100)).await;
        tracker.on_eose("wss://a.example");
        advance(Duration::from_millis(100)).await;
        tracker.on_eose("wss://b.example");

        assert_eq!(tracker.phase(), Phase::Complete);

        // resolve instantly, no timer involved
        let start = Instant::now();
        tracker.wait_ready().await;
        tracker.wait_complete().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        // letting the stale timers fire must not regress the phase
        advance(Duration::from_millis(4000)).await;
        assert_eq!(tracker.phase(), Phase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_net_fires_without_any_eose() {
        let tracker = EoseTracker::new(3, TimeoutConfig::chat_join());

        let start = Instant::now();
        tracker.wait_complete().await;
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_eose_from_same_relay_counts_once() {
        let tracker = EoseTracker::new(2, TimeoutConfig::discovery());

        tracker.on_eose("wss://a.example");
        tracker.on_eose("wss://a.example");
        tracker.on_eose("wss://a.example");

        assert_eq!(tracker.relays_reported(), 1);
        assert_eq!(tracker.phase(), Phase::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_relays_gate_arms_the_fast_timer() {
        let config = TimeoutConfig {
            min_relays_before_timeout: 2,
            ..TimeoutConfig::discovery()
        };
        let tracker = EoseTracker::new(3, config);

        tracker.on_eose("wss://a.example");
        advance(Duration::from_millis(600)).await;
        // one report is below the gate, the fast timer must not have armed
        assert_eq!(tracker.phase(), Phase::Waiting);

        tracker.on_eose("wss://b.example");
        advance(Duration::from_millis(499)).await;
        assert_eq!(tracker.phase(), Phase::Waiting);
        advance(Duration::from_millis(1)).await;
        assert_eq!(tracker.phase(), Phase::InitialBatchReady);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_completes_and_stops_timers() {
        let tracker = EoseTracker::new(2, TimeoutConfig::discovery());

        tracker.cancel();
        assert_eq!(tracker.phase(), Phase::Complete);

        // late signals and timer firings are no-ops
        tracker.on_eose("wss://a.example");
        advance(Duration::from_millis(5000)).await;
        assert_eq!(tracker.relays_reported(), 0);
        assert_eq!(tracker.phase(), Phase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reports_fire_each_transition_once() {
        let tracker = EoseTracker::new(8, TimeoutConfig::exhaustive());
        let mut rx = tracker.phase.subscribe();

        let mut handles = Vec::new();
        for i in 0..8 {
            let t = tracker.clone();
            handles.push(tokio::spawn(async move {
                t.on_eose(&format!("wss://relay{}.example", i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(tracker.phase(), Phase::Complete);

        // the phase channel saw exactly one terminal value, not a ready →
        // complete → ready stutter
        assert!(rx.changed().await.is_ok());
        assert_eq!(*rx.borrow_and_update(), Phase::Complete);
    }
}
