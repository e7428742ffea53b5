use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Tuning for fault isolation of tick systems.
///
/// A policy with a zero failure threshold or zero cooldowns disables
/// isolation entirely: every system runs every tick regardless of failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationPolicy {
    /// Consecutive failures before a system is isolated.
    pub failure_threshold: u32,
    /// Cooldown for the first isolation, in ticks.
    pub base_cooldown_ticks: u64,
    /// Upper bound on any cooldown, in ticks.
    pub max_cooldown_ticks: u64,
    /// Cap on the escalation level (cooldown doubles per level).
    pub max_isolation_level: u32,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown_ticks: 40,
            max_cooldown_ticks: 800,
            max_isolation_level: 10,
        }
    }
}

impl IsolationPolicy {
    pub fn enabled(&self) -> bool {
        self.failure_threshold > 0 && self.base_cooldown_ticks > 0 && self.max_cooldown_ticks > 0
    }

    /// Cooldown for a given isolation level: base doubled per level above
    /// one, capped at the maximum.
    fn cooldown_for_level(&self, level: u32) -> u64 {
        let doubled = self
            .base_cooldown_ticks
            .checked_shl(level.saturating_sub(1))
            .unwrap_or(self.max_cooldown_ticks);
        doubled.min(self.max_cooldown_ticks)
    }
}

/// Point-in-time view of one system's isolation state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IsolationSnapshot {
    pub isolated: bool,
    pub remaining_ticks: u64,
    pub consecutive_failures: u32,
    pub isolation_level: u32,
    pub isolation_count: u64,
    pub skipped_ticks: u64,
    pub isolate_until_tick: u64,
    pub last_failure_tick: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Entry {
    consecutive_failures: u32,
    isolation_level: u32,
    /// Tick before which the system is skipped. 0 means not isolated.
    isolate_until_tick: u64,
    isolation_count: u64,
    skipped_ticks: u64,
    last_failure_tick: Option<u64>,
    last_error: Option<String>,
}

/// Tracks consecutive failures per (owner, unit) system key and isolates
/// repeat offenders with an escalating cooldown.
///
/// Escalation: each time the failure threshold is reached the isolation
/// level rises by one (up to the cap) and the cooldown doubles from the
/// base, capped at the maximum. A successful run resets the failure streak
/// and steps the level back down by one, so a recovered system earns its
/// way back to short cooldowns.
pub struct FaultIsolationController {
    policy: IsolationPolicy,
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl FaultIsolationController {
    pub fn new(policy: IsolationPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &IsolationPolicy {
        &self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the system should run at the given tick. Skipped ticks while
    /// isolated are counted.
    pub fn should_run(&self, owner: &str, unit: &str, tick: u64) -> bool {
        if !self.policy.enabled() {
            return true;
        }
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&key(owner, unit)) else {
            return true;
        };
        if tick < entry.isolate_until_tick {
            entry.skipped_ticks += 1;
            return false;
        }
        true
    }

    /// Record a clean run: the failure streak resets and the isolation level
    /// steps down by one.
    pub fn record_success(&self, owner: &str, unit: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&key(owner, unit)) {
            entry.consecutive_failures = 0;
            entry.isolation_level = entry.isolation_level.saturating_sub(1);
        }
    }

    /// Record a failed run. When this failure pushes the system over the
    /// threshold, returns the tick at which the cooldown ends; otherwise 0.
    pub fn record_failure(&self, owner: &str, unit: &str, tick: u64, error: &str) -> u64 {
        let mut entries = self.lock();
        let entry = entries.entry(key(owner, unit)).or_default();
        entry.consecutive_failures += 1;
        entry.last_failure_tick = Some(tick);
        entry.last_error = Some(error.to_string());
        // Diagnostics above are kept even when the policy is disabled; only
        // the isolation transition is gated.
        if !self.policy.enabled() {
            return 0;
        }
        if entry.consecutive_failures < self.policy.failure_threshold {
            return 0;
        }
        entry.isolation_level = (entry.isolation_level + 1).min(self.policy.max_isolation_level);
        let cooldown = self.policy.cooldown_for_level(entry.isolation_level);
        entry.isolate_until_tick = tick + cooldown;
        entry.isolation_count += 1;
        entry.consecutive_failures = 0;
        tracing::warn!(
            owner,
            unit,
            level = entry.isolation_level,
            cooldown_ticks = cooldown,
            until_tick = entry.isolate_until_tick,
            error,
            "system isolated after repeated failures"
        );
        entry.isolate_until_tick
    }

    /// Read one system's isolation state as of the given tick.
    pub fn snapshot_for(&self, owner: &str, unit: &str, tick: u64) -> IsolationSnapshot {
        let entries = self.lock();
        let Some(entry) = entries.get(&key(owner, unit)) else {
            return IsolationSnapshot::default();
        };
        let isolated = tick < entry.isolate_until_tick;
        IsolationSnapshot {
            isolated,
            remaining_ticks: entry.isolate_until_tick.saturating_sub(tick),
            consecutive_failures: entry.consecutive_failures,
            isolation_level: entry.isolation_level,
            isolation_count: entry.isolation_count,
            skipped_ticks: entry.skipped_ticks,
            isolate_until_tick: entry.isolate_until_tick,
            last_failure_tick: entry.last_failure_tick,
            last_error: entry.last_error.clone(),
        }
    }

    /// Drop state for keys no longer registered. Returns how many entries
    /// were removed.
    pub fn prune_to(&self, active: &HashSet<(String, String)>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| active.contains(k));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

fn key(owner: &str, unit: &str) -> (String, String) {
    (owner.trim().to_lowercase(), unit.trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(threshold: u32, base: u64, max: u64) -> IsolationPolicy {
        IsolationPolicy {
            failure_threshold: threshold,
            base_cooldown_ticks: base,
            max_cooldown_ticks: max,
            max_isolation_level: 10,
        }
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let p = IsolationPolicy::default();
        assert_eq!(p.failure_threshold, 5);
        assert_eq!(p.base_cooldown_ticks, 40);
        assert_eq!(p.max_cooldown_ticks, 800);
        assert_eq!(p.max_isolation_level, 10);
        assert!(p.enabled());
    }

    #[test]
    fn isolates_after_threshold_and_recovers() {
        let ctl = FaultIsolationController::new(policy(2, 10, 100));
        assert!(ctl.should_run("core", "ai", 0));
        assert_eq!(ctl.record_failure("core", "ai", 0, "boom"), 0);
        assert_eq!(ctl.record_failure("core", "ai", 1, "boom"), 11);

        // Isolated for 10 ticks starting at tick 1.
        assert!(!ctl.should_run("core", "ai", 2));
        assert!(!ctl.should_run("core", "ai", 10));
        assert!(ctl.should_run("core", "ai", 11));

        let snap = ctl.snapshot_for("core", "ai", 5);
        assert!(snap.isolated);
        assert_eq!(snap.remaining_ticks, 6);
        assert_eq!(snap.isolation_count, 1);
        assert_eq!(snap.skipped_ticks, 2);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn success_decrements_level_by_one() {
        let ctl = FaultIsolationController::new(policy(1, 10, 1000));
        ctl.record_failure("core", "ai", 0, "e");
        ctl.record_failure("core", "ai", 20, "e");
        assert_eq!(ctl.snapshot_for("core", "ai", 20).isolation_level, 2);
        ctl.record_success("core", "ai");
        assert_eq!(ctl.snapshot_for("core", "ai", 20).isolation_level, 1);
        ctl.record_success("core", "ai");
        assert_eq!(ctl.snapshot_for("core", "ai", 20).isolation_level, 0);
    }

    #[test]
    fn cooldown_doubles_per_level_and_caps() {
        let p = policy(1, 10, 50);
        let ctl = FaultIsolationController::new(p.clone());
        ctl.record_failure("a", "b", 0, "e");
        assert_eq!(ctl.snapshot_for("a", "b", 0).isolate_until_tick, 10);
        ctl.record_failure("a", "b", 100, "e");
        assert_eq!(ctl.snapshot_for("a", "b", 100).isolate_until_tick, 120);
        ctl.record_failure("a", "b", 200, "e");
        // Level 3 would be 40; level 4+ caps at 50.
        assert_eq!(ctl.snapshot_for("a", "b", 200).isolate_until_tick, 240);
        ctl.record_failure("a", "b", 300, "e");
        assert_eq!(ctl.snapshot_for("a", "b", 300).isolate_until_tick, 350);
        ctl.record_failure("a", "b", 400, "e");
        assert_eq!(ctl.snapshot_for("a", "b", 400).isolate_until_tick, 450);
    }

    #[test]
    fn zero_threshold_disables_isolation_but_keeps_diagnostics() {
        let ctl = FaultIsolationController::new(policy(0, 10, 100));
        for tick in 0..20 {
            assert_eq!(ctl.record_failure("a", "b", tick, "e"), 0);
            assert!(ctl.should_run("a", "b", tick));
        }
        let snap = ctl.snapshot_for("a", "b", 20);
        assert!(!snap.isolated);
        assert_eq!(snap.isolation_level, 0);
        assert_eq!(snap.isolation_count, 0);
        assert_eq!(snap.isolate_until_tick, 0);
        assert_eq!(snap.skipped_ticks, 0);
        // Failure diagnostics survive even with isolation turned off.
        assert_eq!(snap.consecutive_failures, 20);
        assert_eq!(snap.last_failure_tick, Some(19));
        assert_eq!(snap.last_error.as_deref(), Some("e"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let ctl = FaultIsolationController::new(policy(1, 10, 100));
        ctl.record_failure("Core", "AI", 0, "e");
        assert!(!ctl.should_run("core", "ai", 1));
    }

    #[test]
    fn prune_drops_unregistered_keys() {
        let ctl = FaultIsolationController::new(policy(1, 10, 100));
        ctl.record_failure("a", "x", 0, "e");
        ctl.record_failure("b", "y", 0, "e");
        let mut active = HashSet::new();
        active.insert(("a".to_string(), "x".to_string()));
        assert_eq!(ctl.prune_to(&active), 1);
        assert!(!ctl.should_run("a", "x", 1));
        assert!(ctl.should_run("b", "y", 1));
    }

    #[test]
    fn clear_resets_everything() {
        let ctl = FaultIsolationController::new(policy(1, 10, 100));
        ctl.record_failure("a", "x", 0, "e");
        ctl.clear();
        assert!(ctl.should_run("a", "x", 1));
        assert_eq!(ctl.snapshot_for("a", "x", 1), IsolationSnapshot::default());
    }
}
