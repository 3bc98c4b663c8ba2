//! NAT reachability verdict.
//!
//! Dial-back probes are noisy: a single remote may be misconfigured or
//! firewalled itself. The tracker therefore only changes its verdict once
//! several fresh samples agree, and forgets samples past a staleness window.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    Unknown,
    Public,
    Private,
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reachability::Unknown => "unknown",
            Reachability::Public => "public",
            Reachability::Private => "private",
        })
    }
}

/// Result of one dial-back probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The remote dialed us back successfully.
    Reachable,
    /// The remote tried and failed to dial us back.
    Unreachable,
}

impl ProbeOutcome {
    fn verdict(self) -> Reachability {
        match self {
            ProbeOutcome::Reachable => Reachability::Public,
            ProbeOutcome::Unreachable => Reachability::Private,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReachabilityConfig {
    /// Consecutive agreeing samples needed to change the verdict.
    pub confirmations: usize,
    /// Samples older than this no longer count.
    pub staleness: Duration,
    /// Upper bound on retained samples.
    pub max_samples: usize,
    /// Interval between dial-back probes once a verdict is known.
    pub refresh_interval: Duration,
    /// Interval between probes while the verdict is unknown.
    pub retry_interval: Duration,
    /// Delay before the first probe after startup.
    pub boot_delay: Duration,
    /// Only ask for (and perform) dial-backs to globally routable addresses.
    pub only_global_ips: bool,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            confirmations: 2,
            staleness: Duration::from_secs(30 * 60),
            max_samples: 8,
            refresh_interval: Duration::from_secs(15 * 60),
            retry_interval: Duration::from_secs(90),
            boot_delay: Duration::from_secs(15),
            only_global_ips: true,
        }
    }
}

#[derive(Debug)]
pub struct ReachabilityTracker {
    confirmations: usize,
    staleness: Duration,
    max_samples: usize,
    samples: VecDeque<(Instant, ProbeOutcome)>,
    verdict: Reachability,
}

impl ReachabilityTracker {
    pub fn new(config: &ReachabilityConfig) -> Self {
        Self {
            // One sample is never enough to flip.
            confirmations: config.confirmations.max(2),
            staleness: config.staleness,
            max_samples: config.max_samples.max(config.confirmations.max(2)),
            samples: VecDeque::new(),
            verdict: Reachability::Unknown,
        }
    }

    /// Record a probe result and return the verdict if it changed.
    pub fn record(&mut self, outcome: ProbeOutcome, now: Instant) -> Option<Reachability> {
        let before = self.verdict(now);
        self.samples.push_back((now, outcome));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        self.evaluate(now);
        let after = self.verdict;
        (after != before).then_some(after)
    }

    /// Current verdict at `now`, taking staleness into account.
    pub fn verdict(&mut self, now: Instant) -> Reachability {
        self.evaluate(now);
        self.verdict
    }

    pub fn fresh_samples(&self, now: Instant) -> usize {
        self.samples
            .iter()
            .filter(|(at, _)| self.is_fresh(*at, now))
            .count()
    }

    fn is_fresh(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) < self.staleness
    }

    fn evaluate(&mut self, now: Instant) {
        let staleness = self.staleness;
        self.samples
            .retain(|(at, _)| now.saturating_duration_since(*at) < staleness);

        if self.samples.is_empty() {
            self.verdict = Reachability::Unknown;
            return;
        }
        if self.samples.len() < self.confirmations {
            return;
        }

        let mut recent = self.samples.iter().rev().take(self.confirmations);
        let Some((_, first)) = recent.next() else {
            return;
        };
        if recent.all(|(_, outcome)| outcome == first) {
            self.verdict = first.verdict();
        }
    }
}
