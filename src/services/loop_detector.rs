//! Endless-loop guard for agent invocation sequences.
//!
//! Tracks a rolling window of recent agent names and flags two cycle
//! shapes before they run forever: a single agent invoking itself
//! repeatedly, and two agents ping-ponging. Thresholds and window size
//! are configuration, not constants.

use std::collections::VecDeque;

use crate::domain::models::task::LoopDetectionConf;

/// A detected cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSignal {
    /// The repeating pattern (one or two agent names).
    pub pattern: Vec<String>,
    /// How many trailing invocations the cycle spans.
    pub span: usize,
}

impl LoopSignal {
    /// Human-readable description for error messages.
    pub fn describe(&self) -> String {
        format!(
            "endless loop detected: pattern [{}] over last {} invocations",
            self.pattern.join(" -> "),
            self.span
        )
    }
}

/// Rolling-window cycle detector over agent invocations.
#[derive(Debug)]
pub struct LoopDetector {
    conf: LoopDetectionConf,
    window: VecDeque<String>,
}

impl LoopDetector {
    /// Create a detector with the given knobs.
    pub fn new(conf: LoopDetectionConf) -> Self {
        Self {
            conf,
            window: VecDeque::new(),
        }
    }

    /// Record one agent invocation and check for cycles.
    pub fn record(&mut self, agent_name: &str) -> Option<LoopSignal> {
        if !self.conf.enabled {
            return None;
        }
        self.window.push_back(agent_name.to_string());
        while self.window.len() > self.conf.window {
            self.window.pop_front();
        }
        self.check_single_repeat().or_else(|| self.check_pair_cycle())
    }

    /// Trailing run of one agent invoking itself.
    fn check_single_repeat(&self) -> Option<LoopSignal> {
        let threshold = self.conf.single_repeat_threshold;
        if threshold == 0 || self.window.len() < threshold {
            return None;
        }
        let last = self.window.back()?.clone();
        let run = self
            .window
            .iter()
            .rev()
            .take_while(|name| **name == last)
            .count();
        if run >= threshold {
            return Some(LoopSignal {
                pattern: vec![last],
                span: run,
            });
        }
        None
    }

    /// Trailing A/B alternation. A threshold of `k` flags once the
    /// alternating tail spans `2k - 1` invocations, so a k-cycle is
    /// caught before its k-th full repetition completes.
    fn check_pair_cycle(&self) -> Option<LoopSignal> {
        let threshold = self.conf.pair_repeat_threshold;
        if threshold == 0 {
            return None;
        }
        let needed = 2 * threshold - 1;
        if self.window.len() < needed {
            return None;
        }

        let names: Vec<&str> = self.window.iter().rev().map(String::as_str).collect();
        let (a, b) = (names[0], names[1]);
        if a == b {
            return None;
        }
        let tail = names
            .iter()
            .copied()
            .enumerate()
            .take_while(|&(i, name)| if i % 2 == 0 { name == a } else { name == b })
            .count();
        if tail >= needed {
            return Some(LoopSignal {
                pattern: vec![a.to_string(), b.to_string()],
                span: tail,
            });
        }
        None
    }

    /// Forget everything recorded so far.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}
