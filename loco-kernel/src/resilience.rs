//! Primitives de résilience indépendantes du polling : circuit breaker,
//! limiteur à fenêtre glissante et backoff exponentiel.
//!
//! Les horloges sont passées explicitement (`now`) pour que les transitions
//! soient testables sans attendre.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// État du circuit breaker d'une instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Fonctionnement normal, la récupération automatique est permise
    Closed,
    /// Trop d'échecs consécutifs : récupération automatique suspendue
    Open,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    /// Enregistre un échec. Retourne true si le circuit vient de s'ouvrir.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::Closed && self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
            return true;
        }
        false
    }

    /// Enregistre un succès. Retourne true si le circuit était ouvert.
    pub fn record_success(&mut self) -> bool {
        let was_open = self.is_open();
        self.reset();
        was_open
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }
}

/// N tentatives maximum sur une fenêtre glissante
#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    max: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self { max, window, hits: VecDeque::new() }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Consomme une place si disponible
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.hits.len() >= self.max {
            return false;
        }
        self.hits.push_back(now);
        true
    }

    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.hits.len()
    }

    pub fn remaining(&mut self, now: Instant) -> usize {
        self.max.saturating_sub(self.count(now))
    }

    /// Délai avant qu'une place se libère (None si une place est libre)
    pub fn retry_after(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        if self.hits.len() < self.max {
            return None;
        }
        self.hits
            .front()
            .map(|&oldest| self.window.saturating_sub(now.saturating_duration_since(oldest)))
    }
}

/// Backoff exponentiel borné entre deux tentatives
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, multiplier: 2 }
    }

    /// Délai après la tentative `attempt` (1 = première tentative échouée)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}
