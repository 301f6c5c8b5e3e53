use std::time::{Duration, Instant};

use fragstream_common::ModelId;
use fragstream_decode::{ChannelError, DecodeChannel, GeometryHandle, Pending};
use serde::{Deserialize, Serialize};

use crate::registry::ModelRegistry;

/// Update scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period after the latest camera-rest trigger before a round starts.
    pub coalesce_window_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }
}

/// Counters for instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub triggers: u64,
    /// Triggers that arrived while a round was in flight or already queued.
    pub coalesced: u64,
    pub rounds_started: u64,
    pub rounds_completed: u64,
    pub results_applied: u64,
    pub results_discarded: u64,
}

struct RoundRequest {
    model: ModelId,
    epoch: u64,
    pending: Pending<GeometryHandle>,
}

struct Round {
    generation: u64,
    started: Instant,
    requests: Vec<RoundRequest>,
}

/// Turns camera triggers into refresh rounds, at most one in flight.
pub struct UpdateScheduler {
    config: SchedulerConfig,
    generation: u64,
    /// Another round is wanted once the current one (if any) completes.
    pending: bool,
    /// Earliest instant the queued round may start.
    due: Option<Instant>,
    /// The queued round includes a forced trigger.
    forced: bool,
    round: Option<Round>,
    stats: SchedulerStats,
}

impl UpdateScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            generation: 0,
            pending: false,
            due: None,
            forced: false,
            round: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn in_flight(&self) -> bool {
        self.round.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.round.is_none() && !self.pending
    }

    /// Record a trigger. Forced triggers skip the coalescing window; neither
    /// kind starts a second round while one is in flight.
    pub fn trigger(&mut self, force: bool, now: Instant) {
        self.generation += 1;
        self.stats.triggers += 1;
        if self.pending || self.round.is_some() {
            self.stats.coalesced += 1;
        }
        self.pending = true;

        let due = if force {
            now
        } else {
            now + self.config.coalesce_window()
        };
        // A rest trigger pushes the start back to the end of its window,
        // unless a forced trigger is already queued.
        self.due = Some(match self.due {
            Some(previous) if force || self.forced => previous.min(due),
            _ => due,
        });
        self.forced |= force;
        tracing::trace!(generation = self.generation, force, "update triggered");
    }

    /// Apply finished refreshes and start the next round when one is due.
    pub fn poll(&mut self, registry: &mut ModelRegistry, channel: &DecodeChannel, now: Instant) {
        self.collect(registry, None);
        self.maybe_start(registry, channel, now);
    }

    /// Block until nothing is queued or in flight, or `timeout` passes.
    /// Returns whether the scheduler became idle.
    pub fn wait_idle(
        &mut self,
        registry: &mut ModelRegistry,
        channel: &DecodeChannel,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.poll(registry, channel, now);
            if self.is_idle() {
                return true;
            }
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(Duration::from_millis(10));
            if self.round.is_some() {
                self.collect(registry, Some(slice));
            } else if let Some(due) = self.due {
                std::thread::sleep(due.saturating_duration_since(now).min(slice));
            }
        }
    }

    /// Drop the in-flight round and anything queued, e.g. on shutdown.
    pub fn cancel(&mut self) {
        if let Some(round) = self.round.take() {
            self.stats.results_discarded += round.requests.len() as u64;
        }
        self.pending = false;
        self.due = None;
        self.forced = false;
    }

    fn maybe_start(&mut self, registry: &ModelRegistry, channel: &DecodeChannel, now: Instant) {
        if self.round.is_some() || !self.pending {
            return;
        }
        if self.due.is_some_and(|due| now < due) {
            return;
        }
        self.pending = false;
        self.due = None;
        self.forced = false;

        let generation = self.generation;
        let _span = tracing::info_span!("refresh_round", generation).entered();
        let mut requests = Vec::new();
        for model in registry.list().into_iter().filter(|m| m.is_ready()) {
            // Read the camera now, not when the trigger fired.
            let Some(camera) = model.camera_state() else {
                continue;
            };
            match channel.refresh(model.id(), camera) {
                Ok(pending) => requests.push(RoundRequest {
                    model: model.id().clone(),
                    epoch: model.epoch(),
                    pending,
                }),
                Err(e) => {
                    tracing::warn!(model = %model.id(), error = %e, "refresh not issued");
                }
            }
        }

        self.stats.rounds_started += 1;
        tracing::debug!(generation, models = requests.len(), "refresh round started");
        let round = Round {
            generation,
            started: now,
            requests,
        };
        if round.requests.is_empty() {
            self.finish(round);
        } else {
            self.round = Some(round);
        }
    }

    /// Apply whatever results have arrived. With `block`, waits up to that
    /// long for the first outstanding request.
    fn collect(&mut self, registry: &mut ModelRegistry, block: Option<Duration>) {
        let Some(mut round) = self.round.take() else {
            return;
        };

        let mut waited = block.is_none();
        let mut remaining = Vec::with_capacity(round.requests.len());
        for mut request in round.requests.drain(..) {
            let result = if waited {
                request.pending.try_take()
            } else {
                waited = true;
                block.and_then(|d| request.pending.wait_timeout(d))
            };
            match result {
                Some(result) => self.apply(registry, &request, result),
                None => remaining.push(request),
            }
        }
        round.requests = remaining;

        if round.requests.is_empty() {
            self.finish(round);
        } else {
            self.round = Some(round);
        }
    }

    fn apply(
        &mut self,
        registry: &mut ModelRegistry,
        request: &RoundRequest,
        result: Result<GeometryHandle, ChannelError>,
    ) {
        match result {
            Ok(handle) => {
                if registry.update_geometry(&request.model, request.epoch, handle) {
                    self.stats.results_applied += 1;
                } else {
                    self.stats.results_discarded += 1;
                    tracing::debug!(model = %request.model, "stale refresh discarded");
                }
            }
            Err(e) => {
                self.stats.results_discarded += 1;
                tracing::warn!(model = %request.model, error = %e, "refresh failed");
            }
        }
    }

    fn finish(&mut self, round: Round) {
        self.stats.rounds_completed += 1;
        tracing::debug!(
            generation = round.generation,
            elapsed = ?round.started.elapsed(),
            "refresh round complete"
        );
        // A queued trigger restarts from the current camera in the next poll.
    }
}
