//! Liveness Monitor
//!
//! Host-side ping/strike cycle. Every `ping_interval` outside a probe, all
//! peers are marked inactive and pinged; a reply during the following
//! `probe_window` marks them active again and clears their strikes. Peers
//! still inactive when the window closes take a strike, and reaching
//! `max_strikes` disconnects them.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::NetConfig;
use crate::network::registry::SessionRegistry;
use crate::protocol::{Message, NetId};

/// What the monitor wants done this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStep {
    /// Mark everyone inactive and send pings.
    StartProbe,
    /// Judge the replies of the current probe.
    CloseWindow,
}

/// Probe timer state.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    ping_interval: Duration,
    probe_window: Duration,
    max_strikes: u32,
    elapsed: Duration,
    probing: bool,
}

impl LivenessMonitor {
    /// Monitor with explicit timings.
    pub fn new(ping_interval: Duration, probe_window: Duration, max_strikes: u32) -> Self {
        Self { ping_interval, probe_window, max_strikes, elapsed: Duration::ZERO, probing: false }
    }

    /// Monitor using the configured timings.
    pub fn from_config(config: &NetConfig) -> Self {
        Self::new(config.ping_interval, config.probe_window, config.max_strikes)
    }

    /// True while a probe window is open.
    pub fn is_probing(&self) -> bool {
        self.probing
    }

    /// Stop any probe and restart the interval.
    pub fn reset(&mut self) {
        self.elapsed = Duration::ZERO;
        self.probing = false;
    }

    /// Advance the timers by `dt`.
    pub fn advance(&mut self, dt: Duration) -> Option<LivenessStep> {
        self.elapsed += dt;
        if !self.probing && self.elapsed >= self.ping_interval {
            self.elapsed = Duration::ZERO;
            self.probing = true;
            return Some(LivenessStep::StartProbe);
        }
        if self.probing && self.elapsed >= self.probe_window {
            self.elapsed = Duration::ZERO;
            self.probing = false;
            return Some(LivenessStep::CloseWindow);
        }
        None
    }

    /// Advance and apply the result to `registry`.
    ///
    /// Returns the peers that reached the strike limit; the caller
    /// disconnects them.
    pub fn run(&mut self, dt: Duration, registry: &mut SessionRegistry) -> Vec<NetId> {
        if registry.is_empty() {
            self.reset();
            return Vec::new();
        }
        match self.advance(dt) {
            Some(LivenessStep::StartProbe) => {
                start_probe(registry);
                Vec::new()
            }
            Some(LivenessStep::CloseWindow) => strike_inactive(registry, self.max_strikes),
            None => Vec::new(),
        }
    }
}

fn start_probe(registry: &mut SessionRegistry) {
    debug!(peers = registry.len(), "liveness probe");
    for session in registry.sessions_mut() {
        session.set_active(false);
        let ping = Message::Ping { net_id: session.net_id() };
        if let Err(err) = session.enqueue(&ping) {
            debug!(net_id = %session.net_id(), error = %err, "ping not queued");
        }
    }
}

fn strike_inactive(registry: &mut SessionRegistry, max_strikes: u32) -> Vec<NetId> {
    let mut unresponsive = Vec::new();
    for session in registry.sessions_mut() {
        if session.is_active() {
            continue;
        }
        let strikes = session.add_strike();
        info!(net_id = %session.net_id(), strikes, max_strikes, "missed liveness probe");
        if strikes >= max_strikes {
            unresponsive.push(session.net_id());
        }
    }
    unresponsive
}

/// Record a `Ping` reply.
pub fn mark_alive(registry: &mut SessionRegistry, net_id: NetId) {
    if let Some(session) = registry.get_mut(net_id) {
        session.set_active(true);
        session.reset_strikes();
    }
}
