//! Periodic probing.
//!
//! Each tick spawns an independent probe task bounded by a timeout, so a hung
//! check never delays the next one. Outcomes carry a sequence number; the
//! controller uses it to discard results that finish out of order.

use super::probe::Probe;
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub seq: u64,
    pub success: bool,
}

/// Probe immediately, then every `interval`, until `cancel` fires.
pub fn spawn_probe_loop<P>(
    probe: Arc<P>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<ProbeOutcome>
where
    P: Probe + ?Sized + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut seq = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            seq += 1;

            let probe = Arc::clone(&probe);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let success = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = tokio::time::timeout(timeout, probe.check()) => match result {
                        Ok(success) => success,
                        Err(_) => {
                            warn!("Reachability check #{} timed out after {:?}", seq, timeout);
                            false
                        }
                    },
                };
                metrics::record_probe(success);
                if tx.send(ProbeOutcome { seq, success }).is_err() {
                    debug!("Probe #{} finished after the controller stopped", seq);
                }
            });
        }
    });

    rx
}

/// Drain everything already queued behind `first` and keep the newest.
pub fn latest_outcome(
    first: ProbeOutcome,
    rx: &mut mpsc::UnboundedReceiver<ProbeOutcome>,
) -> ProbeOutcome {
    let mut latest = first;
    while let Ok(next) = rx.try_recv() {
        if next.seq > latest.seq {
            latest = next;
        }
    }
    latest
}
