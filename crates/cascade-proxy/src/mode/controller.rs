//! The mode controller.
//!
//! Owns the current [`Mode`] and the running server handle. Switches are
//! applied one at a time: shut the old server down, rebuild routing
//! overrides when entering cascade, start a server wired for the new mode.

use super::lifecycle::{ServerLifecycle, ServerWiring};
use super::probe::Probe;
use super::scheduler::{latest_outcome, spawn_probe_loop};
use super::{next_mode, Mode};
use crate::auth::{AuthError, CredentialInjector};
use crate::config::{Config, RoutingRule};
use crate::metrics;
use crate::routing::{DialSelector, ProxySelector, RoutingTable};
use hyper::Uri;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cascade-related settings resolved once at startup.
#[derive(Clone, Debug)]
pub struct CascadeSettings {
    /// `None` when no usable upstream is configured
    pub upstream: Option<Uri>,
    pub credentials: Option<CredentialInjector>,
    pub overrides: Vec<RoutingRule>,
    pub connect_timeout: Duration,
}

impl CascadeSettings {
    /// An unparsable upstream URL is logged and treated as absent.
    pub fn from_config(config: &Config) -> Result<Self, AuthError> {
        let upstream = match config.upstream.uri() {
            Ok(uri) => uri,
            Err(e) => {
                error!("Cascade disabled: {}", e);
                None
            }
        };
        Ok(Self {
            upstream,
            credentials: CredentialInjector::from_config(&config.upstream)?,
            overrides: config.routing_rules(),
            connect_timeout: config.connection.connect_timeout(),
        })
    }
}

pub struct ModeController<L: ServerLifecycle> {
    settings: CascadeSettings,
    table: Arc<RoutingTable>,
    lifecycle: L,
    current: Option<(Mode, L::Handle)>,
}

impl<L: ServerLifecycle> ModeController<L> {
    pub fn new(settings: CascadeSettings, table: Arc<RoutingTable>, lifecycle: L) -> Self {
        Self {
            settings,
            table,
            lifecycle,
            current: None,
        }
    }

    /// Mode of the running server, `None` before the first successful start.
    pub fn mode(&self) -> Option<Mode> {
        self.current.as_ref().map(|(mode, _)| *mode)
    }

    pub fn handle(&self) -> Option<&L::Handle> {
        self.current.as_ref().map(|(_, handle)| handle)
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Act on one probe result. Returns the mode switched to, if any.
    pub async fn apply_probe(&mut self, success: bool) -> Option<Mode> {
        let cascade_available = self.settings.upstream.is_some();
        if !success && !cascade_available {
            warn!("Direct connectivity check failed but no upstream proxy is configured; staying direct");
        }

        let target = next_mode(self.mode(), success, cascade_available)?;
        info!("Switching to {} mode", target);
        self.switch_to(target).await;
        self.mode()
    }

    async fn switch_to(&mut self, target: Mode) {
        if let Some((mode, handle)) = self.current.take() {
            debug!("Stopping {} server", mode);
            self.lifecycle.shutdown(handle).await;
            metrics::set_active_mode(None);
        }

        let wiring = self.wiring(target);
        match self.lifecycle.start(wiring).await {
            Ok(handle) => {
                self.current = Some((target, handle));
                metrics::record_mode_switch(target);
            }
            Err(e) => {
                // Left without a server; the next probe retries.
                error!("Failed to start {} server: {}", target, e);
            }
        }
    }

    fn wiring(&self, mode: Mode) -> ServerWiring {
        let connect_timeout = self.settings.connect_timeout;
        match (mode, self.settings.upstream.as_ref()) {
            (Mode::Cascade, Some(upstream)) => {
                let applied = self.table.replace_rules(&self.settings.overrides);
                if applied > 0 {
                    info!("Applied {} host overrides", applied);
                }
                ServerWiring {
                    mode,
                    dialer: DialSelector::cascade(
                        Arc::clone(&self.table),
                        upstream.clone(),
                        self.settings.credentials.clone(),
                        connect_timeout,
                    ),
                    selector: ProxySelector::cascade(Arc::clone(&self.table), upstream.clone()),
                    credentials: self.settings.credentials.clone(),
                    connect_timeout,
                }
            }
            _ => ServerWiring {
                mode: Mode::Direct,
                dialer: DialSelector::direct(connect_timeout),
                selector: ProxySelector::direct(),
                credentials: None,
                connect_timeout,
            },
        }
    }

    /// Probe on a schedule and follow the results until `shutdown` fires,
    /// then stop the running server.
    pub async fn run<P>(
        &mut self,
        probe: Arc<P>,
        interval: Duration,
        probe_timeout: Duration,
        shutdown: CancellationToken,
    ) where
        P: Probe + ?Sized + 'static,
    {
        let mut outcomes = spawn_probe_loop(probe, interval, probe_timeout, shutdown.child_token());
        let mut last_seq = 0u64;

        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = outcomes.recv() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };

            let outcome = latest_outcome(first, &mut outcomes);
            if outcome.seq <= last_seq {
                debug!("Dropping stale probe result #{}", outcome.seq);
                continue;
            }
            last_seq = outcome.seq;
            self.apply_probe(outcome.success).await;
        }

        self.shutdown().await;
    }

    pub async fn shutdown(&mut self) {
        if let Some((mode, handle)) = self.current.take() {
            info!("Shutting down {} server", mode);
            self.lifecycle.shutdown(handle).await;
            metrics::set_active_mode(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_proxy_uri;
    use crate::mode::{HttpProbe, ServerError};
    use crate::test_support::spawn_http_responder;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[derive(Clone, Default)]
    struct FakeLifecycle {
        starts: Arc<Mutex<Vec<Mode>>>,
        shutdowns: Arc<AtomicUsize>,
        fail_start: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ServerLifecycle for FakeLifecycle {
        type Handle = Mode;

        async fn start(&self, wiring: ServerWiring) -> Result<Mode, ServerError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ServerError::Bind {
                    addr: "127.0.0.1:8888".parse().unwrap(),
                    source: std::io::ErrorKind::AddrInUse.into(),
                });
            }
            self.starts.lock().push(wiring.mode);
            Ok(wiring.mode)
        }

        async fn shutdown(&self, _handle: Mode) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(with_upstream: bool) -> CascadeSettings {
        CascadeSettings {
            upstream: with_upstream.then(|| parse_proxy_uri("proxy.corp:3128").unwrap()),
            credentials: CredentialInjector::new("bob", "secret").unwrap(),
            overrides: vec![
                RoutingRule::direct("a.example.com"),
                RoutingRule::via("b.example.com", "10.0.0.1:8080"),
            ],
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn controller(with_upstream: bool) -> (ModeController<FakeLifecycle>, FakeLifecycle) {
        let lifecycle = FakeLifecycle::default();
        let controller = ModeController::new(
            settings(with_upstream),
            Arc::new(RoutingTable::new()),
            lifecycle.clone(),
        );
        (controller, lifecycle)
    }

    #[tokio::test]
    async fn test_no_server_until_first_probe() {
        let (mut controller, lifecycle) = controller(true);
        assert_eq!(controller.mode(), None);

        assert_eq!(controller.apply_probe(true).await, Some(Mode::Direct));
        assert_eq!(*lifecycle.starts.lock(), vec![Mode::Direct]);
        assert_eq!(lifecycle.shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_sequence_switches() {
        let (mut controller, lifecycle) = controller(true);
        controller.apply_probe(true).await;

        let mut transitions = Vec::new();
        for ok in [true, false, false, true] {
            transitions.push(controller.apply_probe(ok).await);
        }

        assert_eq!(
            transitions,
            vec![None, Some(Mode::Cascade), None, Some(Mode::Direct)]
        );
        assert_eq!(
            *lifecycle.starts.lock(),
            vec![Mode::Direct, Mode::Cascade, Mode::Direct]
        );
        assert_eq!(lifecycle.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_probe_swaps_server_once() {
        let (mut controller, lifecycle) = controller(true);
        controller.apply_probe(true).await;
        lifecycle.starts.lock().clear();

        controller.apply_probe(false).await;
        assert_eq!(controller.mode(), Some(Mode::Cascade));
        assert_eq!(*lifecycle.starts.lock(), vec![Mode::Cascade]);
        assert_eq!(lifecycle.shutdowns.load(Ordering::SeqCst), 1);

        // Same outcome again: nothing to do.
        controller.apply_probe(false).await;
        assert_eq!(lifecycle.starts.lock().len(), 1);
        assert_eq!(lifecycle.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_503_moves_to_cascade() {
        let check = spawn_http_responder("HTTP/1.1 503 Service Unavailable").await;
        let probe = HttpProbe::new(format!("http://{check}/"), Duration::from_secs(2)).unwrap();
        let (mut controller, lifecycle) = controller(true);
        controller.apply_probe(true).await;
        lifecycle.starts.lock().clear();

        controller.apply_probe(probe.check().await).await;

        assert_eq!(controller.mode(), Some(Mode::Cascade));
        assert_eq!(*lifecycle.starts.lock(), vec![Mode::Cascade]);
        assert_eq!(lifecycle.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entering_cascade_applies_overrides() {
        let (mut controller, _lifecycle) = controller(true);
        controller.apply_probe(false).await;

        let table = controller.routing_table().clone();
        assert!(table.match_host("x.a.example.com").unwrap().is_direct());
        assert_eq!(
            table.match_host("y.b.example.com").unwrap().upstream_proxy(),
            "http://10.0.0.1:8080"
        );
        assert!(table.match_host("other.com").is_none());

        // Re-entering cascade rebuilds rather than extends.
        controller.apply_probe(true).await;
        controller.apply_probe(false).await;
        assert_eq!(table.get("").unwrap().hosts().len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_without_upstream_stays_direct() {
        let (mut controller, lifecycle) = controller(false);
        controller.apply_probe(false).await;
        assert_eq!(controller.mode(), Some(Mode::Direct));

        assert_eq!(controller.apply_probe(false).await, None);
        assert_eq!(*lifecycle.starts.lock(), vec![Mode::Direct]);
        assert!(logs_contain("no upstream proxy is configured"));
    }

    #[tokio::test]
    async fn test_start_failure_is_retried_on_next_probe() {
        let (mut controller, lifecycle) = controller(true);
        lifecycle.fail_start.store(true, Ordering::SeqCst);
        assert_eq!(controller.apply_probe(true).await, None);
        assert_eq!(controller.mode(), None);

        lifecycle.fail_start.store(false, Ordering::SeqCst);
        assert_eq!(controller.apply_probe(true).await, Some(Mode::Direct));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalid_upstream_disables_cascade() {
        let config: Config = serde_yaml::from_str("upstream: { url: \"https://proxy.corp:3128\" }")
            .unwrap();
        let settings = CascadeSettings::from_config(&config).unwrap();
        assert!(settings.upstream.is_none());
        assert!(logs_contain("Cascade disabled"));
    }

    struct ScriptedProbe {
        results: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn check(&self) -> bool {
            let mut results = self.results.lock();
            if results.is_empty() {
                false
            } else {
                results.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn test_run_follows_probes_and_stops_server() {
        let (mut controller, lifecycle) = controller(true);
        let probe = Arc::new(ScriptedProbe {
            results: Mutex::new(vec![true]),
        });
        let shutdown = CancellationToken::new();

        let stopper = shutdown.clone();
        let starts = Arc::clone(&lifecycle.starts);
        tokio::spawn(async move {
            loop {
                let in_cascade = starts.lock().contains(&Mode::Cascade);
                if in_cascade {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            controller.run(probe, Duration::from_millis(20), Duration::from_secs(1), shutdown),
        )
        .await
        .unwrap();

        assert_eq!(
            *lifecycle.starts.lock(),
            vec![Mode::Direct, Mode::Cascade]
        );
        assert_eq!(controller.mode(), None);
        assert_eq!(lifecycle.shutdowns.load(Ordering::SeqCst), 2);
    }
}
