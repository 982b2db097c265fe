//! Monitoring Scheduler Implementation

use crate::error::MonitorError;
use obd_protocol::{ChannelError, ObdClient, ParameterSample, DEFAULT_TIMEOUT_MS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for the monitoring scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timeout applied to each parameter request (default: 2000ms)
    pub command_timeout_ms: u64,
    /// Samples buffered per subscriber before the slowest one lags
    pub subscriber_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            subscriber_capacity: 256,
        }
    }
}

/// Handle to a running monitoring session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    pids: Vec<String>,
    interval_ms: u64,
    active: Arc<AtomicBool>,
    samples: broadcast::Sender<ParameterSample>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Parameters polled each cycle, in order
    pub fn pids(&self) -> &[String] {
        &self.pids
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Whether the session still schedules cycles
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Receive this session's samples published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ParameterSample> {
        self.samples.subscribe()
    }
}

struct ActiveSession {
    id: u64,
    active: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    fn signal_stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.stop.send_replace(true);
    }
}

/// Singleton poll loop over one connection's command channel
pub struct MonitoringScheduler {
    client: ObdClient,
    config: SchedulerConfig,
    session: Mutex<Option<ActiveSession>>,
    next_id: AtomicU64,
}

impl MonitoringScheduler {
    /// Create a scheduler that polls through the given client
    pub fn new(client: ObdClient, config: SchedulerConfig) -> Self {
        Self {
            client,
            config,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start polling `pids` every `interval_ms`, measured from each cycle's start
    ///
    /// A session that was stopped but still has a request in flight is
    /// awaited first, so the new session starts on an idle channel.
    pub async fn start(
        &self,
        pids: Vec<String>,
        interval_ms: u64,
    ) -> Result<SessionHandle, MonitorError> {
        if pids.is_empty() {
            return Err(MonitorError::NoParameters);
        }

        let previous = {
            let mut session = self.session();
            if session.as_ref().is_some_and(ActiveSession::is_running) {
                return Err(MonitorError::AlreadyActive);
            }
            session.take()
        };
        if let Some(previous) = previous {
            debug!(session = previous.id, "Waiting for stopped session to finish");
            if let Err(e) = previous.task.await {
                warn!("Monitoring task ended abnormally: {}", e);
            }
        }

        let mut session = self.session();
        if session.is_some() {
            return Err(MonitorError::AlreadyActive);
        }

        let pids: Vec<String> = pids.iter().map(|p| p.trim().to_ascii_uppercase()).collect();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let (stop, stop_rx) = watch::channel(false);
        let (samples, _) = broadcast::channel(self.config.subscriber_capacity.max(1));

        info!(session = id, ?pids, interval_ms, "Starting monitoring session");

        let task = tokio::spawn(run_session(
            self.client.clone(),
            pids.clone(),
            Duration::from_millis(interval_ms),
            self.config.command_timeout_ms,
            samples.clone(),
            active.clone(),
            stop_rx,
        ));

        *session = Some(ActiveSession {
            id,
            active: active.clone(),
            stop,
            task,
        });

        Ok(SessionHandle {
            id,
            pids,
            interval_ms,
            active,
            samples,
        })
    }

    /// Stop the session; an in-flight request finishes but no further cycle starts
    pub fn stop(&self) {
        if let Some(session) = self.session().as_ref().filter(|s| s.is_running()) {
            info!(session = session.id, "Stopping monitoring session");
            session.signal_stop();
        }
    }

    /// Stop the session and wait for its poll loop to exit
    pub async fn shutdown(&self) {
        let session = self.session().take();
        if let Some(session) = session {
            info!(session = session.id, "Shutting down monitoring session");
            session.signal_stop();
            if let Err(e) = session.task.await {
                warn!("Monitoring task ended abnormally: {}", e);
            }
        }
    }

    /// Whether a session is currently running
    pub fn is_active(&self) -> bool {
        self.session().as_ref().is_some_and(ActiveSession::is_running)
    }
}

async fn run_session(
    client: ObdClient,
    pids: Vec<String>,
    interval: Duration,
    timeout_ms: u64,
    samples: broadcast::Sender<ParameterSample>,
    active: Arc<AtomicBool>,
    mut stop: watch::Receiver<bool>,
) {
    let mut cycle: u64 = 0;

    'session: loop {
        cycle += 1;
        let started = Instant::now();
        debug!(cycle, "Monitoring cycle started");

        for pid in &pids {
            if !active.load(Ordering::SeqCst) {
                break 'session;
            }

            match client.query_pid(pid, timeout_ms, cycle).await {
                Ok(sample) => {
                    // No receivers is not an error
                    let _ = samples.send(sample);
                }
                Err(ChannelError::Closed) => {
                    error!(cycle, "Command channel closed, ending monitoring session");
                    active.store(false, Ordering::SeqCst);
                    break 'session;
                }
                Err(e) => {
                    warn!(%pid, cycle, error = %e, "Skipping parameter this cycle");
                }
            }
        }

        if !active.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(started + interval) => {}
            _ = stop.changed() => break,
        }
    }

    info!(cycles = cycle, "Monitoring session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::{MockAdapter, MockHandle};
    use obd_protocol::CommandChannel;

    fn scheduler(adapter: MockAdapter, command_timeout_ms: u64) -> (MonitoringScheduler, MockHandle) {
        let (stream, handle) = adapter.spawn();
        let channel = Arc::new(CommandChannel::new(Box::new(stream), command_timeout_ms));
        let config = SchedulerConfig {
            command_timeout_ms,
            ..Default::default()
        };
        (MonitoringScheduler::new(ObdClient::new(channel), config), handle)
    }

    fn pids(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_active_session() {
        let (scheduler, _handle) = scheduler(MockAdapter::new(), 200);

        let first = scheduler.start(pids(&["010C"]), 1000).await.unwrap();
        assert!(first.is_active());
        assert_eq!(
            scheduler.start(pids(&["0105"]), 1000).await.unwrap_err(),
            MonitorError::AlreadyActive
        );

        scheduler.stop();
        assert!(!first.is_active());
        assert!(!scheduler.is_active());

        let second = scheduler.start(pids(&["0105"]), 1000).await.unwrap();
        assert_ne!(first.id(), second.id());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_parameter_list() {
        let (scheduler, _handle) = scheduler(MockAdapter::new(), 200);
        assert_eq!(
            scheduler.start(Vec::new(), 1000).await.unwrap_err(),
            MonitorError::NoParameters
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_published_in_order() {
        let (scheduler, _handle) = scheduler(MockAdapter::new(), 200);
        let handle = scheduler.start(pids(&["010c", "0105"]), 500).await.unwrap();
        let mut rx = handle.subscribe();

        let rpm = rx.recv().await.unwrap();
        let coolant = rx.recv().await.unwrap();
        assert_eq!((rpm.pid.as_str(), rpm.value, rpm.cycle), ("010C", 1726.0, 1));
        assert_eq!((coolant.pid.as_str(), coolant.value, coolant.cycle), ("0105", 50.0, 1));

        let next = rx.recv().await.unwrap();
        assert_eq!((next.pid.as_str(), next.cycle), ("010C", 2));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_measured_from_cycle_start() {
        let adapter = MockAdapter::new().with_latency(Duration::from_millis(100));
        let (scheduler, _handle) = scheduler(adapter, 500);
        let handle = scheduler.start(pids(&["010C", "0105"]), 1000).await.unwrap();
        let mut rx = handle.subscribe();

        let mut first_of_cycle = Vec::new();
        while first_of_cycle.len() < 3 {
            let sample = rx.recv().await.unwrap();
            if sample.pid == "010C" {
                first_of_cycle.push(Instant::now());
            }
        }

        for pair in first_of_cycle.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(1000) && gap < Duration::from_millis(1050),
                "cycle gap {gap:?}"
            );
        }
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_parameter_does_not_abort_cycle() {
        let adapter = MockAdapter::new()
            .respond_sequence("0105", &[None, Some("41055A")])
            .respond("0104", "NO DATA");
        let (scheduler, _handle) = scheduler(adapter, 200);
        let handle = scheduler.start(pids(&["0105", "0104", "010C"]), 1000).await.unwrap();
        let mut rx = handle.subscribe();

        let first = rx.recv().await.unwrap();
        assert_eq!((first.pid.as_str(), first.cycle), ("010C", 1));
        let second = rx.recv().await.unwrap();
        assert_eq!((second.pid.as_str(), second.cycle), ("0105", 2));
        assert!(handle.is_active());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_stopped_session() {
        let adapter = MockAdapter::new().with_latency(Duration::from_millis(100));
        let (scheduler, mock) = scheduler(adapter, 500);

        let first = scheduler.start(pids(&["0105"]), 1000).await.unwrap();
        let mut first_rx = first.subscribe();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.commands(), ["0105"]);

        // 0105 is still in flight when the session is replaced
        scheduler.stop();
        let second = scheduler.start(pids(&["010C"]), 1000).await.unwrap();
        let mut second_rx = second.subscribe();

        let sample = second_rx.recv().await.unwrap();
        assert_eq!((sample.pid.as_str(), sample.cycle), ("010C", 1));
        assert_eq!(mock.commands(), ["0105", "010C"]);

        // The stopped session's last sample never reaches the new subscribers
        assert_eq!(first_rx.recv().await.unwrap().pid, "0105");
        assert!(second_rx.try_recv().is_err());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_schedules_no_further_cycles() {
        let (scheduler, mock) = scheduler(MockAdapter::new(), 200);
        let handle = scheduler.start(pids(&["010C"]), 1000).await.unwrap();
        let mut rx = handle.subscribe();
        rx.recv().await.unwrap();

        scheduler.shutdown().await;
        let sent = mock.commands().len();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(mock.commands().len(), sent);
        assert!(!handle.is_active());
    }
}
