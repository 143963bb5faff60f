//! Keeps an attachment alive across target restarts.

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::config::supervisor::{LIVENESS_POLL_INTERVAL, MAX_RETRY_COOLDOWN};
use crate::error::Error;
use crate::memory::ProcessProvider;
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::session::{AttachContext, AttachSession};
use crate::shutdown::ShutdownSignal;

/// Lifecycle notifications published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AttachEvent {
    Attached {
        pid: u32,
        resolved: usize,
        failed: usize,
    },
    Detached {
        pid: u32,
    },
    AttachFailed {
        reason: String,
    },
}

pub struct Supervisor<V: ProcessProvider> {
    provider: V,
    config: SessionConfig,
    context: AttachContext,
    poll_interval: Duration,
    subscribers: Mutex<Vec<Sender<AttachEvent>>>,
}

impl<V: ProcessProvider> Supervisor<V> {
    pub fn new(provider: V, config: SessionConfig, context: AttachContext) -> Self {
        Self {
            provider,
            config,
            context,
            poll_interval: LIVENESS_POLL_INTERVAL,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<AttachEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: AttachEvent) {
        debug!("Publishing {:?}", event);
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Wait before the next attach. Repeated hard failures double it, up to
    /// [`MAX_RETRY_COOLDOWN`].
    fn cooldown(&self, failures: u32) -> Duration {
        let backoff = ExponentialBackoff {
            max_attempts: u32::MAX,
            initial_delay: self.config.retry_cooldown,
            max_delay: MAX_RETRY_COOLDOWN.max(self.config.retry_cooldown),
        };
        backoff
            .next_delay(failures.max(1))
            .unwrap_or(backoff.max_delay)
    }

    /// Attach, watch the process, and re-attach after it exits until
    /// `shutdown` fires.
    pub fn run(&self, shutdown: &ShutdownSignal) {
        self.run_with(shutdown, |_| {});
    }

    /// Like [`run`](Self::run), calling `on_attach` with every new session.
    pub fn run_with<F>(&self, shutdown: &ShutdownSignal, mut on_attach: F)
    where
        F: FnMut(&AttachSession<V::Process>),
    {
        info!("Waiting for {}...", self.config.process_name);
        let mut failures = 0u32;

        while !shutdown.is_shutdown() {
            match AttachSession::attach(&self.provider, &self.config, &self.context) {
                Ok(session) => {
                    failures = 0;
                    let pid = session.pid();
                    self.publish(AttachEvent::Attached {
                        pid,
                        resolved: session.addresses().resolved_count(),
                        failed: session.addresses().failed_count(),
                    });
                    on_attach(&session);

                    while !shutdown.wait(self.poll_interval) {
                        if !session.is_alive() {
                            info!("Process {} exited", pid);
                            break;
                        }
                    }

                    session.detach();
                    self.publish(AttachEvent::Detached { pid });
                    if shutdown.is_shutdown() {
                        break;
                    }
                    info!("Process disconnected, waiting for reconnect...");
                }
                Err(Error::ProcessNotFound(name)) => {
                    failures = 0;
                    debug!("{} is not running", name);
                }
                Err(e) => {
                    if e.is_transient() {
                        debug!("Attach failed, will retry: {}", e);
                    } else {
                        failures = failures.saturating_add(1);
                        warn!("Attach failed: {}", e);
                    }
                    self.publish(AttachEvent::AttachFailed {
                        reason: e.to_string(),
                    });
                }
            }

            if shutdown.wait(self.cooldown(failures)) {
                break;
            }
        }

        info!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::error::Result;
    use crate::memory::RemoteProcess;
    use crate::memory::mock::MockProcess;
    use crate::session::tests::{
        HeapChannels, context, mock_target, session_config, write_target_image,
    };

    /// Hands out a scripted sequence of targets; `None` means not running.
    struct ScriptedProvider {
        targets: parking_lot::Mutex<VecDeque<Option<Arc<MockProcess>>>>,
    }

    impl ProcessProvider for ScriptedProvider {
        type Process = Arc<MockProcess>;

        fn find_and_open(&self, process_name: &str) -> Result<Self::Process> {
            match self.targets.lock().pop_front().flatten() {
                Some(process) => Ok(process),
                None => Err(Error::ProcessNotFound(process_name.to_string())),
            }
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            retry_cooldown: Duration::from_millis(10),
            ..session_config()
        }
    }

    #[test]
    fn test_reattaches_after_process_exit() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_target_image(dir.path());
        let first = Arc::new(mock_target(image.clone()));
        let second = Arc::new(mock_target(image));
        let provider = ScriptedProvider {
            targets: parking_lot::Mutex::new(VecDeque::from([
                None,
                Some(first.clone()),
                None,
                Some(second.clone()),
            ])),
        };

        let supervisor = Arc::new(
            Supervisor::new(provider, fast_config(), context(Arc::new(HeapChannels), dir.path()))
                .with_poll_interval(Duration::from_millis(5)),
        );
        let events = supervisor.subscribe();
        let shutdown = Arc::new(ShutdownSignal::new());

        let runner = {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || supervisor.run(&shutdown))
        };

        let timeout = Duration::from_secs(5);
        assert!(matches!(
            events.recv_timeout(timeout).unwrap(),
            AttachEvent::Attached { pid: 4242, resolved: 1, failed: 1 }
        ));
        first.kill();
        assert_eq!(
            events.recv_timeout(timeout).unwrap(),
            AttachEvent::Detached { pid: 4242 }
        );
        assert!(matches!(
            events.recv_timeout(timeout).unwrap(),
            AttachEvent::Attached { .. }
        ));

        shutdown.trigger();
        runner.join().unwrap();
        assert_eq!(
            events.recv_timeout(timeout).unwrap(),
            AttachEvent::Detached { pid: 4242 }
        );
        assert!(second.is_alive());
    }

    #[test]
    fn test_attach_failure_is_published() {
        let dir = tempfile::tempdir().unwrap();
        // no image on disk, so the scanner cannot open it
        let broken = Arc::new(mock_target(dir.path().join("missing.exe")));
        let provider = ScriptedProvider {
            targets: parking_lot::Mutex::new(VecDeque::from([Some(broken)])),
        };
        let supervisor = Arc::new(Supervisor::new(
            provider,
            fast_config(),
            context(Arc::new(HeapChannels), dir.path()),
        ));
        let events = supervisor.subscribe();
        let shutdown = Arc::new(ShutdownSignal::new());

        let runner = {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || supervisor.run(&shutdown))
        };

        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            AttachEvent::AttachFailed { reason } => assert!(reason.contains("IO error")),
            other => panic!("unexpected event {other:?}"),
        }
        shutdown.trigger();
        runner.join().unwrap();
    }

    #[test]
    fn test_shutdown_before_start_returns() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider {
            targets: parking_lot::Mutex::new(VecDeque::new()),
        };
        let supervisor = Supervisor::new(
            provider,
            fast_config(),
            context(Arc::new(HeapChannels), dir.path()),
        );
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();

        let mut attached = 0;
        supervisor.run_with(&shutdown, |_| attached += 1);
        assert_eq!(attached, 0);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider {
            targets: parking_lot::Mutex::new(VecDeque::new()),
        };
        let supervisor = Supervisor::new(
            provider,
            fast_config(),
            context(Arc::new(HeapChannels), dir.path()),
        );
        let kept = supervisor.subscribe();
        drop(supervisor.subscribe());

        supervisor.publish(AttachEvent::Detached { pid: 1 });
        assert_eq!(supervisor.subscribers.lock().len(), 1);
        assert_eq!(kept.try_recv().unwrap(), AttachEvent::Detached { pid: 1 });
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&AttachEvent::Attached {
            pid: 7,
            resolved: 3,
            failed: 0,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"attached","pid":7,"resolved":3,"failed":0}"#);
    }

    #[test]
    fn test_cooldown_backs_off_after_hard_failures() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider {
            targets: parking_lot::Mutex::new(VecDeque::new()),
        };
        let config = SessionConfig {
            retry_cooldown: Duration::from_secs(5),
            ..session_config()
        };
        let supervisor =
            Supervisor::new(provider, config, context(Arc::new(HeapChannels), dir.path()));

        assert_eq!(supervisor.cooldown(0), Duration::from_secs(5));
        assert_eq!(supervisor.cooldown(1), Duration::from_secs(5));
        assert_eq!(supervisor.cooldown(2), Duration::from_secs(10));
        assert_eq!(supervisor.cooldown(4), Duration::from_secs(40));
        assert_eq!(supervisor.cooldown(9), MAX_RETRY_COOLDOWN);
    }
}
