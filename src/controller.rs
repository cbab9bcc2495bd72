/* Runs one `Listener` on its own OS thread and event loop.

    Callers on other threads get blocking `start`/`stop` calls that never wait
    longer than the configured timeouts. The thread reports exactly once
    whether its listener bound; stopping sends a message into the loop, which
    shuts the listener down and acknowledges before the thread exits.
 */

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;

use crate::config::ProxyConfig;
use crate::error::ControllerError;
use crate::listener::{Listener, ListenerStats, StatsSnapshot};

type StartReport = Result<(Vec<SocketAddr>, Arc<ListenerStats>), ControllerError>;

struct Worker {
    thread: thread::JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
    stopped_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
    local_addrs: Vec<SocketAddr>,
    stats: Arc<ListenerStats>,
}

pub struct ProxyController {
    config: Arc<ProxyConfig>,
    worker: Option<Worker>,
    error_message: Option<String>,
}

impl ProxyController {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            worker: None,
            error_message: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Last start/stop failure, kept for the management layer to print.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.running.load(Ordering::SeqCst) && !w.thread.is_finished())
    }

    /// Addresses the listener is bound to; empty unless running.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        match &self.worker {
            Some(worker) if self.is_running() => &worker.local_addrs,
            _ => &[],
        }
    }

    pub fn stats(&self) -> Option<StatsSnapshot> {
        self.worker.as_ref().map(|w| w.stats.snapshot())
    }

    /// Returns true only if the listener actually bound.
    pub fn start(&mut self) -> bool {
        match self.try_start() {
            Ok(()) => true,
            Err(e) => {
                self.error_message = Some(e.to_string());
                false
            }
        }
    }

    pub fn try_start(&mut self) -> Result<(), ControllerError> {
        if self.is_running() {
            return Ok(());
        }
        // A worker whose thread died on its own has nothing left to stop.
        if let Some(worker) = self.worker.take() {
            let _ = worker.thread.join();
        }

        let port = self.config.port;
        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = mpsc::sync_channel(1);
        let running = Arc::new(AtomicBool::new(false));

        let thread = {
            let config = Arc::clone(&self.config);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name(format!("wsproxy-{port}"))
                .spawn(move || run(config, running, started_tx, stop_rx, stopped_tx))
                .map_err(ControllerError::Runtime)?
        };

        let timeout = self.config.start_timeout;
        match started_rx.recv_timeout(timeout) {
            Ok(Ok((local_addrs, stats))) => {
                info!("Proxy on port {} started", port);
                self.error_message = None;
                self.worker = Some(Worker {
                    thread,
                    stop_tx,
                    stopped_rx,
                    running,
                    local_addrs,
                    stats,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            // Dropping `stop_tx` and `started_rx` makes a late listener shut itself down.
            Err(RecvTimeoutError::Timeout) => {
                warn!("Proxy on port {} did not start within {:?}", port, timeout);
                Err(ControllerError::StartTimeout { port, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                Err(ControllerError::Exited { port })
            }
        }
    }

    /// No-op when not running. Always releases the worker, even on timeout.
    pub fn stop(&mut self) -> bool {
        match self.try_stop() {
            Ok(()) => true,
            Err(e) => {
                self.error_message = Some(e.to_string());
                false
            }
        }
    }

    pub fn try_stop(&mut self) -> Result<(), ControllerError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let port = self.config.port;
        worker.running.store(false, Ordering::SeqCst);
        // Fails only if the loop is already gone, which the ack below covers.
        let _ = worker.stop_tx.send(());

        let timeout = self.config.stop_timeout;
        match worker.stopped_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.thread.join();
                info!("Proxy on port {} stopped", port);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Proxy on port {} did not stop within {:?}", port, timeout);
                Err(ControllerError::StopTimeout { port, timeout })
            }
        }
    }
}

impl Drop for ProxyController {
    fn drop(&mut self) {
        if let Err(e) = self.try_stop() {
            warn!("{}", e);
        }
    }
}

// Body of the proxy thread.
fn run(
    config: Arc<ProxyConfig>,
    running: Arc<AtomicBool>,
    started_tx: SyncSender<StartReport>,
    stop_rx: oneshot::Receiver<()>,
    stopped_tx: SyncSender<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = started_tx.send(Err(ControllerError::Runtime(e)));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match Listener::start(Arc::clone(&config)) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = started_tx.send(Err(e.into()));
                return;
            }
        };

        running.store(true, Ordering::SeqCst);
        let report = Ok((listener.local_addrs().to_vec(), listener.stats()));
        if started_tx.send(report).is_err() {
            debug!("Start of port {} abandoned by caller", config.port);
        } else {
            // An explicit stop and a dropped controller both end up here.
            let _ = stop_rx.await;
        }
        running.store(false, Ordering::SeqCst);
        listener.shutdown().await;
    });
    drop(runtime);
    let _ = stopped_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn start_and_stop() {
        let port = free_port();
        let mut controller = ProxyController::new(ProxyConfig::default().with_port(port));
        assert!(!controller.is_running());

        assert!(controller.start());
        assert!(controller.is_running());
        assert!(controller.error_message().is_none());
        assert!(controller.local_addrs().iter().all(|a| a.port() == port));
        TcpStream::connect(("127.0.0.1", port)).unwrap();

        assert!(controller.stop());
        assert!(!controller.is_running());
        assert!(controller.local_addrs().is_empty());
        assert!(TcpStream::connect_timeout(
            &SocketAddr::from(([127, 0, 0, 1], port)),
            Duration::from_millis(500)
        )
        .is_err());
    }

    #[test]
    fn starting_twice_keeps_one_listener() {
        let port = free_port();
        let mut controller = ProxyController::new(ProxyConfig::default().with_port(port));
        assert!(controller.start());
        let addrs = controller.local_addrs().to_vec();
        assert!(controller.start());
        assert_eq!(controller.local_addrs(), addrs.as_slice());
    }

    #[test]
    fn bind_failure_is_reported() {
        let port = free_port();
        let mut first = ProxyController::new(ProxyConfig::default().with_port(port));
        assert!(first.start());

        let mut second = ProxyController::new(ProxyConfig::default().with_port(port));
        assert!(!second.start());
        assert!(!second.is_running());
        let message = second.error_message().unwrap();
        assert!(message.contains(&port.to_string()), "{message}");
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut controller = ProxyController::new(ProxyConfig::default().with_port(free_port()));
        assert!(controller.stop());
        assert!(controller.error_message().is_none());
    }

    #[test]
    fn start_timeout_leaves_the_port_free() {
        let port = free_port();
        let mut late = ProxyController::new(ProxyConfig {
            start_timeout: Duration::ZERO,
            ..ProxyConfig::default().with_port(port)
        });
        assert_eq!(late.port(), port);
        assert!(!late.start());
        assert!(!late.is_running());
        let message = late.error_message().unwrap();
        assert!(message.contains("timed out"), "{message}");

        // The abandoned listener may still be binding; it has to let go.
        let mut fresh = ProxyController::new(ProxyConfig::default().with_port(port));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !fresh.start() {
            assert!(Instant::now() < deadline, "{:?}", fresh.error_message());
            thread::sleep(Duration::from_millis(50));
        }
        assert!(fresh.is_running());
    }

    #[test]
    fn stop_timeout_still_releases_the_port() {
        let port = free_port();
        let mut controller = ProxyController::new(ProxyConfig {
            stop_timeout: Duration::ZERO,
            ..ProxyConfig::default().with_port(port)
        });
        assert_eq!(controller.config().stop_timeout, Duration::ZERO);
        assert!(controller.start());

        assert!(!controller.stop());
        assert!(!controller.is_running());
        let message = controller.error_message().unwrap();
        assert!(message.contains("timed out"), "{message}");

        let mut next = ProxyController::new(ProxyConfig::default().with_port(port));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !next.start() {
            assert!(Instant::now() < deadline, "{:?}", next.error_message());
            thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn can_restart_after_stop() {
        let port = free_port();
        let mut controller = ProxyController::new(ProxyConfig::default().with_port(port));
        assert!(controller.start());
        assert!(controller.stop());
        assert!(controller.start());
        assert!(controller.is_running());
    }
}
