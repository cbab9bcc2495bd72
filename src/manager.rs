/* Keyed set of proxy controllers, one per open port.
    Opening or closing a port never touches the others. Callers are expected to
    drive a manager from one thread; wrap it in a Mutex to share it.
 */

use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use crate::config::ProxyConfig;
use crate::controller::ProxyController;
use crate::listener::StatsSnapshot;

pub struct ProxyManager {
    defaults: ProxyConfig,
    controllers: BTreeMap<u16, ProxyController>,
    errors: HashMap<u16, String>,
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}

impl ProxyManager {
    /// `defaults` is the template for every port; its own port is ignored.
    pub fn new(defaults: ProxyConfig) -> Self {
        Self {
            defaults,
            controllers: BTreeMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn open(&mut self, port: u16) -> bool {
        if self
            .controllers
            .get(&port)
            .is_some_and(ProxyController::is_running)
        {
            return true;
        }
        // Whatever is left for this port has failed; start over.
        self.discard(port);

        let mut controller = ProxyController::new(self.defaults.with_port(port));
        if controller.start() {
            info!("Opened port {}", port);
            self.errors.remove(&port);
            self.controllers.insert(port, controller);
            true
        } else {
            let message = controller
                .error_message()
                .unwrap_or("unknown error")
                .to_string();
            warn!("Failed to open port {}: {}", port, message);
            self.errors.insert(port, message);
            false
        }
    }

    /// Returns false if the port was not open.
    pub fn close(&mut self, port: u16) -> bool {
        let Some(mut controller) = self.controllers.remove(&port) else {
            return false;
        };
        if !controller.stop() {
            if let Some(message) = controller.error_message() {
                warn!("Port {} did not close cleanly: {}", port, message);
                self.errors.insert(port, message.to_string());
            }
        }
        info!("Closed port {}", port);
        true
    }

    /// Best effort: one port failing to stop does not keep the others open.
    pub fn close_all(&mut self) {
        let ports: Vec<u16> = self.controllers.keys().copied().collect();
        for port in ports {
            self.close(port);
        }
    }

    pub fn active_ports(&self) -> BTreeSet<u16> {
        self.controllers
            .iter()
            .filter(|(_, controller)| controller.is_running())
            .map(|(port, _)| *port)
            .collect()
    }

    pub fn error_message(&self, port: u16) -> Option<&str> {
        self.errors.get(&port).map(String::as_str)
    }

    pub fn local_addrs(&self, port: u16) -> &[SocketAddr] {
        self.controllers
            .get(&port)
            .map(ProxyController::local_addrs)
            .unwrap_or(&[])
    }

    pub fn stats(&self, port: u16) -> Option<StatsSnapshot> {
        self.controllers.get(&port).and_then(ProxyController::stats)
    }

    fn discard(&mut self, port: u16) {
        if let Some(mut stale) = self.controllers.remove(&port) {
            let _ = stale.try_stop();
        }
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
