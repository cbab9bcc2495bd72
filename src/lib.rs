/* A TCP tunnel that answers like an HTTP/WebSocket upgrade and then relays
    the raw stream to an SSH or OpenVPN daemon, picked by sniffing the first
    payload bytes. Each port runs on its own thread and event loop, opened and
    closed through a `ProxyManager`.
 */

pub mod config;
pub mod controller;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod stream;
pub mod tunnel;
pub mod upstream;

pub use config::ProxyConfig;
pub use controller::ProxyController;
pub use error::{BindError, ConnectionError, ControllerError};
pub use listener::{Listener, StatsSnapshot};
pub use manager::ProxyManager;
pub use upstream::Upstream;
