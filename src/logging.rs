/* Connection, routing and lifecycle logging */

use env_logger::{Builder, Env};
use log::LevelFilter;

pub fn init() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    // RUST_LOG, when set, decides the crate's own level too.
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_module("wsproxy", LevelFilter::Info);
    }
    builder.init();
}
