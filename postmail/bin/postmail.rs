//! The postmail delivery daemon.
//!
//! Runs the worker pool against in-process stores until CTRL+C or SIGTERM.
//! There is no inbound surface: emails only arrive through
//! [`postmail::Postmail::intake`] when the pipeline is embedded as a library,
//! so this binary on its own idles with an empty queue.

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use postmail::{Config, Postmail};
use postmail_common::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init()?;

    let config = Config::load()?;

    Postmail::new(config).run().await
}
