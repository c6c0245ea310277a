//! Forwarding HTTP/1.1 proxy with HTTPS `CONNECT` tunneling and
//! rule-based host access control.

pub mod cli;
pub mod config;
pub mod error;
pub mod event_log;
pub mod forward;
pub mod logging;
pub mod request;
pub mod rules;
pub mod shutdown;
pub mod supervisor;
pub mod tunnel;
pub mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::event_log::EventLogger;
use crate::rules::FilterEngine;
use crate::supervisor::Supervisor;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Loads the rule set, wires up the supervisor, and runs the accept loop
/// until shutdown completes (SPEC_FULL §3, §4.9).
pub async fn run(config: Config) -> Result<()> {
    let (filter, initial_rule_error) = FilterEngine::load(config.blocked_domains_path());
    if let Some(e) = initial_rule_error {
        log::warn!(
            "blocked-domains file {} unreadable at startup, starting permissive: {e}",
            config.blocked_domains_path().display()
        );
    }

    let logger = EventLogger::new(config.log_file_path());
    let shutdown = shutdown::init(SHUTDOWN_GRACE)?;
    let bind_addr = config.bind_addr()?;

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(filter),
        logger,
        shutdown,
        config.thread_pool_size,
    ));

    supervisor.run(bind_addr, config.backlog).await
}
