//! wirekit runtime runner.
//!
//! Phase order: **start → wait → stop**. Shutdown is driven by an external
//! `CancellationToken` or an arbitrary future (e.g. an OS-signal waiter); the core
//! never installs signal handlers itself.

use std::{future::Future, pin::Pin, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::errors::LifecycleError;
use crate::runtime::{ComponentHost, Deadline};

/// How the runner should decide when to stop.
pub enum ShutdownOptions {
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

/// Options for [`run`].
pub struct RunOptions {
    pub shutdown: ShutdownOptions,
    /// Bound on the whole start sweep.
    pub startup_timeout: Option<Duration>,
    /// Bound on the whole stop sweep.
    pub shutdown_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new(shutdown: ShutdownOptions) -> Self {
        Self {
            shutdown,
            startup_timeout: None,
            shutdown_timeout: None,
        }
    }
}

fn deadline(token: &CancellationToken, timeout: Option<Duration>) -> Deadline {
    let deadline = Deadline::from_token(token.child_token());
    match timeout {
        Some(t) => deadline.with_timeout(t),
        None => deadline,
    }
}

/// Full cycle: start → wait for shutdown → stop.
///
/// A failed start still stops whatever did come up, then returns the start error.
pub async fn run(host: &ComponentHost, opts: RunOptions) -> Result<(), LifecycleError> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        ShutdownOptions::Future(_) => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    // stop must not inherit the token that triggered it
    let stop_root = CancellationToken::new();

    if let Err(err) = host.start(&deadline(&cancel, opts.startup_timeout)).await {
        tracing::error!(error = %err, "Startup failed; stopping started components");
        if let Err(stop_err) = host.stop(&deadline(&stop_root, opts.shutdown_timeout)).await {
            tracing::warn!(error = %stop_err, "Stop after failed startup reported errors");
        }
        return Err(err);
    }

    cancel.cancelled().await;
    tracing::info!("Shutdown requested");

    host.stop(&deadline(&stop_root, opts.shutdown_timeout)).await
}
