//! Run-wide cancellation.
//!
//! A single [`CancellationTrigger`] is owned by the signal listener; every
//! worker holds a cloned [`Cancellation`] and either awaits
//! [`Cancellation::cancelled`] (child process supervision) or polls
//! [`Cancellation::check`] between entries (blocking archive/snapshot work).

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone, Debug)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

#[derive(Clone, Debug)]
pub struct CancellationTrigger {
    tx: watch::Sender<bool>,
}

pub fn cancellation() -> (CancellationTrigger, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancellationTrigger { tx }, Cancellation { rx })
}

impl Cancellation {
    /// A token that can never fire.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // trigger dropped without firing
            std::future::pending::<()>().await
        }
    }
}

impl CancellationTrigger {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Fires `trigger` on SIGINT or SIGTERM. Must be called inside a tokio runtime.
pub fn listen_for_signals(trigger: CancellationTrigger) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal_name = wait_for_signal().await;
        tracing::warn!("Received {signal_name}, cancelling outstanding jobs");
        trigger.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {e}");
            return match tokio::signal::ctrl_c().await {
                Ok(_) => "SIGINT",
                Err(_) => std::future::pending().await,
            };
        }
    };

    let received = tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    };

    match received {
        Ok(signal_name) => signal_name,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGINT: {e}");
            terminate.recv().await;
            "SIGTERM"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(_) => "Ctrl-C",
        Err(_) => std::future::pending().await,
    }
}
