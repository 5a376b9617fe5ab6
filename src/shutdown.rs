use tokio::sync::watch;

/// Read side of the process-wide cancellation flag.
///
/// Cheap to clone; every long-running loop holds one and checks it at its
/// suspension points (between polls, between rows, between pages).
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    rx: watch::Receiver<bool>,
}

impl ShutdownFlag {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag has been flipped. A dropped handle counts as
    /// "never cancelled": waiters stay pending rather than spuriously waking.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        if self.rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Flips the flag. Returns true if this call did the flipping.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }
}

pub fn channel() -> (ShutdownHandle, ShutdownFlag) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownFlag { rx })
}

/// Installs the signal handler task: the first SIGINT/SIGTERM requests a
/// graceful stop, a second one exits immediately.
pub fn spawn_signal_handler(handle: ShutdownHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sig) => Some(sig),
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                None
            }
        };

        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = async {
                        match term.as_mut() {
                            Some(sig) => { sig.recv().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => {}
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }

            if handle.trigger() {
                tracing::info!("shutdown requested; finishing the current step before exiting");
            } else {
                tracing::warn!("second signal received; exiting immediately");
                std::process::exit(130);
            }
        }
    });
}
