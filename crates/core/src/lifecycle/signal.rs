//! OS signals: SIGTERM/SIGINT stop the server, SIGHUP reloads config.

use tokio::sync::watch;

pub struct SignalHandler {
    shutdown_tx: watch::Sender<bool>,
}

impl SignalHandler {
    /// The receiver flips to `true` once shutdown was requested.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    /// Request shutdown without an OS signal.
    pub fn trigger(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for a stop signal, calling `on_reload` for every SIGHUP.
    pub async fn run<F>(self, on_reload: F) -> std::io::Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sighup = signal(SignalKind::hangup())?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("SIGINT received, shutting down");
                        break;
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("SIGTERM received, shutting down");
                        break;
                    }
                    _ = sighup.recv() => {
                        tracing::info!("SIGHUP received");
                        on_reload();
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = &on_reload;
            tokio::signal::ctrl_c().await?;
            tracing::info!("Ctrl+C received, shutting down");
        }

        self.trigger();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_flips_receiver() {
        let (handler, rx) = SignalHandler::new();
        assert!(!*rx.borrow());
        handler.trigger();
        assert!(*rx.borrow());
    }
}
