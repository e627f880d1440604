//! Process lifecycle: readiness notification, signals, and logging setup.

pub mod logging;
pub mod notify;
pub mod signal;

/// Hooks fired at the edges of the server's life.
pub trait Lifecycle: Send + Sync {
    fn on_ready(&self, addr: &str);
    fn on_reloading(&self);
    fn on_reloaded(&self);
    fn on_stopping(&self);
}

/// Plain process: events are only logged.
pub struct ForegroundLifecycle;

impl Lifecycle for ForegroundLifecycle {
    fn on_ready(&self, addr: &str) {
        tracing::info!(addr, "warden listening");
    }

    fn on_reloading(&self) {
        tracing::info!("Reloading configuration");
    }

    fn on_reloaded(&self) {
        tracing::info!("Configuration reloaded");
    }

    fn on_stopping(&self) {
        tracing::info!("Draining connections and stopping");
    }
}

/// Running under a systemd `Type=notify` unit.
pub struct SystemdLifecycle;

impl Lifecycle for SystemdLifecycle {
    fn on_ready(&self, addr: &str) {
        notify::sd_ready();
        tracing::info!(addr, "warden listening, readiness sent to systemd");
    }

    fn on_reloading(&self) {
        notify::sd_reloading();
        tracing::info!("Reloading configuration");
    }

    fn on_reloaded(&self) {
        notify::sd_ready();
        tracing::info!("Configuration reloaded");
    }

    fn on_stopping(&self) {
        notify::sd_stopping();
        tracing::info!("Draining connections and stopping");
    }
}

/// Systemd when `NOTIFY_SOCKET` is present, foreground otherwise.
pub fn detect_lifecycle() -> Box<dyn Lifecycle> {
    if std::env::var("NOTIFY_SOCKET").is_ok() {
        Box::new(SystemdLifecycle)
    } else {
        Box::new(ForegroundLifecycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_without_systemd() {
        // sd-notify is a no-op without NOTIFY_SOCKET
        let hooks: [Box<dyn Lifecycle>; 2] =
            [Box::new(ForegroundLifecycle), Box::new(SystemdLifecycle)];
        for lc in hooks {
            lc.on_ready("127.0.0.1:0");
            lc.on_reloading();
            lc.on_reloaded();
            lc.on_stopping();
        }
    }
}
