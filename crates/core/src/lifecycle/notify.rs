//! Readiness messages for systemd `Type=notify` units.

use sd_notify::NotifyState;

fn send(state: NotifyState<'_>) {
    // Outside systemd there is no socket and nothing to report to.
    if let Err(e) = sd_notify::notify(false, &[state]) {
        tracing::debug!("sd_notify failed: {e}");
    }
}

pub fn sd_ready() {
    send(NotifyState::Ready);
}

pub fn sd_reloading() {
    send(NotifyState::Reloading);
}

pub fn sd_stopping() {
    send(NotifyState::Stopping);
}
