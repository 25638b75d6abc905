//! `riftc run`: keep a control session alive, reconnecting with backoff.

use anyhow::{Context, Result};
use rift_client::{ClientConfig, RiftClient};
use std::time::Duration;
use tracing::{info, warn};

use super::shutdown_signal;

/// Exponential reconnect delay, reset after every successful login.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Run until interrupted. With `login_fail_exit`, a failed first login is fatal.
pub async fn run(config: ClientConfig, login_fail_exit: bool) -> Result<()> {
    let client = RiftClient::new(config);
    let _visitors = client
        .start_visitors()
        .await
        .context("failed to start visitors")?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    let mut run_id = String::new();
    let mut logged_in_once = false;
    loop {
        match client.login(&run_id).await {
            Ok(mut session) => {
                logged_in_once = true;
                backoff.reset();
                run_id = session.run_id().to_string();

                let ended = tokio::select! {
                    reason = session.closed() => Some(reason),
                    _ = &mut shutdown => None,
                };
                let Some(reason) = ended else {
                    info!("received shutdown signal");
                    session.close().await;
                    return Ok(());
                };
                warn!(run_id = %run_id, reason = %reason, "session ended");
            }
            Err(e) if login_fail_exit && !logged_in_once => {
                return Err(e).context("login failed");
            }
            Err(e) => warn!(error = %e, "login failed"),
        }

        let delay = backoff.next_delay();
        info!(delay = ?delay, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut shutdown => {
                info!("received shutdown signal");
                return Ok(());
            }
        }
    }
}
