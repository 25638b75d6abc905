//! `riftc punch <proxy>`: attempt a hole punch to an xtcp proxy and report it.
//!
//! Logs in without registering anything, only to learn the coordinator port.

use anyhow::{bail, Context, Result};
use rift_client::{punch_as_visitor, ClientConfig, RiftClient};
use rift_core::PunchOutcome;
use std::time::Duration;

pub async fn run(mut config: ClientConfig, proxy: &str, sk: &str, timeout: Duration) -> Result<()> {
    config.proxies.clear();
    config.visitors.clear();
    let client = RiftClient::new(config);
    let session = client.login("").await.context("login failed")?;
    let server = client
        .context()
        .server_udp_addr()
        .await
        .context("server does not coordinate hole punches")?;

    let punch = punch_as_visitor(server, proxy, sk, timeout).await;
    session.close().await;
    let punch = punch?;

    match punch.outcome {
        PunchOutcome::Established { sid, peer } => {
            println!("established  sid={sid} peer={peer} local={}", punch.socket.local_addr()?);
            Ok(())
        }
        PunchOutcome::Failed { sid, reason } => bail!("hole punch failed (sid {sid:?}): {reason}"),
    }
}
