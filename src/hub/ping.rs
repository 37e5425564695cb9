use std::collections::HashSet;

use super::client::apply_sup;
use super::error::HubError;
use crate::protocol::{FieldMap, Session};

/// One-shot hub information probe.
///
/// Advertises PING alongside the base features, requires the hub to
/// support it, then reads until the hub's own INF arrives and returns
/// its fields. The session is consumed; no client state is built.
pub async fn ping(mut session: Session) -> Result<FieldMap, HubError> {
    session.write_line("HSUP ADBASE ADTIGR ADPING").await?;

    let msg = session.read_message().await?;
    if msg.command != "SUP" {
        session.close().await;
        return Err(HubError::Unexpected(msg.raw));
    }
    let mut features = HashSet::new();
    apply_sup(&mut features, &msg)?;
    if !features.contains("PING") {
        session.close().await;
        return Err(HubError::MissingFeature("PING".to_string()));
    }

    loop {
        let msg = session.read_message().await?;
        if msg.command == "INF" {
            session.close().await;
            return Ok(msg.fields_from(0));
        }
    }
}
