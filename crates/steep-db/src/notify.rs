//! LISTEN/NOTIFY plumbing.
//!
//! Progress updates are mirrored onto the `steep_repl_progress` channel so
//! observers connected only to the database can follow long operations;
//! `steep_repl_work` wakes the work-queue dispatcher.

use futures::stream::poll_fn;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, GenericClient, NoTls};
use tracing::{debug, warn};

use crate::DbError;

/// Channel carrying JSON progress payloads.
pub const PROGRESS_CHANNEL: &str = "steep_repl_progress";

/// Channel waking the work-queue dispatcher.
pub const WORK_CHANNEL: &str = "steep_repl_work";

// NOTIFY payloads are capped around 8000 bytes server-side; stay beneath.
const MAX_PAYLOAD_BYTES: usize = 7900;

/// Sends notifications through a pooled connection.
pub struct Notifier;

impl Notifier {
    /// Emits one notification, truncating oversized payloads.
    pub async fn notify<C: GenericClient>(
        client: &C,
        channel: &str,
        payload: &str,
    ) -> Result<(), DbError> {
        let payload = if payload.len() > MAX_PAYLOAD_BYTES {
            &payload[..MAX_PAYLOAD_BYTES]
        } else {
            payload
        };
        client
            .execute("SELECT pg_notify($1, $2)", &[&channel, &payload])
            .await?;
        Ok(())
    }
}

/// A dedicated LISTEN session forwarding notification payloads.
///
/// LISTEN requires a connection outside the pool: pooled connections are
/// recycled and would silently drop the subscription.
pub struct NotifyListener {
    // Dropping the client ends the session and stops the listener task.
    _client: tokio_postgres::Client,
    receiver: mpsc::UnboundedReceiver<String>,
}

impl NotifyListener {
    /// Opens a listening session on `channel`.
    pub async fn open(conninfo: &str, channel: &str) -> Result<Self, DbError> {
        let (client, mut connection) = tokio_postgres::connect(conninfo, NoTls).await?;
        let (tx, receiver) = mpsc::unbounded_channel();

        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        if tx.send(n.payload().to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "listen connection lost");
                        break;
                    }
                }
            }
            debug!(channel = %channel_name, "listener stopped");
        });

        client
            .batch_execute(&format!("LISTEN {}", quote_identifier(channel)))
            .await?;

        Ok(Self {
            _client: client,
            receiver,
        })
    }

    /// Waits for the next notification payload.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_quoting_escapes_quotes() {
        assert_eq!(quote_identifier("steep_repl_progress"), "\"steep_repl_progress\"");
        assert_eq!(quote_identifier("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn channels_are_distinct() {
        assert_ne!(PROGRESS_CHANNEL, WORK_CHANNEL);
    }
}
