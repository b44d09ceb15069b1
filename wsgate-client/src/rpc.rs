//! RPC invocation: tag correlation, reconnect and retry.

use crate::connection::{WsClient, WsConfig};
use crate::error::ClientError;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use wsgate_protocol::{Envelope, Message, OpCode, WireFormat};

/// Characters a correlation tag is drawn from.
const TAG_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
/// Correlation tag length.
const TAG_LEN: usize = 7;

/// Reconnect and receive-retry budget for one call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Reconnect attempts on send failure, and receive attempts (each
    /// bounded by the per-operation timeout) before the call times out.
    pub attempts: u32,
    /// Delay between reconnect attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Callback receiving messages whose tag does not match the pending call
/// (server pushes, late replies).
pub type OobCallback = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Generates a random lowercase-alphanumeric correlation tag.
pub fn gen_tag() -> String {
    let mut rng = rand::thread_rng();
    (0..TAG_LEN)
        .map(|_| TAG_CHARS[rng.gen_range(0..TAG_CHARS.len())] as char)
        .collect()
}

/// An RPC client over a [`WsClient`].
pub struct RpcClient {
    client: WsClient,
    retry: RetryPolicy,
    replay: Option<Envelope>,
    oob: Option<OobCallback>,
}

impl RpcClient {
    pub fn new(config: WsConfig) -> Self {
        Self {
            client: WsClient::new(config),
            retry: RetryPolicy::default(),
            replay: None,
            oob: None,
        }
    }

    /// Sets the retry policy (builder style).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets a request to replay after every reconnect, before the failed
    /// call is retried. Typically an authentication request.
    pub fn set_replay(&mut self, request: Envelope) {
        self.replay = Some(request);
    }

    /// Sets the out-of-band callback for tag-mismatched messages.
    pub fn set_oob<F>(&mut self, f: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.oob = Some(Arc::new(f));
    }

    /// Connects to the server.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.client.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Closes the connection.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.client.disconnect().await
    }

    /// Returns the underlying connection.
    pub fn client_mut(&mut self) -> &mut WsClient {
        &mut self.client
    }

    /// Invokes a call: tags the request, sends it, and waits for the reply
    /// carrying the same tag.
    ///
    /// A send failure triggers reconnect attempts per the retry policy (the
    /// replay request, if set, is re-sent after each reconnect); if the
    /// request still cannot be sent, the call fails with
    /// `Dropped { sent: false }`. A connection loss while waiting for the
    /// reply fails with `Dropped { sent: true }`, since the server may have
    /// processed the request. Receive timeouts consume the per-call budget
    /// and then surface `Timeout`.
    pub async fn invoke(&mut self, mut request: Envelope) -> Result<Envelope, ClientError> {
        let tag = gen_tag();
        request.routing.insert("tag", tag.clone());

        self.send_with_reconnect(&request).await?;
        self.recv_reply(&tag).await
    }

    async fn send_with_reconnect(&mut self, request: &Envelope) -> Result<(), ClientError> {
        // `NotConnected` here means an earlier call observed the connection
        // dying; the reconnect loop below is the recovery for that too.
        match self.send_envelope(request).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() || matches!(e, ClientError::NotConnected) => {
                tracing::debug!("send failed ({}), attempting reconnect", e);
            }
            Err(e) => return Err(e),
        }

        for attempt in 1..=self.retry.attempts {
            tokio::time::sleep(self.retry.delay).await;
            tracing::debug!("reconnect attempt {}/{}", attempt, self.retry.attempts);

            if let Err(e) = self.client.connect().await {
                tracing::debug!("reconnect failed: {}", e);
                continue;
            }

            if let Some(replay) = self.replay.clone() {
                if let Err(e) = self.replay_request(replay).await {
                    tracing::debug!("replay after reconnect failed: {}", e);
                    continue;
                }
            }

            match self.send_envelope(request).await {
                Ok(()) => return Ok(()),
                Err(e) => tracing::debug!("retry send failed: {}", e),
            }
        }

        Err(ClientError::Dropped { sent: false })
    }

    /// Sends the replay request and consumes its reply so it cannot be
    /// mistaken for the pending call's.
    async fn replay_request(&mut self, mut replay: Envelope) -> Result<(), ClientError> {
        let tag = gen_tag();
        replay.routing.insert("tag", tag.clone());
        self.send_envelope(&replay).await?;
        let _ = self.recv_reply(&tag).await?;
        Ok(())
    }

    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        let data = envelope.encode()?;
        let opcode = match envelope.format {
            WireFormat::Binary => OpCode::Binary,
            WireFormat::Json => OpCode::Text,
        };
        self.client.send_msg(Message { opcode, data }).await
    }

    async fn recv_reply(&mut self, tag: &str) -> Result<Envelope, ClientError> {
        let mut budget = self.retry.attempts.max(1);

        loop {
            let message = match self.client.recv_msg().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    // recv_msg returns None on timeout and after a peer
                    // close; a close leaves the connection non-Connected.
                    if !self.client.is_connected() {
                        return Err(ClientError::Dropped { sent: true });
                    }
                    budget -= 1;
                    if budget == 0 {
                        return Err(ClientError::Timeout);
                    }
                    continue;
                }
                Err(ClientError::Disconnected) => {
                    return Err(ClientError::Dropped { sent: true });
                }
                Err(e) => return Err(e),
            };

            let envelope = match Envelope::decode(&message.data) {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!("undecodable reply skipped: {}", e);
                    continue;
                }
            };

            if envelope.routing.get("tag") == Some(tag) {
                return Ok(envelope);
            }

            tracing::debug!(
                "tag mismatch (want {}, got {:?}), routing out of band",
                tag,
                envelope.routing.get("tag")
            );
            if let Some(ref oob) = self.oob {
                oob(envelope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_tag_shape() {
        for _ in 0..100 {
            let tag = gen_tag();
            assert_eq!(tag.len(), TAG_LEN);
            assert!(tag
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_gen_tag_varies() {
        let a = gen_tag();
        let b = gen_tag();
        let c = gen_tag();
        assert!(a != b || b != c);
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }
}
