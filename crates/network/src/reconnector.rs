use quorum_backoff::BackoffPolicy;
use quorum_types::{QuorumPeerAddress, Result};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::connection::Connection;
use crate::factory::ClientConnector;

/// Keeps dialing one peer until a connection is authenticated.
///
/// Transport failures are retried after the wait chosen by the backoff policy.
/// Handshake and configuration failures end the loop at once; retrying them
/// cannot succeed.
///
/// A link that is established and then lost is a failure too: callers report
/// it through [`PeerReconnector::link_lost`], which waits before the next dial.
/// While links keep dropping without carrying data the policy is not reset, so
/// the waits keep growing.
pub struct PeerReconnector {
    connector: ClientConnector,
    peer: QuorumPeerAddress,
    policy: Box<dyn BackoffPolicy>,
    max_attempts: Option<u32>,
    flapping: bool,
}

impl PeerReconnector {
    pub fn new(
        connector: ClientConnector,
        peer: QuorumPeerAddress,
        policy: Box<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            connector,
            peer,
            policy,
            max_attempts: None,
            flapping: false,
        }
    }

    /// Give up after `attempts` connection attempts (at least one is made).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn peer(&self) -> &QuorumPeerAddress {
        &self.peer
    }

    pub async fn connect(&mut self) -> Result<Connection> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);

            match self.connector.connect(&self.peer).outcome().await {
                Ok(connection) => {
                    if !self.flapping {
                        self.policy.reset();
                    }
                    info!("Connected to {} after {} attempt(s)", self.peer, attempt);
                    return Ok(connection);
                }
                Err(e) if !e.is_retryable() => {
                    error!("Giving up on {} ({}): {}", self.peer, e.kind(), e);
                    return Err(e);
                }
                Err(e) => {
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!(
                            "Giving up on {} after {} attempt(s): {}",
                            self.peer, attempt, e
                        );
                        return Err(e);
                    }

                    let wait = self.policy.next_wait();
                    warn!(
                        "Connection to {} failed (attempt {}): {}; retrying in {:?}",
                        self.peer, attempt, e, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Record that the last connection returned by [`connect`](Self::connect)
    /// was lost, and wait before redialing. Returns the wait.
    pub async fn link_lost(&mut self, carried_data: bool) -> Duration {
        if carried_data {
            self.policy.reset();
        }
        self.flapping = !carried_data;

        let wait = self.policy.next_wait();
        info!(
            "Link to {} lost{}; redialing in {:?}",
            self.peer,
            if carried_data { "" } else { " before carrying data" },
            wait
        );
        tokio::time::sleep(wait).await;
        wait
    }
}

impl std::fmt::Debug for PeerReconnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerReconnector")
            .field("peer", &self.peer)
            .field("max_attempts", &self.max_attempts)
            .field("flapping", &self.flapping)
            .finish_non_exhaustive()
    }
}
