//! Value tokens carried through the pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};

// ── CompletionToken ──────────────────────────────────────────────

/// Identifies one scheduled unit of work: the output frame it belongs
/// to, a per-transmitter sequence id and when it was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken {
    pub frame_number: u32,
    pub sequence: u64,
    pub queued_at: Instant,
}

impl CompletionToken {
    pub fn new(frame_number: u32, sequence: u64) -> Self {
        Self {
            frame_number,
            sequence,
            queued_at: Instant::now(),
        }
    }

    /// Time since the work was queued.
    pub fn age(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

// ── SendToken ────────────────────────────────────────────────────

/// Serializes image payloads from concurrent senders onto one
/// destination. Hold the guard for exactly one image.
#[derive(Debug, Clone, Default)]
pub struct SendToken(Arc<Mutex<()>>);

pub type SendGuard = OwnedMutexGuard<()>;

impl SendToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> SendGuard {
        Arc::clone(&self.0).lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_token_is_exclusive() {
        let token = SendToken::new();
        let guard = token.acquire().await;
        let other = token.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[test]
    fn completion_token_ages() {
        let token = CompletionToken::new(3, 1);
        assert_eq!(token.frame_number, 3);
        assert!(token.age() < Duration::from_secs(5));
    }
}
