use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Transaction, Txid};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::Wallet;

/// How an armed fallback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// The signed Original was broadcast.
    Broadcast(Txid),
    /// The session completed first.
    Disarmed,
    /// The wallet failed to broadcast the signed Original.
    Failed(String),
}

/// Broadcasts the signed Original after a delay unless disarmed first.
///
/// This is the safety net that makes a payjoin attempt no worse than a regular payment:
/// whatever happens to the session, the receiver gets paid. Dropping the handle does not
/// cancel the broadcast.
#[derive(Debug)]
pub struct FallbackBroadcaster {
    txid: Txid,
    disarmed: watch::Sender<bool>,
    task: JoinHandle<FallbackOutcome>,
}

impl FallbackBroadcaster {
    /// Schedules `tx` for broadcast through `wallet` once `delay` has passed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<W>(wallet: Arc<W>, tx: Transaction, delay: Duration) -> Self
    where
        W: Wallet + ?Sized + 'static,
    {
        let txid = tx.compute_txid();
        let (disarmed, mut disarm_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = disarm_rx.changed() => {
                        if changed.is_err() {
                            // Every handle is gone, nobody can disarm anymore.
                            (&mut sleep).await;
                            break;
                        }
                        let is_disarmed = *disarm_rx.borrow();
                        if is_disarmed {
                            debug!(%txid, "fallback disarmed");
                            return FallbackOutcome::Disarmed;
                        }
                    }
                }
            }
            info!(%txid, "broadcasting the original transaction as a fallback");
            match wallet.broadcast_tx(&tx).await {
                Ok(broadcast) => FallbackOutcome::Broadcast(broadcast),
                Err(e) => {
                    warn!(%txid, "fallback broadcast failed: {e}");
                    FallbackOutcome::Failed(e.to_string())
                }
            }
        });
        debug!(%txid, ?delay, "fallback armed");
        Self { txid, disarmed, task }
    }

    /// Txid of the transaction this fallback broadcasts.
    pub fn txid(&self) -> Txid { self.txid }

    /// Cancels the broadcast if it hasn't happened yet.
    ///
    /// Disarming is permanent. Returns `true` if this call disarmed the fallback,
    /// `false` if it was already disarmed. A fallback that already fired stays fired.
    pub fn disarm(&self) -> bool {
        self.disarmed.send_if_modified(|disarmed| {
            if *disarmed {
                false
            } else {
                *disarmed = true;
                true
            }
        })
    }

    /// Whether the broadcast is still pending.
    pub fn is_armed(&self) -> bool { !*self.disarmed.borrow() && !self.task.is_finished() }

    /// Waits for the fallback to fire or to observe that it was disarmed.
    pub async fn join(self) -> FallbackOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => FallbackOutcome::Failed(e.to_string()),
        }
    }
}
