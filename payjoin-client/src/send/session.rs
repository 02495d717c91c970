use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Psbt, SignedAmount, Transaction, Txid};
use tracing::{debug, info, warn};

use super::error::{Error, InternalError};
use super::fallback::FallbackBroadcaster;
use super::ProposalContextBuilder;
use crate::config::Config;
use crate::error::ImplementationError;
use crate::psbt::{is_finalized, PsbtExt};
use crate::sanity::SanityReport;
use crate::script_type::inputs_script_pubkey_type;

/// The sender's wallet.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// The Original: the payment as the wallet would make it without payjoin.
    ///
    /// Inputs and outputs belonging to the wallet carry their key origins.
    async fn get_original(&self) -> Result<Psbt, ImplementationError>;

    /// Signs and finalizes every input the wallet owns.
    ///
    /// Inputs that are already finalized must be left untouched.
    async fn sign(&self, psbt: Psbt) -> Result<Psbt, ImplementationError>;

    async fn broadcast_tx(&self, tx: &Transaction) -> Result<Txid, ImplementationError>;

    /// Called once the signed Original is armed as a fallback, e.g. to persist it.
    ///
    /// The fallback fires in-process regardless of what this does.
    async fn schedule_broadcast(
        &self,
        _tx: &Transaction,
        _delay: Duration,
    ) -> Result<(), ImplementationError> {
        Ok(())
    }

    /// Value the wallet receives in `psbt` minus the value it spends.
    ///
    /// By default inputs and outputs carrying key origins count as the wallet's own.
    async fn owned_net_delta(&self, psbt: &Psbt) -> Result<SignedAmount, ImplementationError> {
        Ok(crate::psbt::owned_net_delta(psbt)?)
    }
}

/// Delivers the Original to the receiver and returns its proposal.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request_proposal(&self, original: &Psbt) -> Result<Psbt, ImplementationError>;
}

/// Phase of a payjoin session.
///
/// Each state names the step under way, so an [`Error`] carries the step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Obtaining the Original and checking its structure and input types.
    Built,
    /// Signing the Original and scheduling it for broadcast.
    Armed,
    /// Waiting on the requester for a proposal.
    ProposalRequested,
    /// Checking the proposal against the Original.
    Validated,
    /// Signing and finalizing the proposal.
    Signed,
    /// Broadcasting the payjoin transaction.
    Broadcast,
    /// The session ended without a payjoin. The fallback, if armed, stays armed.
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Built => write!(f, "building the original"),
            SessionState::Armed => write!(f, "arming the fallback"),
            SessionState::ProposalRequested => write!(f, "requesting a proposal"),
            SessionState::Validated => write!(f, "validating the proposal"),
            SessionState::Signed => write!(f, "signing the proposal"),
            SessionState::Broadcast => write!(f, "broadcasting the payjoin"),
            SessionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Bookkeeping for one run: the phase under way and what it armed.
struct Session {
    state: SessionState,
    fallback: Option<FallbackBroadcaster>,
}

impl Session {
    fn new() -> Self {
        debug!(state = %SessionState::Built, "payjoin session started");
        Self { state: SessionState::Built, fallback: None }
    }

    fn advance(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "payjoin session transition");
        self.state = next;
    }

    fn abort(&mut self, internal: InternalError) -> Error {
        warn!(
            state = %self.state,
            fallback_armed = self.fallback.is_some(),
            "payjoin session aborted: {internal:?}"
        );
        let failed_at = std::mem::replace(&mut self.state, SessionState::Aborted);
        Error { internal, state: failed_at, fallback: self.fallback.take() }
    }
}

/// Negotiates a payjoin on behalf of the sender.
///
/// The payment is never put at risk: as soon as the Original is signed it is scheduled
/// for broadcast, and only a successfully broadcast payjoin cancels that.
pub struct PayjoinClient<W: ?Sized, R> {
    wallet: Arc<W>,
    requester: R,
    config: Config,
}

impl<W, R> PayjoinClient<W, R>
where
    W: Wallet + ?Sized + 'static,
    R: Requester,
{
    pub fn new(wallet: Arc<W>, requester: R) -> Self {
        Self { wallet, requester, config: Config::default() }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Runs one session to completion, returning the txid of the broadcast payjoin.
    pub async fn run(&self) -> Result<Txid, Error> {
        let mut session = Session::new();

        let original = self
            .wallet
            .get_original()
            .await
            .map_err(|e| session.abort(InternalError::Wallet(e)))?
            .validate()
            .map_err(|e| session.abort(InternalError::InconsistentOriginal(e)))?;
        let sanity = SanityReport::of(&original);
        if !sanity.is_sane() {
            return Err(session.abort(InternalError::InsaneOriginal(sanity)));
        }
        let original_type = inputs_script_pubkey_type(&original)
            .map_err(|e| session.abort(InternalError::Classification(e)))?;
        if !original_type.is_supported() {
            return Err(session.abort(InternalError::UnsupportedWalletFormat(original_type)));
        }

        session.advance(SessionState::Armed);

        let signed_original = self
            .wallet
            .sign(original.clone())
            .await
            .map_err(|e| session.abort(InternalError::Wallet(e)))?;
        let fallback_tx = extract_signed(signed_original).map_err(|e| session.abort(e))?;
        let ctx = ProposalContextBuilder::new(original)
            .fee_rate(self.config.fee_rate())
            .change_index(self.config.additional_fee_output_index)
            .build(&fallback_tx)
            .map_err(|e| session.abort(InternalError::Context(e)))?;
        let delay = self.config.fallback_delay;
        if let Err(e) = self.wallet.schedule_broadcast(&fallback_tx, delay).await {
            warn!("wallet failed to schedule the fallback broadcast: {e}");
        }
        session.fallback = Some(FallbackBroadcaster::arm(self.wallet.clone(), fallback_tx, delay));

        session.advance(SessionState::ProposalRequested);
        let request = ctx.request_psbt();
        let proposal = self
            .requester
            .request_proposal(&request)
            .await
            .map_err(|e| session.abort(InternalError::Transport(e)))?;

        session.advance(SessionState::Validated);
        let checked = ctx
            .process_proposal(proposal)
            .map_err(|e| session.abort(InternalError::Proposal(e)))?;
        let original_delta = self
            .wallet
            .owned_net_delta(ctx.original())
            .await
            .map_err(|e| session.abort(InternalError::Wallet(e)))?;
        let proposal_delta = self
            .wallet
            .owned_net_delta(checked.psbt())
            .await
            .map_err(|e| session.abort(InternalError::Wallet(e)))?;
        let proposal = checked
            .check_fee_contribution(original_delta, proposal_delta)
            .map_err(|e| session.abort(InternalError::Proposal(e)))?;

        session.advance(SessionState::Signed);
        let signed_proposal = self
            .wallet
            .sign(proposal)
            .await
            .map_err(|e| session.abort(InternalError::Wallet(e)))?;
        let payjoin_tx = extract_signed(signed_proposal).map_err(|e| session.abort(e))?;

        session.advance(SessionState::Broadcast);
        let txid = self
            .wallet
            .broadcast_tx(&payjoin_tx)
            .await
            .map_err(|e| session.abort(InternalError::Broadcast(e)))?;
        if let Some(fallback) = session.fallback.take() {
            fallback.disarm();
        }
        info!(%txid, "payjoin broadcast");
        Ok(txid)
    }
}

fn extract_signed(psbt: Psbt) -> Result<Transaction, InternalError> {
    let unsigned_inputs: Vec<usize> = psbt
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| !is_finalized(input))
        .map(|(index, _)| index)
        .collect();
    if !unsigned_inputs.is_empty() {
        return Err(InternalError::NotFullySigned { unsigned_inputs });
    }
    psbt.extract_tx().map_err(InternalError::ExtractTx)
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use bitcoin::Amount;
    use payjoin_test_utils::{
        build_psbt, foreign_output, input, init_tracing, receiver_proposal, sign_owned_inputs,
        ScriptKind, PARSED_ORIGINAL_PSBT, PAYEE_KEY, SENDER_KEY,
    };

    use super::*;
    use crate::send::{ErrorKind, FallbackOutcome};

    struct KeyWallet {
        original: Psbt,
        broadcasts: Mutex<Vec<Txid>>,
    }

    impl KeyWallet {
        fn new(original: Psbt) -> Arc<Self> {
            Arc::new(Self { original, broadcasts: Mutex::new(Vec::new()) })
        }

        fn broadcasts(&self) -> Vec<Txid> { self.broadcasts.lock().expect("lock").clone() }
    }

    #[async_trait]
    impl Wallet for KeyWallet {
        async fn get_original(&self) -> Result<Psbt, ImplementationError> {
            Ok(self.original.clone())
        }

        async fn sign(&self, mut psbt: Psbt) -> Result<Psbt, ImplementationError> {
            sign_owned_inputs(&mut psbt, &[*SENDER_KEY])?;
            Ok(psbt)
        }

        async fn broadcast_tx(&self, tx: &Transaction) -> Result<Txid, ImplementationError> {
            let txid = tx.compute_txid();
            self.broadcasts.lock().expect("lock").push(txid);
            Ok(txid)
        }
    }

    struct Cooperative(Amount);

    #[async_trait]
    impl Requester for Cooperative {
        async fn request_proposal(&self, original: &Psbt) -> Result<Psbt, ImplementationError> {
            receiver_proposal(original, self.0)
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Requester for Unreachable {
        async fn request_proposal(&self, _: &Psbt) -> Result<Psbt, ImplementationError> {
            Err("connection refused".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_payjoin_disarms_the_fallback() -> Result<(), Box<dyn std::error::Error>> {
        init_tracing();
        let wallet = KeyWallet::new(PARSED_ORIGINAL_PSBT.clone());
        let client = PayjoinClient::new(wallet.clone(), Cooperative(Amount::from_sat(49_900)));

        let txid = client.run().await?;
        assert_eq!(wallet.broadcasts(), vec![txid]);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(wallet.broadcasts(), vec![txid]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_keeps_the_fallback() {
        let wallet = KeyWallet::new(PARSED_ORIGINAL_PSBT.clone());
        let client = PayjoinClient::new(wallet.clone(), Unreachable);

        let error = client.run().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Transport);
        assert_eq!(error.state(), SessionState::ProposalRequested);
        let fallback = error.into_fallback().expect("fallback armed");
        let txid = fallback.txid();
        assert_eq!(fallback.join().await, FallbackOutcome::Broadcast(txid));
        assert_eq!(wallet.broadcasts(), vec![txid]);
    }

    #[tokio::test]
    async fn mixed_original_aborts_before_arming() {
        let original = build_psbt(
            vec![
                input(&SENDER_KEY, ScriptKind::P2pkh, Amount::from_sat(60_000), true),
                input(&SENDER_KEY, ScriptKind::P2wpkh, Amount::from_sat(40_000), true),
            ],
            vec![foreign_output(PAYEE_KEY.p2wpkh(), Amount::from_sat(99_000))],
        );
        let wallet = KeyWallet::new(original);
        let error = PayjoinClient::new(wallet.clone(), Unreachable).run().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Classification);
        assert_eq!(error.state(), SessionState::Built);
        assert!(error.fallback().is_none());
        assert!(error.to_string().ends_with("Inputs must all be the same type"));
    }

    #[tokio::test]
    async fn insane_original_aborts_before_arming() {
        let mut original = PARSED_ORIGINAL_PSBT.clone();
        original.inputs[0].witness_script = Some(SENDER_KEY.p2wpkh());
        original.inputs[0].witness_utxo = None;
        original.inputs[0].non_witness_utxo = None;
        let wallet = KeyWallet::new(original);
        let error = PayjoinClient::new(wallet, Unreachable).run().await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Structural);
        assert!(error.fallback().is_none());
        let report = error.sanity_report().expect("sanity report");
        assert_eq!(
            report.input(0),
            &[crate::sanity::SanityViolation::WitnessScriptWithoutWitnessUtxo]
        );
    }
}
