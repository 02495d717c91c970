//! Send a Payjoin
//!
//! The sender hands an Original PSBT to a receiver, gets back a proposal that adds the
//! receiver's inputs and outputs, and only signs that proposal once it is certain the
//! receiver neither took money nor weakened the transaction.
//!
//! [`ProposalContext`] holds what is known about the Original and validates proposals.
//! [`PayjoinClient`] drives a whole session against a [`Wallet`] and a [`Requester`],
//! keeping a [`FallbackBroadcaster`] armed so the payment goes through even if the
//! payjoin does not.

use bitcoin::consensus::encode::serialize;
use bitcoin::{Amount, FeeRate, Psbt, SignedAmount, Transaction, Weight};
use tracing::{debug, trace};

pub use error::{BuildContextError, Error, ErrorKind, ProposalError};
use error::InternalBuildContextError;
pub use fallback::{FallbackBroadcaster, FallbackOutcome};
pub use session::{PayjoinClient, Requester, SessionState, Wallet};

use crate::fee::get_fee;
use crate::psbt::{is_finalized, InputPair, PsbtExt, SigningState};
use crate::sanity::check_input_sanity;
use crate::script_type::{inputs_script_pubkey_type, ScriptPubKeyType};

mod error;
mod fallback;
mod session;

type InternalResult<T> = Result<T, ProposalError>;

macro_rules! check_eq {
    ($proposed:expr, $original:expr, $error:ident) => {
        match ($proposed, $original) {
            (proposed, original) if proposed != original =>
                return Err(ProposalError::$error { proposed, original }),
            _ => (),
        }
    };
}

fn ensure<T>(condition: bool, error: T) -> Result<(), T> {
    if !condition {
        return Err(error);
    }
    Ok(())
}

/// Collects what validation needs to know about the Original beyond the PSBT itself.
#[derive(Debug, Clone)]
pub struct ProposalContextBuilder {
    original: Psbt,
    fee_rate: Option<FeeRate>,
    change_index: Option<usize>,
}

impl ProposalContextBuilder {
    pub fn new(original: Psbt) -> Self { Self { original, fee_rate: None, change_index: None } }

    /// Fee rate the sender pays for block space the receiver adds.
    ///
    /// Defaults to the fee rate of the Original.
    pub fn fee_rate(mut self, fee_rate: Option<FeeRate>) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// The only output allowed to shrink.
    ///
    /// Defaults to any output carrying the sender's key origins.
    pub fn change_index(mut self, change_index: Option<usize>) -> Self {
        self.change_index = change_index;
        self
    }

    /// `signed_original` is the fully signed Original, used to measure its weight.
    pub fn build(self, signed_original: &Transaction) -> Result<ProposalContext, BuildContextError> {
        let original =
            self.original.validate().map_err(InternalBuildContextError::InconsistentOriginal)?;
        let original_type = inputs_script_pubkey_type(&original)
            .map_err(InternalBuildContextError::Classification)?;
        if let Some(index) = self.change_index {
            let output_count = original.unsigned_tx.output.len();
            if index >= output_count {
                return Err(InternalBuildContextError::ChangeIndexOutOfBounds {
                    index,
                    output_count,
                }
                .into());
            }
        }
        let original_fee = original.fee().map_err(InternalBuildContextError::Fee)?;
        let fee_rate = self.fee_rate.unwrap_or_else(|| original_fee / signed_original.weight());
        // Classification succeeded, so there is at least one input.
        let sequence =
            original.unsigned_tx.input.first().map(|txin| txin.sequence).unwrap_or_default();
        debug!(%original_type, ?fee_rate, "built proposal context");
        Ok(ProposalContext {
            original,
            original_type,
            original_fee,
            fee_rate,
            change_index: self.change_index,
            sequence,
        })
    }
}

/// What the sender knows about the Original: everything a proposal is checked against.
#[derive(Debug, Clone)]
pub struct ProposalContext {
    original: Psbt,
    original_type: ScriptPubKeyType,
    original_fee: Amount,
    fee_rate: FeeRate,
    change_index: Option<usize>,
    sequence: bitcoin::Sequence,
}

impl ProposalContext {
    pub fn original(&self) -> &Psbt { &self.original }

    pub fn original_type(&self) -> ScriptPubKeyType { self.original_type }

    pub fn fee_rate(&self) -> FeeRate { self.fee_rate }

    /// Absolute fee the Original pays.
    pub fn original_fee(&self) -> Amount { self.original_fee }

    /// The Original as the receiver gets to see it.
    pub fn request_psbt(&self) -> Psbt {
        let mut psbt = self.original.clone();
        psbt.clear_unneeded_fields();
        psbt
    }

    /// Runs every structural check against `proposal`, failing on the first violation.
    ///
    /// On success the sender's metadata is restored into the proposal so the wallet can
    /// sign it. The fee contribution still has to be checked with
    /// [`CheckedProposal::check_fee_contribution`].
    pub fn process_proposal(&self, proposal: Psbt) -> Result<CheckedProposal, ProposalError> {
        let mut proposal = proposal.validate().map_err(ProposalError::InconsistentPsbt)?;
        self.check_sanity(&proposal)?;
        ensure(!proposal.contains_key_paths(), ProposalError::ContainsKeyPaths)?;
        self.basic_checks(&proposal)?;
        self.check_inputs(&proposal)?;
        let output_matches = self.check_outputs(&proposal)?;
        ensure(
            self.original_type.is_supported(),
            ProposalError::UnsupportedWalletFormat(self.original_type),
        )?;
        let additional_weight = self.additional_weight(&proposal, &output_matches)?;
        self.restore_original_utxos(&mut proposal);
        self.restore_original_outputs(&mut proposal, &output_matches);
        let proposed_fee = absolute_fee(&proposal)?;
        trace!(?additional_weight, %proposed_fee, "proposal passed structural checks");
        Ok(CheckedProposal {
            psbt: proposal,
            additional_weight,
            fee_rate: self.fee_rate,
            original_fee: self.original_fee,
            proposed_fee,
        })
    }

    fn check_sanity(&self, proposal: &Psbt) -> InternalResult<()> {
        for (index, pair) in proposal.input_pairs().enumerate() {
            let violations = check_input_sanity(pair.psbtin, pair.txin);
            ensure(violations.is_empty(), ProposalError::Insane { index, violations })?;
        }
        Ok(())
    }

    fn basic_checks(&self, proposal: &Psbt) -> InternalResult<()> {
        check_eq!(proposal.unsigned_tx.version, self.original.unsigned_tx.version, VersionChanged);
        check_eq!(
            proposal.unsigned_tx.lock_time,
            self.original.unsigned_tx.lock_time,
            LockTimeChanged
        );
        Ok(())
    }

    fn check_inputs(&self, proposal: &Psbt) -> InternalResult<()> {
        for original in self.original.input_pairs() {
            let outpoint = original.txin.previous_output;
            let proposed = proposal
                .input_pairs()
                .find(|proposed| proposed.txin.previous_output == outpoint)
                .ok_or(ProposalError::MissingOriginalInput(outpoint))?;
            ensure(
                proposed.txin.sequence == original.txin.sequence,
                ProposalError::OriginalInputSequenceChanged {
                    outpoint,
                    proposed: proposed.txin.sequence,
                    original: original.txin.sequence,
                },
            )?;
            ensure(
                SigningState::of(proposed.psbtin) == SigningState::of(original.psbtin),
                ProposalError::OriginalInputSigningStateChanged(outpoint),
            )?;
        }

        for proposed in self.receiver_inputs(proposal) {
            let outpoint = proposed.txin.previous_output;
            ensure(
                proposed.has_utxo_information(),
                ProposalError::ReceiverInputMissingUtxoInfo(outpoint),
            )?;
            let found = ScriptPubKeyType::of_input(&proposed)
                .map_err(|error| ProposalError::PrevTxOut { outpoint, error })?;
            ensure(
                found == self.original_type,
                ProposalError::ForeignInputType { outpoint, expected: self.original_type, found },
            )?;
            ensure(
                proposed.txin.sequence == self.sequence,
                ProposalError::MixedSequence {
                    outpoint,
                    expected: self.sequence,
                    found: proposed.txin.sequence,
                },
            )?;
            ensure(is_finalized(proposed.psbtin), ProposalError::ReceiverInputNotFinalized(outpoint))?;
        }
        Ok(())
    }

    /// Matches every original output to a proposal output with the same script pubkey.
    ///
    /// Returns the proposal index of each original output, in original order.
    fn check_outputs(&self, proposal: &Psbt) -> InternalResult<Vec<usize>> {
        let proposed_outputs = &proposal.unsigned_tx.output;
        let mut taken = vec![false; proposed_outputs.len()];
        let mut matches = Vec::with_capacity(self.original.unsigned_tx.output.len());
        for (index, original) in self.original.unsigned_tx.output.iter().enumerate() {
            let position = (0..proposed_outputs.len())
                .find(|&i| !taken[i] && proposed_outputs[i].script_pubkey == original.script_pubkey)
                .ok_or_else(|| ProposalError::MissingOriginalOutput(original.script_pubkey.clone()))?;
            taken[position] = true;
            let proposed = &proposed_outputs[position];
            if proposed.value < original.value {
                ensure(
                    self.is_change(index),
                    ProposalError::OutputValueDecreased {
                        index,
                        original: original.value,
                        proposed: proposed.value,
                    },
                )?;
            }
            matches.push(position);
        }
        Ok(matches)
    }

    /// An output is change if the sender owns it and, when a change index is set, it is that one.
    fn is_change(&self, index: usize) -> bool {
        let owned = self.original.outputs.get(index).is_some_and(|output| {
            !output.bip32_derivation.is_empty() || !output.tap_key_origins.is_empty()
        });
        owned && self.change_index.map_or(true, |change_index| change_index == index)
    }

    fn receiver_inputs<'a>(&'a self, proposal: &'a Psbt) -> impl Iterator<Item = InputPair<'a>> {
        proposal.input_pairs().filter(move |proposed| {
            !self
                .original
                .unsigned_tx
                .input
                .iter()
                .any(|original| original.previous_output == proposed.txin.previous_output)
        })
    }

    /// Weight the receiver's inputs and outputs add to the Original.
    fn additional_weight(&self, proposal: &Psbt, output_matches: &[usize]) -> InternalResult<Weight> {
        let input_weight = self.receiver_inputs(proposal).try_fold(Weight::ZERO, |acc, input| {
            input
                .expected_input_weight(self.original_type)
                .map(|weight| acc + weight)
                .ok_or(ProposalError::UnsupportedWalletFormat(self.original_type))
        })?;
        let output_weight = proposal
            .unsigned_tx
            .output
            .iter()
            .enumerate()
            .filter(|(index, _)| !output_matches.contains(index))
            .fold(Weight::ZERO, |acc, (_, txout)| {
                acc + Weight::from_non_witness_data_size(serialize(txout).len() as u64)
            });
        Ok(input_weight + output_weight)
    }

    /// Puts back what [`ProposalContext::request_psbt`] stripped, and whatever else the
    /// receiver dropped from the sender's inputs.
    fn restore_original_utxos(&self, proposal: &mut Psbt) {
        let proposal_inputs = proposal.unsigned_tx.input.iter().zip(&mut proposal.inputs);
        for (proposed_txin, proposed_psbtin) in proposal_inputs {
            let Some(original) = self
                .original
                .input_pairs()
                .find(|original| original.txin.previous_output == proposed_txin.previous_output)
            else {
                continue;
            };
            proposed_psbtin.non_witness_utxo = original.psbtin.non_witness_utxo.clone();
            proposed_psbtin.witness_utxo = original.psbtin.witness_utxo.clone();
            proposed_psbtin.bip32_derivation = original.psbtin.bip32_derivation.clone();
            proposed_psbtin.tap_internal_key = original.psbtin.tap_internal_key;
            proposed_psbtin.tap_key_origins = original.psbtin.tap_key_origins.clone();
            proposed_psbtin.redeem_script = original.psbtin.redeem_script.clone();
            proposed_psbtin.witness_script = original.psbtin.witness_script.clone();
            proposed_psbtin.sighash_type = original.psbtin.sighash_type;
        }
    }

    fn restore_original_outputs(&self, proposal: &mut Psbt, output_matches: &[usize]) {
        for (original_psbtout, &position) in self.original.outputs.iter().zip(output_matches) {
            if let Some(proposed_psbtout) = proposal.outputs.get_mut(position) {
                *proposed_psbtout = original_psbtout.clone();
            }
        }
    }
}

/// Sum of the previous outputs spent by `psbt` minus the sum of its outputs.
fn absolute_fee(psbt: &Psbt) -> InternalResult<Amount> {
    let input_total = psbt.input_pairs().try_fold(Amount::ZERO, |acc, pair| {
        let value = pair
            .previous_txout()
            .map_err(|error| ProposalError::PrevTxOut {
                outpoint: pair.txin.previous_output,
                error,
            })?
            .value;
        acc.checked_add(value).ok_or(ProposalError::FeeOverflow)
    })?;
    let output_total = psbt
        .unsigned_tx
        .output
        .iter()
        .try_fold(Amount::ZERO, |acc, txout| acc.checked_add(txout.value))
        .ok_or(ProposalError::FeeOverflow)?;
    input_total.checked_sub(output_total).ok_or(ProposalError::OutputsExceedInputs)
}

/// A proposal that passed every structural check.
#[derive(Debug, Clone)]
pub struct CheckedProposal {
    psbt: Psbt,
    additional_weight: Weight,
    fee_rate: FeeRate,
    original_fee: Amount,
    proposed_fee: Amount,
}

impl CheckedProposal {
    /// The proposal with the sender's metadata restored.
    pub fn psbt(&self) -> &Psbt { &self.psbt }

    pub fn additional_weight(&self) -> Weight { self.additional_weight }

    /// Absolute fee the proposal pays.
    pub fn proposed_fee(&self) -> Amount { self.proposed_fee }

    /// The most the sender's balance may drop to pay for the block space the receiver added.
    pub fn max_fee_contribution(&self) -> Option<Amount> {
        get_fee(self.fee_rate, self.additional_weight.to_vbytes_ceil())
    }

    /// Bounds the sender's loss by what the added block space costs.
    ///
    /// `original_delta` and `proposal_delta` are the sender's net balance change in
    /// the Original and in this proposal. The absolute fee may never drop, and whatever
    /// the sender loses has to end up in the fee, never in the receiver's outputs.
    pub fn check_fee_contribution(
        self,
        original_delta: SignedAmount,
        proposal_delta: SignedAmount,
    ) -> Result<Psbt, ProposalError> {
        let (original_fee, proposed_fee) = (self.original_fee, self.proposed_fee);
        ensure(
            original_fee <= proposed_fee,
            ProposalError::AbsoluteFeeDecreased { original: original_fee, proposed: proposed_fee },
        )?;
        let decrease = original_delta.to_sat().saturating_sub(proposal_delta.to_sat());
        if decrease <= 0 {
            return Ok(self.psbt);
        }
        let contributed = Amount::from_sat(decrease.unsigned_abs());
        let fee_increase = proposed_fee - original_fee;
        ensure(
            contributed <= fee_increase,
            ProposalError::PayeeTookContributedFee { contributed, fee_increase },
        )?;
        let max = self.max_fee_contribution().ok_or(ProposalError::FeeOverflow)?;
        ensure(contributed <= max, ProposalError::ExcessiveFeeContribution { contributed, max })?;
        debug!(%contributed, %max, "sender fee contribution accepted");
        Ok(self.psbt)
    }
}
