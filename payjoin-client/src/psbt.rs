//! Utilities to make work with PSBTs easier

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::psbt::Psbt;
use bitcoin::transaction::InputWeightPrediction;
use bitcoin::{ecdsa, psbt, ScriptBuf, SignedAmount, TxIn, TxOut, Weight, Witness};

use crate::script_type::ScriptPubKeyType;

/// Shared non-witness weight for txid (32), index (4), and sequence (4) fields.
/// rust-bitcoin already accounts for the script_sig length in [`InputWeightPrediction`].
pub(crate) const NON_WITNESS_INPUT_WEIGHT: Weight = Weight::from_non_witness_data_size(32 + 4 + 4);

// input script: 0x160014{20-byte-key-hash} = 23 bytes
// witness: <signature> <pubkey> = 72, 33 bytes
// https://github.com/bitcoin/bips/blob/master/bip-0141.mediawiki#p2wpkh-nested-in-bip16-p2sh
const NESTED_P2WPKH_MAX: InputWeightPrediction = InputWeightPrediction::from_slice(23, &[72, 33]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InconsistentPsbt {
    UnequalInputCounts { tx_ins: usize, psbt_ins: usize },
    UnequalOutputCounts { tx_outs: usize, psbt_outs: usize },
}

impl fmt::Display for InconsistentPsbt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InconsistentPsbt::UnequalInputCounts { tx_ins, psbt_ins, } => write!(f, "The number of PSBT inputs ({psbt_ins}) doesn't equal to the number of unsigned transaction inputs ({tx_ins})"),
            InconsistentPsbt::UnequalOutputCounts { tx_outs, psbt_outs, } => write!(f, "The number of PSBT outputs ({psbt_outs}) doesn't equal to the number of unsigned transaction outputs ({tx_outs})"),
        }
    }
}

impl std::error::Error for InconsistentPsbt {}

pub(crate) trait PsbtExt: Sized {
    fn input_pairs(&self) -> Box<dyn Iterator<Item = InputPair<'_>> + '_>;
    /// guarantees that length of psbt input matches that of unsigned_tx inputs and same
    /// thing for outputs.
    fn validate(self) -> Result<Self, InconsistentPsbt>;
    /// Strips what the counterparty doesn't need to build a proposal: global xpubs,
    /// key origins, and proprietary or unknown records.
    fn clear_unneeded_fields(&mut self);
    fn contains_key_paths(&self) -> bool;
}

impl PsbtExt for Psbt {
    fn input_pairs(&self) -> Box<dyn Iterator<Item = InputPair<'_>> + '_> {
        Box::new(
            self.unsigned_tx
                .input
                .iter()
                .zip(&self.inputs)
                .map(|(txin, psbtin)| InputPair { txin, psbtin }),
        )
    }

    fn validate(self) -> Result<Self, InconsistentPsbt> {
        let tx_ins = self.unsigned_tx.input.len();
        let psbt_ins = self.inputs.len();
        let tx_outs = self.unsigned_tx.output.len();
        let psbt_outs = self.outputs.len();

        if psbt_ins != tx_ins {
            Err(InconsistentPsbt::UnequalInputCounts { tx_ins, psbt_ins })
        } else if psbt_outs != tx_outs {
            Err(InconsistentPsbt::UnequalOutputCounts { tx_outs, psbt_outs })
        } else {
            Ok(self)
        }
    }

    fn clear_unneeded_fields(&mut self) {
        self.xpub.clear();
        self.proprietary.clear();
        self.unknown.clear();
        for input in &mut self.inputs {
            input.bip32_derivation.clear();
            input.tap_key_origins.clear();
            input.tap_internal_key = None;
            input.proprietary.clear();
            input.unknown.clear();
        }
        for output in &mut self.outputs {
            output.bip32_derivation.clear();
            output.tap_key_origins.clear();
            output.tap_internal_key = None;
            output.proprietary.clear();
            output.unknown.clear();
        }
    }

    fn contains_key_paths(&self) -> bool {
        !self.xpub.is_empty()
            || self
                .inputs
                .iter()
                .any(|i| !i.bip32_derivation.is_empty() || !i.tap_key_origins.is_empty())
            || self
                .outputs
                .iter()
                .any(|o| !o.bip32_derivation.is_empty() || !o.tap_key_origins.is_empty())
    }
}

/// An unsigned transaction input together with its PSBT record.
#[derive(Clone, Debug)]
pub(crate) struct InputPair<'a> {
    pub txin: &'a TxIn,
    pub psbtin: &'a psbt::Input,
}

impl InputPair<'_> {
    /// Returns the [`TxOut`] associated with the input.
    pub fn previous_txout(&self) -> Result<&TxOut, PrevTxOutError> {
        match (&self.psbtin.non_witness_utxo, &self.psbtin.witness_utxo) {
            (None, None) => Err(PrevTxOutError::MissingUtxoInformation),
            (_, Some(txout)) => Ok(txout),
            (Some(tx), None) => {
                let index = self.txin.previous_output.vout;
                usize::try_from(index)
                    .ok()
                    .and_then(|vout| tx.output.get(vout))
                    .ok_or(PrevTxOutError::IndexOutOfBounds { output_count: tx.output.len(), index })
            }
        }
    }

    pub fn has_utxo_information(&self) -> bool {
        self.psbtin.witness_utxo.is_some() || self.psbtin.non_witness_utxo.is_some()
    }

    /// Worst-case weight of an input spending `script_type`.
    ///
    /// Never measured from the input's own script_sig or witness, which whoever
    /// finalized it is free to pad.
    pub fn expected_input_weight(&self, script_type: ScriptPubKeyType) -> Option<Weight> {
        let iwp = match script_type {
            ScriptPubKeyType::Segwit => InputWeightPrediction::P2WPKH_MAX,
            ScriptPubKeyType::SegwitP2SH => NESTED_P2WPKH_MAX,
            ScriptPubKeyType::Legacy => InputWeightPrediction::P2PKH_COMPRESSED_MAX,
            ScriptPubKeyType::Unsupported => return None,
        };
        Some(iwp.weight() + NON_WITNESS_INPUT_WEIGHT)
    }
}

/// How far along signing a PSBT input is.
///
/// Two inputs with equal signing states carry exactly the same signature data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningState<'a> {
    Unsigned,
    PartiallySigned(&'a BTreeMap<bitcoin::PublicKey, ecdsa::Signature>),
    Finalized { script_sig: Option<&'a ScriptBuf>, witness: Option<&'a Witness> },
}

impl<'a> SigningState<'a> {
    pub fn of(input: &'a psbt::Input) -> Self {
        if is_finalized(input) {
            SigningState::Finalized {
                script_sig: input.final_script_sig.as_ref(),
                witness: input.final_script_witness.as_ref(),
            }
        } else if !input.partial_sigs.is_empty() {
            SigningState::PartiallySigned(&input.partial_sigs)
        } else {
            SigningState::Unsigned
        }
    }
}

/// True iff the input carries a final script_sig or a final witness.
pub fn is_finalized(input: &psbt::Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Value returned to the wallet minus value spent by it.
///
/// Inputs and outputs count as the wallet's own when they carry key origin metadata.
pub(crate) fn owned_net_delta(psbt: &Psbt) -> Result<SignedAmount, PrevTxOutError> {
    let spent = psbt
        .input_pairs()
        .filter(|pair| is_owned(&pair.psbtin.bip32_derivation, &pair.psbtin.tap_key_origins))
        .try_fold(0u64, |acc, pair| {
            pair.previous_txout().map(|txout| acc.saturating_add(txout.value.to_sat()))
        })?;
    let received = psbt
        .unsigned_tx
        .output
        .iter()
        .zip(&psbt.outputs)
        .filter(|(_, psbtout)| is_owned(&psbtout.bip32_derivation, &psbtout.tap_key_origins))
        .fold(0u64, |acc, (txout, _)| acc.saturating_add(txout.value.to_sat()));
    Ok(SignedAmount::from_sat(saturating_i64(received) - saturating_i64(spent)))
}

fn is_owned<K, V, T, U>(bip32: &BTreeMap<K, V>, tap: &BTreeMap<T, U>) -> bool {
    !bip32.is_empty() || !tap.is_empty()
}

fn saturating_i64(sats: u64) -> i64 { i64::try_from(sats).unwrap_or(i64::MAX) }

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrevTxOutError {
    MissingUtxoInformation,
    IndexOutOfBounds { output_count: usize, index: u32 },
}

impl fmt::Display for PrevTxOutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PrevTxOutError::MissingUtxoInformation => write!(f, "missing UTXO information"),
            PrevTxOutError::IndexOutOfBounds { output_count, index } => {
                write!(f, "index {index} out of bounds (number of outputs: {output_count})")
            }
        }
    }
}

impl std::error::Error for PrevTxOutError {}

#[cfg(test)]
mod test {
    use bitcoin::{Amount, Psbt, ScriptBuf, SignedAmount, Witness};
    use payjoin_test_utils::{
        add_receiver_input, input, original_psbt_of, sign_input, BoxError, ScriptKind,
        PARSED_ORIGINAL_PSBT, RECEIVER_INPUT_VALUE, RECEIVER_KEY, SENDER_KEY,
    };

    use super::*;

    #[test]
    fn validate_rejects_inconsistent_counts() {
        let mut psbt: Psbt = PARSED_ORIGINAL_PSBT.clone();
        psbt.outputs.pop();
        assert_eq!(
            psbt.validate().unwrap_err(),
            InconsistentPsbt::UnequalOutputCounts { tx_outs: 2, psbt_outs: 1 }
        );
    }

    #[test]
    fn previous_txout_from_non_witness_utxo() {
        let (mut txin, psbtin) = input(&SENDER_KEY, ScriptKind::P2pkh, Amount::ONE_BTC, true);
        let pair = InputPair { txin: &txin, psbtin: &psbtin };
        assert_eq!(pair.previous_txout().map(|txout| txout.value), Ok(Amount::ONE_BTC));

        txin.previous_output.vout = 7;
        let pair = InputPair { txin: &txin, psbtin: &psbtin };
        assert_eq!(
            pair.previous_txout().unwrap_err(),
            PrevTxOutError::IndexOutOfBounds { output_count: 1, index: 7 }
        );
    }

    #[test]
    fn signing_state_tracks_signature_data() -> Result<(), BoxError> {
        let mut psbt = PARSED_ORIGINAL_PSBT.clone();
        assert_eq!(SigningState::of(&psbt.inputs[0]), SigningState::Unsigned);
        assert!(!is_finalized(&psbt.inputs[0]));

        sign_input(&mut psbt, 0, &SENDER_KEY).map_err(|e| e.to_string())?;
        assert!(is_finalized(&psbt.inputs[0]));
        assert!(matches!(
            SigningState::of(&psbt.inputs[0]),
            SigningState::Finalized { script_sig: None, witness: Some(_) }
        ));

        let mut tampered = psbt.inputs[0].clone();
        tampered.final_script_witness = Some(Witness::from_slice(&[vec![0u8; 72], vec![2u8; 33]]));
        assert_ne!(SigningState::of(&tampered), SigningState::of(&psbt.inputs[0]));

        let mut script_sig_only = psbt.inputs[0].clone();
        script_sig_only.final_script_witness = None;
        script_sig_only.final_script_sig = Some(ScriptBuf::new());
        assert!(is_finalized(&script_sig_only));
        Ok(())
    }

    #[test]
    fn padded_witness_does_not_change_expected_weight() -> Result<(), BoxError> {
        let mut psbt = PARSED_ORIGINAL_PSBT.clone();
        let index = add_receiver_input(&mut psbt, ScriptKind::P2wpkh, RECEIVER_INPUT_VALUE);
        let expected = |psbt: &Psbt| {
            psbt.input_pairs()
                .nth(index)
                .and_then(|pair| pair.expected_input_weight(ScriptPubKeyType::Segwit))
        };
        let unsigned = expected(&psbt).ok_or("no weight")?;
        assert_eq!(unsigned, InputWeightPrediction::P2WPKH_MAX.weight() + NON_WITNESS_INPUT_WEIGHT);

        sign_input(&mut psbt, index, &RECEIVER_KEY).map_err(|e| e.to_string())?;
        let mut witness = psbt.inputs[index].final_script_witness.clone().ok_or("unsigned")?;
        witness.push(vec![0u8; 40_000]);
        psbt.inputs[index].final_script_witness = Some(witness);
        assert_eq!(expected(&psbt), Some(unsigned));
        Ok(())
    }

    #[test]
    fn unsupported_inputs_have_no_weight_prediction() {
        let psbt = original_psbt_of(ScriptKind::P2wpkh);
        let pair = psbt.input_pairs().next().expect("one input");
        assert_eq!(pair.expected_input_weight(ScriptPubKeyType::Unsupported), None);
    }

    #[test]
    fn owned_net_delta_counts_key_origins() -> Result<(), BoxError> {
        let psbt = PARSED_ORIGINAL_PSBT.clone();
        // 50_000 change back minus the 100_000 input.
        assert_eq!(owned_net_delta(&psbt)?, SignedAmount::from_sat(-50_000));

        let mut stripped = psbt.clone();
        stripped.clear_unneeded_fields();
        assert!(!stripped.contains_key_paths());
        assert_eq!(owned_net_delta(&stripped)?, SignedAmount::ZERO);
        Ok(())
    }
}
