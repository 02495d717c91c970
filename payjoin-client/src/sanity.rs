//! Structural checks on PSBT inputs.
//!
//! Every check runs and every violation is collected, so a caller can report all of
//! them at once instead of fixing one problem per round trip.

use std::fmt;

use bitcoin::{psbt, Psbt, ScriptBuf, TxIn};

use crate::psbt::is_finalized;

/// A single structural problem with a PSBT input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SanityViolation {
    FinalizedWithPartialSigs,
    FinalizedWithKeyPaths,
    FinalizedWithSighashType,
    FinalizedWithRedeemScript,
    FinalizedWithWitnessScript,
    BothUtxoKinds,
    WitnessScriptWithoutWitnessUtxo,
    FinalWitnessWithoutWitnessUtxo,
    NonWitnessUtxoTxidMismatch,
    NonWitnessUtxoIndexOutOfBounds,
    RedeemScriptMismatchNonWitnessUtxo,
    RedeemScriptMismatchWitnessUtxo,
    WitnessScriptMismatchRedeemScript,
}

impl SanityViolation {
    pub const fn as_str(&self) -> &'static str {
        use SanityViolation::*;

        match self {
            FinalizedWithPartialSigs => "Input finalized, but partial sigs are not empty",
            FinalizedWithKeyPaths => "Input finalized, but hd keypaths are not empty",
            FinalizedWithSighashType => "Input finalized, but sighash type is not empty",
            FinalizedWithRedeemScript => "Input finalized, but redeem script is not empty",
            FinalizedWithWitnessScript => "Input finalized, but witness script is not empty",
            BothUtxoKinds => "witness utxo and non witness utxo simultaneously present",
            WitnessScriptWithoutWitnessUtxo => "witness script present but no witness utxo",
            FinalWitnessWithoutWitnessUtxo => "final witness script present but no witness utxo",
            NonWitnessUtxoTxidMismatch =>
                "non_witness_utxo does not match the transaction id referenced by the global transaction sign",
            NonWitnessUtxoIndexOutOfBounds =>
                "Global transaction referencing an out of bound output in non_witness_utxo",
            RedeemScriptMismatchNonWitnessUtxo =>
                "The redeem_script is not coherent with the scriptPubKey of the non_witness_utxo",
            RedeemScriptMismatchWitnessUtxo =>
                "The redeem_script is not coherent with the scriptPubKey of the witness_utxo",
            WitnessScriptMismatchRedeemScript =>
                "witnessScript with witness UTXO does not match the redeemScript",
        }
    }
}

impl fmt::Display for SanityViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Checks a PSBT input against the unsigned transaction input it describes.
pub fn check_input_sanity(input: &psbt::Input, txin: &TxIn) -> Vec<SanityViolation> {
    use SanityViolation::*;

    let mut violations = Vec::new();
    if is_finalized(input) {
        if !input.partial_sigs.is_empty() {
            violations.push(FinalizedWithPartialSigs);
        }
        if !input.bip32_derivation.is_empty() {
            violations.push(FinalizedWithKeyPaths);
        }
        if input.sighash_type.is_some() {
            violations.push(FinalizedWithSighashType);
        }
        if input.redeem_script.is_some() {
            violations.push(FinalizedWithRedeemScript);
        }
        if input.witness_script.is_some() {
            violations.push(FinalizedWithWitnessScript);
        }
    }
    if input.witness_utxo.is_some() && input.non_witness_utxo.is_some() {
        violations.push(BothUtxoKinds);
    }
    if input.witness_script.is_some() && input.witness_utxo.is_none() {
        violations.push(WitnessScriptWithoutWitnessUtxo);
    }
    if input.final_script_witness.is_some() && input.witness_utxo.is_none() {
        violations.push(FinalWitnessWithoutWitnessUtxo);
    }

    if let Some(ref prev_tx) = input.non_witness_utxo {
        let outpoint = txin.previous_output;
        let txid_matches = prev_tx.compute_txid() == outpoint.txid;
        if !txid_matches {
            violations.push(NonWitnessUtxoTxidMismatch);
        }
        let prev_txout = usize::try_from(outpoint.vout).ok().and_then(|vout| prev_tx.output.get(vout));
        if prev_txout.is_none() {
            violations.push(NonWitnessUtxoIndexOutOfBounds);
        }
        // Only meaningful once the outpoint is known to be valid.
        if let (Some(redeem_script), Some(prev_txout), true) =
            (&input.redeem_script, prev_txout, txid_matches)
        {
            if p2sh_of(redeem_script) != prev_txout.script_pubkey {
                violations.push(RedeemScriptMismatchNonWitnessUtxo);
            }
        }
    }

    if let (Some(witness_utxo), Some(redeem_script)) = (&input.witness_utxo, &input.redeem_script) {
        if p2sh_of(redeem_script) != witness_utxo.script_pubkey {
            violations.push(RedeemScriptMismatchWitnessUtxo);
        }
        if let Some(ref witness_script) = input.witness_script {
            if *redeem_script != ScriptBuf::new_p2wsh(&witness_script.wscript_hash()) {
                violations.push(WitnessScriptMismatchRedeemScript);
            }
        }
    }
    violations
}

fn p2sh_of(redeem_script: &ScriptBuf) -> ScriptBuf {
    ScriptBuf::new_p2sh(&redeem_script.script_hash())
}

/// Per-input sanity violations of a whole template, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanityReport {
    inputs: Vec<Vec<SanityViolation>>,
}

impl SanityReport {
    pub fn of(psbt: &Psbt) -> Self { Self { inputs: check_sanity(psbt) } }

    pub fn is_sane(&self) -> bool { self.inputs.iter().all(Vec::is_empty) }

    /// Violations of the input at `index`, empty when it is sane or doesn't exist.
    pub fn input(&self, index: usize) -> &[SanityViolation] {
        self.inputs.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    /// Indices and violations of the inputs that failed at least one check.
    pub fn insane_inputs(&self) -> impl Iterator<Item = (usize, &[SanityViolation])> + '_ {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, violations)| !violations.is_empty())
            .map(|(index, violations)| (index, violations.as_slice()))
    }
}

impl fmt::Display for SanityReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (n, (index, violations)) in self.insane_inputs().enumerate() {
            if n > 0 {
                write!(f, "; ")?;
            }
            write!(f, "input #{index}: ")?;
            for (i, violation) in violations.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{violation}")?;
            }
        }
        Ok(())
    }
}

/// Sanity violations of every input of `psbt`, one list per input.
pub fn check_sanity(psbt: &Psbt) -> Vec<Vec<SanityViolation>> {
    psbt.unsigned_tx
        .input
        .iter()
        .zip(&psbt.inputs)
        .map(|(txin, input)| check_input_sanity(input, txin))
        .collect()
}

#[cfg(test)]
mod test {
    use bitcoin::bip32::{DerivationPath, Fingerprint};
    use bitcoin::sighash::EcdsaSighashType;
    use bitcoin::{Amount, ScriptBuf, TxOut, Witness};
    use payjoin_test_utils::{
        input, original_psbt_of, sign_input, BoxError, ScriptKind, PARSED_ORIGINAL_PSBT,
        RECEIVER_KEY, SENDER_KEY,
    };

    use super::SanityViolation::*;
    use super::*;

    #[test]
    fn fixtures_are_sane() {
        for kind in [ScriptKind::P2wpkh, ScriptKind::NestedP2wpkh, ScriptKind::P2pkh] {
            assert!(SanityReport::of(&original_psbt_of(kind)).is_sane(), "{kind:?}");
        }
    }

    #[test]
    fn signed_input_is_sane() -> Result<(), BoxError> {
        let mut psbt = original_psbt_of(ScriptKind::NestedP2wpkh);
        sign_input(&mut psbt, 0, &SENDER_KEY).map_err(|e| e.to_string())?;
        assert_eq!(check_sanity(&psbt), vec![vec![]]);
        Ok(())
    }

    #[test]
    fn finalized_input_reports_every_leftover_field() {
        let (txin, mut psbtin) = input(&SENDER_KEY, ScriptKind::NestedP2wpkh, Amount::ONE_BTC, true);
        psbtin.final_script_witness = Some(Witness::from_slice(&[vec![1u8; 72], vec![2u8; 33]]));
        psbtin.sighash_type = Some(EcdsaSighashType::All.into());
        psbtin.witness_script = Some(SENDER_KEY.p2wpkh());

        let violations = check_input_sanity(&psbtin, &txin);
        assert!(violations.contains(&FinalizedWithKeyPaths));
        assert!(violations.contains(&FinalizedWithSighashType));
        assert!(violations.contains(&FinalizedWithRedeemScript));
        assert!(violations.contains(&FinalizedWithWitnessScript));
        assert!(!violations.contains(&FinalizedWithPartialSigs));
        assert!(violations.contains(&WitnessScriptMismatchRedeemScript));
    }

    #[test]
    fn utxo_field_combinations() {
        let (txin, mut psbtin) = input(&SENDER_KEY, ScriptKind::P2pkh, Amount::ONE_BTC, false);
        psbtin.witness_utxo =
            Some(TxOut { value: Amount::ONE_BTC, script_pubkey: SENDER_KEY.p2pkh() });
        assert_eq!(check_input_sanity(&psbtin, &txin), vec![BothUtxoKinds]);

        let (txin, mut psbtin) = input(&SENDER_KEY, ScriptKind::P2pkh, Amount::ONE_BTC, false);
        psbtin.witness_script = Some(ScriptBuf::new());
        psbtin.final_script_witness = Some(Witness::new());
        let violations = check_input_sanity(&psbtin, &txin);
        assert!(violations.contains(&WitnessScriptWithoutWitnessUtxo));
        assert!(violations.contains(&FinalWitnessWithoutWitnessUtxo));
    }

    #[test]
    fn non_witness_utxo_outpoint_checks() {
        let (mut txin, mut psbtin) =
            input(&SENDER_KEY, ScriptKind::P2pkh, Amount::ONE_BTC, false);
        txin.previous_output.vout = 3;
        // Would mismatch too, but the outpoint is invalid so coherence is not evaluated.
        psbtin.redeem_script = Some(RECEIVER_KEY.p2wpkh());
        assert_eq!(check_input_sanity(&psbtin, &txin), vec![NonWitnessUtxoIndexOutOfBounds]);

        let (mut txin, psbtin) = input(&SENDER_KEY, ScriptKind::P2pkh, Amount::ONE_BTC, false);
        let (other, _) = input(&RECEIVER_KEY, ScriptKind::P2pkh, Amount::ONE_BTC, false);
        txin.previous_output.txid = other.previous_output.txid;
        txin.previous_output.vout = 1;
        assert_eq!(
            check_input_sanity(&psbtin, &txin),
            vec![NonWitnessUtxoTxidMismatch, NonWitnessUtxoIndexOutOfBounds]
        );
    }

    #[test]
    fn redeem_script_coherence() {
        let (txin, mut psbtin) = input(&SENDER_KEY, ScriptKind::P2pkh, Amount::ONE_BTC, false);
        psbtin.redeem_script = Some(SENDER_KEY.p2wpkh());
        assert_eq!(check_input_sanity(&psbtin, &txin), vec![RedeemScriptMismatchNonWitnessUtxo]);

        let (txin, mut psbtin) =
            input(&SENDER_KEY, ScriptKind::NestedP2wpkh, Amount::ONE_BTC, false);
        psbtin.redeem_script = Some(RECEIVER_KEY.p2wpkh());
        assert_eq!(check_input_sanity(&psbtin, &txin), vec![RedeemScriptMismatchWitnessUtxo]);
    }

    #[test]
    fn report_lists_only_insane_inputs() {
        let mut psbt = PARSED_ORIGINAL_PSBT.clone();
        psbt.inputs[0].final_script_witness = Some(Witness::new());
        psbt.inputs[0]
            .bip32_derivation
            .insert(RECEIVER_KEY.public.0, (Fingerprint::default(), DerivationPath::default()));

        let report = SanityReport::of(&psbt);
        assert!(!report.is_sane());
        assert_eq!(report.input(0), &[FinalizedWithKeyPaths]);
        assert_eq!(report.insane_inputs().count(), 1);
        assert_eq!(
            report.to_string(),
            "input #0: Input finalized, but hd keypaths are not empty"
        );
    }
}
