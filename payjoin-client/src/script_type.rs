//! Classification of the script pubkeys a transaction spends.

use std::fmt;

use bitcoin::{Psbt, Script};

use crate::psbt::{InputPair, PrevTxOutError, PsbtExt};

/// The kind of output an input spends, as far as payjoin is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptPubKeyType {
    /// Anything not listed below: bare scripts, P2WSH, taproot, non-P2WPKH P2SH.
    Unsupported,
    /// P2PKH.
    Legacy,
    /// Native P2WPKH.
    Segwit,
    /// P2WPKH nested in P2SH.
    SegwitP2SH,
}

/// Wallet formats a payjoin can be negotiated for.
pub const SUPPORTED_WALLET_FORMATS: [ScriptPubKeyType; 2] =
    [ScriptPubKeyType::Segwit, ScriptPubKeyType::SegwitP2SH];

impl ScriptPubKeyType {
    pub fn is_supported(self) -> bool { SUPPORTED_WALLET_FORMATS.contains(&self) }

    pub(crate) fn of_input(pair: &InputPair) -> Result<Self, PrevTxOutError> {
        let script_pubkey = &pair.previous_txout()?.script_pubkey;
        if script_pubkey.is_p2wpkh() {
            Ok(Self::Segwit)
        } else if script_pubkey.is_p2sh() {
            // The redeem script is a PSBT field until finalization, then the last push of script_sig.
            let redeem_script: Option<&Script> = match pair.psbtin.redeem_script {
                Some(ref script) => Some(script),
                None => pair.psbtin.final_script_sig.as_ref().and_then(|sig| sig.redeem_script()),
            };
            match redeem_script {
                Some(script) if script.is_p2wpkh() => Ok(Self::SegwitP2SH),
                _ => Ok(Self::Unsupported),
            }
        } else if script_pubkey.is_p2pkh() {
            Ok(Self::Legacy)
        } else {
            Ok(Self::Unsupported)
        }
    }
}

impl fmt::Display for ScriptPubKeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "unsupported"),
            Self::Legacy => write!(f, "p2pkh"),
            Self::Segwit => write!(f, "p2wpkh"),
            Self::SegwitP2SH => write!(f, "p2sh-p2wpkh"),
        }
    }
}

/// The single script pubkey type shared by every input of `psbt`.
pub fn inputs_script_pubkey_type(psbt: &Psbt) -> Result<ScriptPubKeyType, ScriptTypeError> {
    classify_inputs(psbt.input_pairs())
}

pub(crate) fn classify_inputs<'a>(
    inputs: impl Iterator<Item = InputPair<'a>>,
) -> Result<ScriptPubKeyType, ScriptTypeError> {
    let inputs: Vec<InputPair<'a>> = inputs.collect();
    if inputs.is_empty() {
        return Err(ScriptTypeError::NoInputs);
    }
    if let Some(index) = inputs.iter().position(|pair| !pair.has_utxo_information()) {
        return Err(ScriptTypeError::IncompleteUtxoInfo { index });
    }

    let mut found: Option<ScriptPubKeyType> = None;
    for (index, pair) in inputs.iter().enumerate() {
        let input_type = ScriptPubKeyType::of_input(pair)
            .map_err(|error| ScriptTypeError::PrevTxOut { index, error })?;
        match found {
            None => found = Some(input_type),
            Some(first) if first != input_type =>
                return Err(ScriptTypeError::MixedInputTypes { first, other: input_type, index }),
            Some(_) => (),
        }
    }
    found.ok_or(ScriptTypeError::NoInputs)
}

/// Inputs of a template could not be reduced to a single script pubkey type.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScriptTypeError {
    NoInputs,
    IncompleteUtxoInfo { index: usize },
    MixedInputTypes { first: ScriptPubKeyType, other: ScriptPubKeyType, index: usize },
    PrevTxOut { index: usize, error: PrevTxOutError },
}

impl fmt::Display for ScriptTypeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoInputs => write!(f, "The psbt has no inputs"),
            Self::IncompleteUtxoInfo { .. } =>
                write!(f, "The psbt should be able to be finalized with utxo information"),
            Self::MixedInputTypes { .. } => write!(f, "Inputs must all be the same type"),
            Self::PrevTxOut { index, error } =>
                write!(f, "Input #{index} points to an invalid previous output: {error}"),
        }
    }
}

impl std::error::Error for ScriptTypeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PrevTxOut { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use bitcoin::{Amount, ScriptBuf, TxOut};
    use payjoin_test_utils::{
        add_receiver_input, build_psbt, foreign_output, input, original_psbt_of, sign_input,
        BoxError, ScriptKind, PAYEE_KEY, RECEIVER_INPUT_VALUE, RECEIVER_KEY, SENDER_KEY,
    };

    use super::*;

    fn single_input_type(kind: ScriptKind) -> Result<ScriptPubKeyType, ScriptTypeError> {
        inputs_script_pubkey_type(&original_psbt_of(kind))
    }

    #[test]
    fn classifies_each_kind() {
        assert_eq!(single_input_type(ScriptKind::P2wpkh), Ok(ScriptPubKeyType::Segwit));
        assert_eq!(single_input_type(ScriptKind::NestedP2wpkh), Ok(ScriptPubKeyType::SegwitP2SH));
        assert_eq!(single_input_type(ScriptKind::P2pkh), Ok(ScriptPubKeyType::Legacy));
    }

    #[test]
    fn supported_formats() {
        assert!(ScriptPubKeyType::Segwit.is_supported());
        assert!(ScriptPubKeyType::SegwitP2SH.is_supported());
        assert!(!ScriptPubKeyType::Legacy.is_supported());
        assert!(!ScriptPubKeyType::Unsupported.is_supported());
    }

    #[test]
    fn nested_redeem_script_read_from_final_script_sig() -> Result<(), BoxError> {
        let mut psbt = original_psbt_of(ScriptKind::P2wpkh);
        let index = add_receiver_input(&mut psbt, ScriptKind::NestedP2wpkh, RECEIVER_INPUT_VALUE);
        sign_input(&mut psbt, index, &RECEIVER_KEY).map_err(|e| e.to_string())?;
        assert_eq!(psbt.inputs[index].redeem_script, None);

        let pair = psbt.input_pairs().nth(index).ok_or("missing input")?;
        assert_eq!(ScriptPubKeyType::of_input(&pair)?, ScriptPubKeyType::SegwitP2SH);
        Ok(())
    }

    #[test]
    fn p2sh_without_p2wpkh_redeem_script_is_unsupported() -> Result<(), BoxError> {
        let mut psbt = original_psbt_of(ScriptKind::NestedP2wpkh);
        psbt.inputs[0].redeem_script = None;
        assert_eq!(inputs_script_pubkey_type(&psbt)?, ScriptPubKeyType::Unsupported);

        psbt.inputs[0].redeem_script = Some(ScriptBuf::from_bytes(vec![0x51]));
        assert_eq!(inputs_script_pubkey_type(&psbt)?, ScriptPubKeyType::Unsupported);
        Ok(())
    }

    #[test]
    fn unknown_scripts_are_unsupported() -> Result<(), BoxError> {
        let mut psbt = original_psbt_of(ScriptKind::P2wpkh);
        // OP_RETURN <deadbeef>
        let script_pubkey = ScriptBuf::from_bytes(vec![0x6a, 0x04, 0xde, 0xad, 0xbe, 0xef]);
        psbt.inputs[0].witness_utxo = Some(TxOut { value: Amount::ONE_BTC, script_pubkey });
        assert_eq!(inputs_script_pubkey_type(&psbt)?, ScriptPubKeyType::Unsupported);
        Ok(())
    }

    #[test]
    fn mixed_inputs_are_rejected() {
        let psbt = build_psbt(
            vec![
                input(&SENDER_KEY, ScriptKind::P2pkh, Amount::from_sat(60_000), true),
                input(&SENDER_KEY, ScriptKind::P2wpkh, Amount::from_sat(40_000), true),
            ],
            vec![foreign_output(PAYEE_KEY.p2wpkh(), Amount::from_sat(99_000))],
        );
        let error = inputs_script_pubkey_type(&psbt).unwrap_err();
        assert_eq!(
            error,
            ScriptTypeError::MixedInputTypes {
                first: ScriptPubKeyType::Legacy,
                other: ScriptPubKeyType::Segwit,
                index: 1,
            }
        );
        assert_eq!(error.to_string(), "Inputs must all be the same type");
    }

    #[test]
    fn missing_utxo_information_is_reported_before_mixing() {
        let mut psbt = build_psbt(
            vec![
                input(&SENDER_KEY, ScriptKind::P2pkh, Amount::from_sat(60_000), true),
                input(&SENDER_KEY, ScriptKind::P2wpkh, Amount::from_sat(40_000), true),
            ],
            vec![foreign_output(PAYEE_KEY.p2wpkh(), Amount::from_sat(99_000))],
        );
        psbt.inputs[1].witness_utxo = None;
        let error = inputs_script_pubkey_type(&psbt).unwrap_err();
        assert_eq!(error, ScriptTypeError::IncompleteUtxoInfo { index: 1 });
        assert_eq!(
            error.to_string(),
            "The psbt should be able to be finalized with utxo information"
        );
    }

    #[test]
    fn no_inputs() {
        let psbt = build_psbt(vec![], vec![foreign_output(PAYEE_KEY.p2wpkh(), Amount::ONE_SAT)]);
        assert_eq!(inputs_script_pubkey_type(&psbt), Err(ScriptTypeError::NoInputs));
    }
}
