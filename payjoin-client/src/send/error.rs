use std::fmt;

use bitcoin::locktime::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence};

use super::fallback::FallbackBroadcaster;
use super::session::SessionState;
use crate::error::ImplementationError;
use crate::psbt::{InconsistentPsbt, PrevTxOutError};
use crate::sanity::{SanityReport, SanityViolation};
use crate::script_type::{ScriptPubKeyType, ScriptTypeError};

/// Error building a [`ProposalContext`](super::ProposalContext) from the Original.
///
/// This error is unrecoverable.
#[derive(Debug)]
pub struct BuildContextError(pub(crate) InternalBuildContextError);

#[derive(Debug)]
pub(crate) enum InternalBuildContextError {
    InconsistentOriginal(InconsistentPsbt),
    Classification(ScriptTypeError),
    Fee(bitcoin::psbt::Error),
    ChangeIndexOutOfBounds { index: usize, output_count: usize },
}

impl From<InternalBuildContextError> for BuildContextError {
    fn from(value: InternalBuildContextError) -> Self { BuildContextError(value) }
}

impl fmt::Display for BuildContextError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalBuildContextError::*;

        match &self.0 {
            InconsistentOriginal(e) => write!(f, "the original transaction is inconsistent: {e}"),
            Classification(e) => write!(f, "can not classify the original inputs: {e}"),
            Fee(e) => write!(f, "can not compute the original fee: {e}"),
            ChangeIndexOutOfBounds { index, output_count } => write!(
                f,
                "change output index {index} is out of bounds (number of outputs: {output_count})"
            ),
        }
    }
}

impl std::error::Error for BuildContextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalBuildContextError::*;

        match &self.0 {
            InconsistentOriginal(error) => Some(error),
            Classification(error) => Some(error),
            Fee(error) => Some(error),
            ChangeIndexOutOfBounds { .. } => None,
        }
    }
}

/// Why a receiver's proposal was rejected.
///
/// Every variant is a protocol violation by the receiver except
/// [`ProposalError::UnsupportedWalletFormat`], which is about the Original itself.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProposalError {
    InconsistentPsbt(InconsistentPsbt),
    Insane { index: usize, violations: Vec<SanityViolation> },
    ContainsKeyPaths,
    VersionChanged { proposed: Version, original: Version },
    LockTimeChanged { proposed: LockTime, original: LockTime },
    MissingOriginalInput(OutPoint),
    OriginalInputSequenceChanged { outpoint: OutPoint, proposed: Sequence, original: Sequence },
    OriginalInputSigningStateChanged(OutPoint),
    ReceiverInputMissingUtxoInfo(OutPoint),
    PrevTxOut { outpoint: OutPoint, error: PrevTxOutError },
    ForeignInputType { outpoint: OutPoint, expected: ScriptPubKeyType, found: ScriptPubKeyType },
    MixedSequence { outpoint: OutPoint, expected: Sequence, found: Sequence },
    ReceiverInputNotFinalized(OutPoint),
    MissingOriginalOutput(ScriptBuf),
    OutputValueDecreased { index: usize, original: Amount, proposed: Amount },
    UnsupportedWalletFormat(ScriptPubKeyType),
    OutputsExceedInputs,
    AbsoluteFeeDecreased { original: Amount, proposed: Amount },
    PayeeTookContributedFee { contributed: Amount, fee_increase: Amount },
    ExcessiveFeeContribution { contributed: Amount, max: Amount },
    FeeOverflow,
}

impl fmt::Display for ProposalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ProposalError::*;

        match self {
            InconsistentPsbt(e) => write!(f, "the proposed PSBT is inconsistent: {e}"),
            Insane { index, violations } => {
                write!(f, "proposed input #{index} is malformed:")?;
                for violation in violations {
                    write!(f, " {violation};")?;
                }
                Ok(())
            }
            ContainsKeyPaths => write!(f, "proposal contains key derivation paths"),
            VersionChanged { proposed, original } => write!(
                f,
                "proposed transaction version {proposed} doesn't match the original {original}"
            ),
            LockTimeChanged { proposed, original } => write!(
                f,
                "proposed transaction lock time {proposed} doesn't match the original {original}"
            ),
            MissingOriginalInput(outpoint) => write!(f, "original input {outpoint} is missing from the proposal"),
            OriginalInputSequenceChanged { outpoint, proposed, original } => write!(
                f,
                "sequence of original input {outpoint} changed from {original} to {proposed}"
            ),
            OriginalInputSigningStateChanged(outpoint) =>
                write!(f, "signatures of original input {outpoint} were altered"),
            ReceiverInputMissingUtxoInfo(outpoint) =>
                write!(f, "receiver input {outpoint} is missing UTXO information"),
            PrevTxOut { outpoint, error } =>
                write!(f, "receiver input {outpoint} has an invalid previous output: {error}"),
            ForeignInputType { outpoint, expected, found } => write!(
                f,
                "receiver input {outpoint} spends a {found} output but the original spends {expected}"
            ),
            MixedSequence { outpoint, expected, found } => write!(
                f,
                "receiver input {outpoint} uses sequence {found}, the original uses {expected}"
            ),
            ReceiverInputNotFinalized(outpoint) =>
                write!(f, "receiver input {outpoint} is not finalized"),
            MissingOriginalOutput(script) =>
                write!(f, "original output paying to {script} is missing from the proposal"),
            OutputValueDecreased { index, original, proposed } => write!(
                f,
                "value of original output #{index} decreased from {original} to {proposed}"
            ),
            UnsupportedWalletFormat(found) =>
                write!(f, "payjoin is not supported for {found} inputs"),
            OutputsExceedInputs => write!(f, "proposal spends more than its inputs provide"),
            AbsoluteFeeDecreased { original, proposed } =>
                write!(f, "absolute fee decreased from {original} to {proposed}"),
            PayeeTookContributedFee { contributed, fee_increase } => write!(
                f,
                "sender contributes {contributed} but the fee only grew by {fee_increase}"
            ),
            ExcessiveFeeContribution { contributed, max } => write!(
                f,
                "sender contributes {contributed} but at most {max} pays for the added block space"
            ),
            FeeOverflow => write!(f, "fee contribution overflowed"),
        }
    }
}

impl std::error::Error for ProposalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProposalError::InconsistentPsbt(error) => Some(error),
            ProposalError::PrevTxOut { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Coarse classification of a session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The Original is malformed.
    Structural,
    /// The Original mixes input types, lacks utxo information or uses an unsupported format.
    Classification,
    /// The receiver's proposal broke a payjoin rule.
    ProtocolViolation,
    /// The proposal could not be obtained or the final transaction could not be broadcast.
    Transport,
    /// The wallet failed to provide, sign or account for a transaction.
    Wallet,
}

/// A payjoin session that ended without broadcasting a payjoin transaction.
///
/// If the session got far enough to arm the fallback, the signed Original is still
/// scheduled for broadcast and the handle is available through [`Error::fallback`].
#[derive(Debug)]
pub struct Error {
    pub(crate) internal: InternalError,
    pub(crate) state: SessionState,
    pub(crate) fallback: Option<FallbackBroadcaster>,
}

#[derive(Debug)]
pub(crate) enum InternalError {
    InconsistentOriginal(InconsistentPsbt),
    InsaneOriginal(SanityReport),
    Classification(ScriptTypeError),
    UnsupportedWalletFormat(ScriptPubKeyType),
    Context(BuildContextError),
    Wallet(ImplementationError),
    NotFullySigned { unsigned_inputs: Vec<usize> },
    ExtractTx(bitcoin::psbt::ExtractTxError),
    Transport(ImplementationError),
    Proposal(ProposalError),
    Broadcast(ImplementationError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use InternalError::*;

        match &self.internal {
            InconsistentOriginal(_) | InsaneOriginal(_) => ErrorKind::Structural,
            Classification(_) | UnsupportedWalletFormat(_) => ErrorKind::Classification,
            Context(BuildContextError(InternalBuildContextError::Classification(_))) =>
                ErrorKind::Classification,
            Context(_) => ErrorKind::Structural,
            Wallet(_) | NotFullySigned { .. } | ExtractTx(_) => ErrorKind::Wallet,
            Transport(_) | Broadcast(_) => ErrorKind::Transport,
            Proposal(ProposalError::UnsupportedWalletFormat(_)) => ErrorKind::Classification,
            Proposal(_) => ErrorKind::ProtocolViolation,
        }
    }

    /// The state the session was in when it aborted.
    pub fn state(&self) -> SessionState { self.state }

    /// The rejected proposal's violation, if that is why the session aborted.
    pub fn proposal_error(&self) -> Option<&ProposalError> {
        match &self.internal {
            InternalError::Proposal(e) => Some(e),
            _ => None,
        }
    }

    /// Sanity violations of the Original, if that is why the session aborted.
    pub fn sanity_report(&self) -> Option<&SanityReport> {
        match &self.internal {
            InternalError::InsaneOriginal(report) => Some(report),
            _ => None,
        }
    }

    /// The armed fallback, `None` if the session aborted before arming it.
    pub fn fallback(&self) -> Option<&FallbackBroadcaster> { self.fallback.as_ref() }

    pub fn into_fallback(self) -> Option<FallbackBroadcaster> { self.fallback }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use InternalError::*;

        write!(f, "payjoin aborted while {}: ", self.state)?;
        match &self.internal {
            InconsistentOriginal(e) => write!(f, "the original transaction is inconsistent: {e}"),
            InsaneOriginal(report) => write!(f, "the original transaction is malformed: {report}"),
            Classification(e) => write!(f, "{e}"),
            UnsupportedWalletFormat(found) => write!(f, "payjoin is not supported for {found} inputs"),
            Context(e) => write!(f, "{e}"),
            Wallet(e) => write!(f, "wallet error: {e}"),
            NotFullySigned { unsigned_inputs } =>
                write!(f, "wallet left inputs {unsigned_inputs:?} unsigned"),
            ExtractTx(e) => write!(f, "can not extract the signed transaction: {e}"),
            Transport(e) => write!(f, "failed to obtain a proposal: {e}"),
            Proposal(e) => write!(f, "proposal rejected: {e}"),
            Broadcast(e) => write!(f, "failed to broadcast the payjoin transaction: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use InternalError::*;

        match &self.internal {
            InconsistentOriginal(error) => Some(error),
            InsaneOriginal(_) => None,
            Classification(error) => Some(error),
            UnsupportedWalletFormat(_) => None,
            Context(error) => Some(error),
            Wallet(error) => Some(error.as_ref()),
            NotFullySigned { .. } => None,
            ExtractTx(error) => Some(error),
            Transport(error) => Some(error.as_ref()),
            Proposal(error) => Some(error),
            Broadcast(error) => Some(error.as_ref()),
        }
    }
}
