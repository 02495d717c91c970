//! # Payjoin sender in Rust
//!
//! The sending half of [BIP 78 Payjoin](https://github.com/bitcoin/bips/blob/master/bip-0078.mediawiki):
//! classify and sanity check the Original PSBT, validate the receiver's proposal against it,
//! and drive a whole negotiation while a fallback broadcast of the Original stays armed.
//!
//! The crate does no networking of its own. The wallet and the transport to the receiver are
//! supplied by the caller through the [`Wallet`] and [`Requester`] traits.
//!
//! ## Disclaimer ⚠️ WIP
//!
//! **Use at your own risk. This crate has not yet been reviewed by independent Rust and Bitcoin security professionals.**

pub extern crate bitcoin;

pub mod config;
pub mod sanity;
pub mod script_type;
pub mod send;

mod error;
mod fee;
pub(crate) mod psbt;

pub use crate::config::Config;
pub use crate::error::ImplementationError;
pub use crate::fee::get_fee;
pub use crate::psbt::{is_finalized, InconsistentPsbt, PrevTxOutError, SigningState};
pub use crate::sanity::{check_input_sanity, check_sanity, SanityReport, SanityViolation};
pub use crate::script_type::{
    inputs_script_pubkey_type, ScriptPubKeyType, ScriptTypeError, SUPPORTED_WALLET_FORMATS,
};
pub use crate::send::{
    BuildContextError, CheckedProposal, Error, ErrorKind, FallbackBroadcaster, FallbackOutcome,
    PayjoinClient, ProposalContext, ProposalContextBuilder, ProposalError, Requester,
    SessionState, Wallet,
};
