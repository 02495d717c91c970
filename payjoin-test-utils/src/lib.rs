use std::result::Result;
use std::str::FromStr;

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::hashes::Hash;
use bitcoin::psbt::{Input, Output, Psbt};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{self, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness,
};
use once_cell::sync::{Lazy, OnceCell};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub type BoxError = Box<dyn std::error::Error + 'static>;
pub type BoxSendSyncError = Box<dyn std::error::Error + Send + Sync>;

static INIT_TRACING: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    INIT_TRACING.get_or_init(|| {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global default subscriber");
    });
}

/// Sequence used by every fixture input. Signals RBF, no relative lock time.
pub const SEQUENCE: Sequence = Sequence::ENABLE_RBF_NO_LOCKTIME;

pub const ORIGINAL_INPUT_VALUE: Amount = Amount::from_sat(100_000);
pub const PAYMENT_VALUE: Amount = Amount::from_sat(49_500);
pub const CHANGE_VALUE: Amount = Amount::from_sat(50_000);
pub const RECEIVER_INPUT_VALUE: Amount = Amount::from_sat(80_000);

/// Index of the payee output in [`original_psbt`].
pub const PAYEE_INDEX: usize = 0;
/// Index of the sender's change output in [`original_psbt`].
pub const CHANGE_INDEX: usize = 1;

/// How a fixture input is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2wpkh,
    NestedP2wpkh,
    P2pkh,
}

/// A deterministic single key with a fake BIP32 origin.
#[derive(Debug, Clone, Copy)]
pub struct TestKey {
    pub secret: SecretKey,
    pub public: CompressedPublicKey,
    pub fingerprint: Fingerprint,
    child: u32,
}

impl TestKey {
    pub fn new(seed: u8) -> Self {
        let secp = Secp256k1::signing_only();
        let secret = SecretKey::from_slice(&[seed; 32]).expect("seed produces a valid secret key");
        let public = CompressedPublicKey(secp256k1::PublicKey::from_secret_key(&secp, &secret));
        Self { secret, public, fingerprint: Fingerprint::from([seed; 4]), child: u32::from(seed) }
    }

    pub fn p2wpkh(&self) -> ScriptBuf { ScriptBuf::new_p2wpkh(&self.public.wpubkey_hash()) }

    pub fn p2sh_p2wpkh(&self) -> ScriptBuf { ScriptBuf::new_p2sh(&self.p2wpkh().script_hash()) }

    pub fn p2pkh(&self) -> ScriptBuf { ScriptBuf::new_p2pkh(&self.public.pubkey_hash()) }

    pub fn script_pubkey(&self, kind: ScriptKind) -> ScriptBuf {
        match kind {
            ScriptKind::P2wpkh => self.p2wpkh(),
            ScriptKind::NestedP2wpkh => self.p2sh_p2wpkh(),
            ScriptKind::P2pkh => self.p2pkh(),
        }
    }

    pub fn key_source(&self) -> (Fingerprint, DerivationPath) {
        let path = DerivationPath::from_str(&format!("m/84'/1'/0'/0/{}", self.child))
            .expect("static derivation path is valid");
        (self.fingerprint, path)
    }
}

pub static SENDER_KEY: Lazy<TestKey> = Lazy::new(|| TestKey::new(1));
pub static SENDER_CHANGE_KEY: Lazy<TestKey> = Lazy::new(|| TestKey::new(2));
pub static RECEIVER_KEY: Lazy<TestKey> = Lazy::new(|| TestKey::new(3));
pub static PAYEE_KEY: Lazy<TestKey> = Lazy::new(|| TestKey::new(4));

/// The single-output transaction a fixture input spends from. `nonce` keeps txids distinct.
pub fn funding_tx(script_pubkey: ScriptBuf, value: Amount, nonce: u32) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            sequence: Sequence(nonce),
            ..Default::default()
        }],
        output: vec![TxOut { value, script_pubkey }],
    }
}

/// An unsigned input spending `value` locked to `key`.
///
/// Owned inputs carry BIP32 derivation metadata, which is how the sender's wallet
/// recognizes its own coins.
pub fn input(key: &TestKey, kind: ScriptKind, value: Amount, owned: bool) -> (TxIn, Input) {
    let script_pubkey = key.script_pubkey(kind);
    let funding = funding_tx(script_pubkey.clone(), value, key.child);
    let txin = TxIn {
        previous_output: OutPoint { txid: funding.compute_txid(), vout: 0 },
        script_sig: ScriptBuf::new(),
        sequence: SEQUENCE,
        witness: Witness::new(),
    };
    let mut psbtin = Input::default();
    match kind {
        ScriptKind::P2wpkh => psbtin.witness_utxo = Some(funding.output[0].clone()),
        ScriptKind::NestedP2wpkh => {
            psbtin.witness_utxo = Some(funding.output[0].clone());
            psbtin.redeem_script = Some(key.p2wpkh());
        }
        ScriptKind::P2pkh => psbtin.non_witness_utxo = Some(funding),
    }
    if owned {
        psbtin.bip32_derivation.insert(key.public.0, key.key_source());
    }
    (txin, psbtin)
}

pub fn owned_output(key: &TestKey, value: Amount) -> (TxOut, Output) {
    let mut psbtout = Output::default();
    psbtout.bip32_derivation.insert(key.public.0, key.key_source());
    (TxOut { value, script_pubkey: key.p2wpkh() }, psbtout)
}

pub fn foreign_output(script_pubkey: ScriptBuf, value: Amount) -> (TxOut, Output) {
    (TxOut { value, script_pubkey }, Output::default())
}

pub fn build_psbt(inputs: Vec<(TxIn, Input)>, outputs: Vec<(TxOut, Output)>) -> Psbt {
    let (txins, psbtins): (Vec<_>, Vec<_>) = inputs.into_iter().unzip();
    let (txouts, psbtouts): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
    Psbt {
        unsigned_tx: Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: txins,
            output: txouts,
        },
        version: 0,
        xpub: Default::default(),
        proprietary: Default::default(),
        unknown: Default::default(),
        inputs: psbtins,
        outputs: psbtouts,
    }
}

/// One sender input of [`ORIGINAL_INPUT_VALUE`] paying [`PAYMENT_VALUE`] to the payee
/// and [`CHANGE_VALUE`] back to the sender. The absolute fee is 500 sats.
pub fn original_psbt_of(kind: ScriptKind) -> Psbt {
    build_psbt(
        vec![input(&SENDER_KEY, kind, ORIGINAL_INPUT_VALUE, true)],
        vec![
            foreign_output(PAYEE_KEY.p2wpkh(), PAYMENT_VALUE),
            owned_output(&SENDER_CHANGE_KEY, CHANGE_VALUE),
        ],
    )
}

pub fn original_psbt() -> Psbt { original_psbt_of(ScriptKind::P2wpkh) }

pub static PARSED_ORIGINAL_PSBT: Lazy<Psbt> = Lazy::new(original_psbt);

/// Appends a receiver-owned input of `kind` to `psbt` and returns its index.
pub fn add_receiver_input(psbt: &mut Psbt, kind: ScriptKind, value: Amount) -> usize {
    let (txin, psbtin) = input(&RECEIVER_KEY, kind, value, false);
    psbt.unsigned_tx.input.push(txin);
    psbt.inputs.push(psbtin);
    psbt.inputs.len() - 1
}

pub fn add_output(psbt: &mut Psbt, script_pubkey: ScriptBuf, value: Amount) -> usize {
    let (txout, psbtout) = foreign_output(script_pubkey, value);
    psbt.unsigned_tx.output.push(txout);
    psbt.outputs.push(psbtout);
    psbt.outputs.len() - 1
}

/// What a cooperative receiver does with a request template: contribute one P2WPKH
/// input, send its value to a fresh receiver output, take `change_value` as the
/// sender's new change and sign its own input.
pub fn receiver_proposal(template: &Psbt, change_value: Amount) -> Result<Psbt, BoxSendSyncError> {
    let mut proposal = template.clone();
    let index = add_receiver_input(&mut proposal, ScriptKind::P2wpkh, RECEIVER_INPUT_VALUE);
    add_output(&mut proposal, RECEIVER_KEY.p2wpkh(), RECEIVER_INPUT_VALUE);
    proposal.unsigned_tx.output[CHANGE_INDEX].value = change_value;
    sign_input(&mut proposal, index, &RECEIVER_KEY)?;
    Ok(proposal)
}

/// Finalizes a P2WPKH or P2SH-P2WPKH input with a SIGHASH_ALL signature from `key`.
pub fn sign_input(psbt: &mut Psbt, index: usize, key: &TestKey) -> Result<(), BoxSendSyncError> {
    let prevout = psbt
        .inputs
        .get(index)
        .and_then(|input| input.witness_utxo.clone())
        .ok_or("input has no witness utxo")?;
    let nested = if prevout.script_pubkey == key.p2wpkh() {
        false
    } else if prevout.script_pubkey == key.p2sh_p2wpkh() {
        true
    } else {
        return Err("input is not a p2wpkh or p2sh-p2wpkh output of this key".into());
    };

    let tx = psbt.unsigned_tx.clone();
    let sighash = SighashCache::new(&tx).p2wpkh_signature_hash(
        index,
        &key.p2wpkh(),
        prevout.value,
        EcdsaSighashType::All,
    )?;
    let secp = Secp256k1::signing_only();
    let signature = bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &key.secret),
        sighash_type: EcdsaSighashType::All,
    };

    let input = &mut psbt.inputs[index];
    input.final_script_witness = Some(Witness::p2wpkh(&signature, &key.public.0));
    if nested {
        let redeem_script = PushBytesBuf::try_from(key.p2wpkh().into_bytes())?;
        input.final_script_sig = Some(Builder::new().push_slice(redeem_script).into_script());
    }
    input.partial_sigs.clear();
    input.bip32_derivation.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    Ok(())
}

/// Signs every input that is not finalized yet and is locked to one of `keys`.
pub fn sign_owned_inputs(psbt: &mut Psbt, keys: &[TestKey]) -> Result<(), BoxSendSyncError> {
    for index in 0..psbt.inputs.len() {
        let input = &psbt.inputs[index];
        if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
            continue;
        }
        let Some(spk) = input.witness_utxo.as_ref().map(|txout| txout.script_pubkey.clone())
        else {
            continue;
        };
        if let Some(key) =
            keys.iter().find(|key| spk == key.p2wpkh() || spk == key.p2sh_p2wpkh())
        {
            sign_input(psbt, index, key)?;
        }
    }
    Ok(())
}
