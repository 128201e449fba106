//! Signers for votes, proposals and VRF proofs.

use super::{Proposal, SignedMsgType, Vote};
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{
    DecodeExt, Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write,
};
use halcyon_cryptography::{vrf, KeyType, PrivateKey, PublicKey};
use halcyon_runtime::Storage;
use halcyon_storage::metadata::{self, Metadata};
use rand::{CryptoRng, RngCore};
use tracing::{debug, warn};

/// Signs on behalf of a validator.
pub trait PrivValidator: Send + 'static {
    fn public_key(&self) -> PublicKey;

    /// Fills in the signature of `vote`.
    ///
    /// The timestamp may be rewritten if an equivalent vote was already signed.
    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), Error>;

    /// Fills in the signature of `proposal`.
    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), Error>;

    /// Proves `message` with the validator's key.
    fn generate_vrf_proof(&self, message: &[u8]) -> Bytes;
}

/// Signs anything it is asked to (for tests and tools).
#[derive(Clone, Debug)]
pub struct MockPv {
    key: PrivateKey,
}

impl MockPv {
    pub fn new(key: PrivateKey) -> Self {
        Self { key }
    }

    pub fn from_seed(key_type: KeyType, seed: u64) -> Self {
        Self::new(PrivateKey::from_seed(key_type, seed))
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }
}

impl PrivValidator for MockPv {
    fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), Error> {
        vote.sign(chain_id, &self.key);
        Ok(())
    }

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), Error> {
        proposal.sign(chain_id, &self.key);
        Ok(())
    }

    fn generate_vrf_proof(&self, message: &[u8]) -> Bytes {
        vrf::prove(&self.key, message)
    }
}

/// Signing step, ordered within a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum SignStep {
    Propose = 1,
    Prevote = 2,
    Precommit = 3,
}

impl From<SignedMsgType> for SignStep {
    fn from(value: SignedMsgType) -> Self {
        match value {
            SignedMsgType::Proposal => Self::Propose,
            SignedMsgType::Prevote => Self::Prevote,
            SignedMsgType::Precommit => Self::Precommit,
        }
    }
}

/// The last message signed, persisted before the signature is released.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LastSignState {
    height: u64,
    round: u32,
    step: SignStep,
    timestamp: u64,
    signature: Bytes,
    sign_bytes: Bytes,
}

impl LastSignState {
    /// Returns true if `(height, round, step)` was already signed, failing if it regresses.
    fn check(&self, height: u64, round: u32, step: SignStep) -> Result<bool, Error> {
        if self.height > height {
            return Err(Error::DoubleSign(format!(
                "height regression: got {height}, last {}",
                self.height
            )));
        }
        if self.height == height {
            if self.round > round {
                return Err(Error::DoubleSign(format!(
                    "round regression at height {height}: got {round}, last {}",
                    self.round
                )));
            }
            if self.round == round {
                if self.step > step {
                    return Err(Error::DoubleSign(format!(
                        "step regression at height {height} round {round}: got {step:?}, last {:?}",
                        self.step
                    )));
                }
                return Ok(self.step == step);
            }
        }
        Ok(false)
    }
}

const MAX_SIGN_BYTES: usize = 1024;

impl Write for LastSignState {
    fn write(&self, buf: &mut impl BufMut) {
        self.height.write(buf);
        self.round.write(buf);
        (self.step as u8).write(buf);
        self.timestamp.write(buf);
        self.signature.write(buf);
        self.sign_bytes.write(buf);
    }
}

impl EncodeSize for LastSignState {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.round.encode_size()
            + 1
            + self.timestamp.encode_size()
            + self.signature.encode_size()
            + self.sign_bytes.encode_size()
    }
}

impl Read for LastSignState {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let height = u64::read(buf)?;
        let round = u32::read(buf)?;
        let step = match u8::read(buf)? {
            1 => SignStep::Propose,
            2 => SignStep::Prevote,
            3 => SignStep::Precommit,
            tag => return Err(CodecError::InvalidEnum("SignStep", tag)),
        };
        Ok(Self {
            height,
            round,
            step,
            timestamp: u64::read(buf)?,
            signature: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_SIGN_BYTES))?,
            sign_bytes: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_SIGN_BYTES))?,
        })
    }
}

const KEY: &[u8] = b"key";
const LAST_SIGN_STATE: &[u8] = b"last_sign_state";

/// A signer that refuses to sign conflicting messages, even across restarts.
///
/// The key and the last signed message are kept in [Metadata]. Asking to sign the same
/// message again (or a vote differing only by its timestamp) returns the prior signature.
pub struct FilePv<S: Storage> {
    key: PrivateKey,
    metadata: Metadata<S>,
    last: Option<LastSignState>,
}

impl<S: Storage> FilePv<S> {
    /// Opens the signer stored in `partition`, generating a key on first use.
    pub fn init<R: RngCore + CryptoRng>(
        storage: S,
        partition: &str,
        key_type: KeyType,
        rng: &mut R,
    ) -> Result<Self, Error> {
        let mut metadata = Metadata::init(
            storage,
            metadata::Config {
                partition: partition.to_string(),
            },
        )?;
        let key = match metadata.get(KEY).cloned() {
            Some(mut raw) => {
                let key_type = KeyType::read(&mut raw)?;
                PrivateKey::from_bytes(key_type, &raw)
                    .map_err(|_| CodecError::Invalid("FilePv", "invalid private key"))?
            }
            None => {
                let key = PrivateKey::from_rng(key_type, rng);
                let mut raw = key.key_type().encode().to_vec();
                raw.extend_from_slice(&key.to_bytes());
                metadata.put(KEY.to_vec(), Bytes::from(raw));
                metadata.sync()?;
                debug!(address = %key.public_key().address(), "generated validator key");
                key
            }
        };
        let last = metadata
            .get(LAST_SIGN_STATE)
            .map(|raw| LastSignState::decode(raw.clone()))
            .transpose()?;
        Ok(Self {
            key,
            metadata,
            last,
        })
    }

    fn persist(&mut self, state: LastSignState) -> Result<(), Error> {
        self.metadata
            .put(LAST_SIGN_STATE.to_vec(), state.encode().freeze());
        self.metadata.sync()?;
        self.last = Some(state);
        Ok(())
    }

    /// Forgets the last signed message.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.metadata.remove(LAST_SIGN_STATE);
        self.metadata.sync()?;
        self.last = None;
        Ok(())
    }

    pub fn close(self) -> Result<(), Error> {
        self.metadata.close()?;
        Ok(())
    }
}

impl<S: Storage> PrivValidator for FilePv<S> {
    fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), Error> {
        let step = SignStep::from(vote.vote_type);
        let sign_bytes = vote.sign_bytes(chain_id);
        if let Some(last) = &self.last {
            if last.check(vote.height, vote.round, step)? {
                if last.sign_bytes.as_ref() == sign_bytes.as_slice() {
                    vote.signature = last.signature.clone();
                    return Ok(());
                }

                // Votes that only differ by timestamp reuse the prior timestamp and signature
                let mut prior = vote.clone();
                prior.timestamp = last.timestamp;
                if last.sign_bytes.as_ref() == prior.sign_bytes(chain_id).as_slice() {
                    vote.timestamp = last.timestamp;
                    vote.signature = last.signature.clone();
                    return Ok(());
                }
                warn!(height = vote.height, round = vote.round, ?step, "refusing conflicting vote");
                return Err(Error::DoubleSign(format!(
                    "conflicting data at height {} round {} step {step:?}",
                    vote.height, vote.round
                )));
            }
        }
        let signature = self.key.sign(&sign_bytes);
        self.persist(LastSignState {
            height: vote.height,
            round: vote.round,
            step,
            timestamp: vote.timestamp,
            signature: signature.clone(),
            sign_bytes: Bytes::from(sign_bytes),
        })?;
        vote.signature = signature;
        Ok(())
    }

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), Error> {
        let sign_bytes = proposal.sign_bytes(chain_id);
        if let Some(last) = &self.last {
            if last.check(proposal.height, proposal.round, SignStep::Propose)? {
                if last.sign_bytes.as_ref() == sign_bytes.as_slice() {
                    proposal.signature = last.signature.clone();
                    return Ok(());
                }
                let mut prior = proposal.clone();
                prior.timestamp = last.timestamp;
                if last.sign_bytes.as_ref() == prior.sign_bytes(chain_id).as_slice() {
                    proposal.timestamp = last.timestamp;
                    proposal.signature = last.signature.clone();
                    return Ok(());
                }
                return Err(Error::DoubleSign(format!(
                    "conflicting proposal at height {} round {}",
                    proposal.height, proposal.round
                )));
            }
        }
        let signature = self.key.sign(&sign_bytes);
        self.persist(LastSignState {
            height: proposal.height,
            round: proposal.round,
            step: SignStep::Propose,
            timestamp: proposal.timestamp,
            signature: signature.clone(),
            sign_bytes: Bytes::from(sign_bytes),
        })?;
        proposal.signature = signature;
        Ok(())
    }

    fn generate_vrf_proof(&self, message: &[u8]) -> Bytes {
        vrf::prove(&self.key, message)
    }
}
