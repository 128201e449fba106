use super::{vote::MAX_SIGNATURE_SIZE, BlockId, SignedMsgType};
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use halcyon_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{PrivateKey, PublicKey};
use std::fmt::Display;

/// A block proposed by the proposer of a round.
///
/// `pol_round` is set when the proposer re-proposes a block that received a proof of lock
/// (2/3 prevotes) in an earlier round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub pol_round: Option<u32>,
    pub block_id: BlockId,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub signature: Bytes,
}

impl Proposal {
    pub fn new(height: u64, round: u32, pol_round: Option<u32>, block_id: BlockId, timestamp: u64) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: Bytes::new(),
        }
    }

    /// Returns the bytes to sign for `chain_id`.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + chain_id.len());
        SignedMsgType::Proposal.write(&mut buf);
        self.height.write(&mut buf);
        self.round.write(&mut buf);
        self.pol_round.write(&mut buf);
        self.block_id.write(&mut buf);
        self.timestamp.write(&mut buf);
        chain_id.to_string().write(&mut buf);
        buf
    }

    pub fn sign(&mut self, chain_id: &str, key: &PrivateKey) {
        self.signature = key.sign(&self.sign_bytes(chain_id));
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        pub_key.verify(&self.sign_bytes(chain_id), &self.signature)
    }

    pub fn validate_basic(&self) -> Result<(), Error> {
        if self.height == 0 {
            return Err(Error::InvalidProposal("zero height".into()));
        }
        if let Some(pol_round) = self.pol_round {
            if pol_round >= self.round {
                return Err(Error::InvalidProposalPolRound);
            }
        }
        if !self.block_id.is_complete() {
            return Err(Error::InvalidProposal(format!(
                "expected a complete block id: {}",
                self.block_id
            )));
        }
        if self.signature.is_empty() {
            return Err(Error::InvalidProposal("signature is missing".into()));
        }
        if self.signature.len() > MAX_SIGNATURE_SIZE {
            return Err(Error::InvalidProposal("signature is too big".into()));
        }
        Ok(())
    }
}

impl Display for Proposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} ({}, {:?}) @ {}}}",
            self.height, self.round, self.block_id, self.pol_round, self.timestamp
        )
    }
}

impl Write for Proposal {
    fn write(&self, buf: &mut impl BufMut) {
        self.height.write(buf);
        self.round.write(buf);
        self.pol_round.write(buf);
        self.block_id.write(buf);
        self.timestamp.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for Proposal {
    fn encode_size(&self) -> usize {
        self.height.encode_size()
            + self.round.encode_size()
            + self.pol_round.encode_size()
            + self.block_id.encode_size()
            + self.timestamp.encode_size()
            + self.signature.encode_size()
    }
}

impl Read for Proposal {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            height: u64::read(buf)?,
            round: u32::read(buf)?,
            pol_round: Option::<u32>::read(buf)?,
            block_id: BlockId::read(buf)?,
            timestamp: u64::read(buf)?,
            signature: Bytes::read_cfg(buf, &RangeCfg::from(..=MAX_SIGNATURE_SIZE))?,
        })
    }
}
