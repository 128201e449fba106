use super::block::MAX_BLOCK_SIZE_BYTES;
use crate::Error;
use bytes::{Buf, BufMut};
use halcyon_codec::{Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{hash, Digest, KeyType};

/// Limits on the size of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockParams {
    pub max_bytes: i64,
    /// `-1` for no limit.
    pub max_gas: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 22_020_096,
            max_gas: -1,
        }
    }
}

/// Limits on the evidence a block may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvidenceParams {
    pub max_age_num_blocks: u64,
    pub max_bytes: i64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 100_000,
            max_bytes: 1_048_576,
        }
    }
}

/// Key types validators may use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorParams {
    pub pub_key_types: Vec<KeyType>,
}

impl Default for ValidatorParams {
    fn default() -> Self {
        Self {
            pub_key_types: vec![KeyType::Ed25519, KeyType::Bls12381],
        }
    }
}

impl ValidatorParams {
    pub fn is_allowed(&self, key_type: KeyType) -> bool {
        self.pub_key_types.contains(&key_type)
    }
}

/// Parameters that determine the validity of blocks, changeable by the application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsensusParams {
    pub block: BlockParams,
    pub evidence: EvidenceParams,
    pub validator: ValidatorParams,
    pub app_version: u64,
}

/// Partial update of the consensus params returned by the application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsensusParamsUpdate {
    pub block: Option<BlockParams>,
    pub evidence: Option<EvidenceParams>,
    pub validator: Option<ValidatorParams>,
    pub app_version: Option<u64>,
}

impl ConsensusParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.block.max_bytes <= 0 {
            return Err(Error::InvalidBlock(format!(
                "block.max_bytes must be greater than 0: {}",
                self.block.max_bytes
            )));
        }
        if self.block.max_bytes > MAX_BLOCK_SIZE_BYTES as i64 {
            return Err(Error::InvalidBlock(format!(
                "block.max_bytes is too big: {} > {}",
                self.block.max_bytes, MAX_BLOCK_SIZE_BYTES
            )));
        }
        if self.block.max_gas < -1 {
            return Err(Error::InvalidBlock(format!(
                "block.max_gas must be at least -1: {}",
                self.block.max_gas
            )));
        }
        if self.evidence.max_age_num_blocks == 0 {
            return Err(Error::InvalidEvidence(
                "evidence.max_age_num_blocks must be greater than 0".into(),
            ));
        }
        if self.evidence.max_bytes < 0 || self.evidence.max_bytes > self.block.max_bytes {
            return Err(Error::InvalidEvidence(format!(
                "evidence.max_bytes must be within [0, {}]: {}",
                self.block.max_bytes, self.evidence.max_bytes
            )));
        }
        if self.validator.pub_key_types.is_empty() {
            return Err(Error::InvalidValidatorUpdate(
                "validator.pub_key_types must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Hash committed to in block headers.
    pub fn hash(&self) -> Digest {
        hash(&self.encode())
    }

    /// Returns a copy with `update` applied.
    pub fn update(&self, update: &ConsensusParamsUpdate) -> Self {
        let mut params = self.clone();
        if let Some(block) = update.block {
            params.block = block;
        }
        if let Some(evidence) = update.evidence {
            params.evidence = evidence;
        }
        if let Some(validator) = &update.validator {
            params.validator = validator.clone();
        }
        if let Some(app_version) = update.app_version {
            params.app_version = app_version;
        }
        params
    }
}

impl Write for ConsensusParams {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.max_bytes.write(buf);
        self.block.max_gas.write(buf);
        self.evidence.max_age_num_blocks.write(buf);
        self.evidence.max_bytes.write(buf);
        self.validator.pub_key_types.write(buf);
        self.app_version.write(buf);
    }
}

impl EncodeSize for ConsensusParams {
    fn encode_size(&self) -> usize {
        self.block.max_bytes.encode_size()
            + self.block.max_gas.encode_size()
            + self.evidence.max_age_num_blocks.encode_size()
            + self.evidence.max_bytes.encode_size()
            + self.validator.pub_key_types.encode_size()
            + self.app_version.encode_size()
    }
}

impl Read for ConsensusParams {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            block: BlockParams {
                max_bytes: i64::read(buf)?,
                max_gas: i64::read(buf)?,
            },
            evidence: EvidenceParams {
                max_age_num_blocks: u64::read(buf)?,
                max_bytes: i64::read(buf)?,
            },
            validator: ValidatorParams {
                pub_key_types: Vec::<KeyType>::read_cfg(buf, &(RangeCfg::from(..=8), ()))?,
            },
            app_version: u64::read(buf)?,
        })
    }
}

/// Parameters of the voter election.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VoterParams {
    /// Validator sets of at most this size are not sampled.
    pub voter_election_threshold: u32,
    /// Percentage of the whole validator set assumed to be byzantine.
    pub max_tolerable_byzantine_percentage: u32,
}

impl Default for VoterParams {
    fn default() -> Self {
        Self {
            voter_election_threshold: 33,
            max_tolerable_byzantine_percentage: 20,
        }
    }
}

impl VoterParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_tolerable_byzantine_percentage == 0
            || self.max_tolerable_byzantine_percentage >= 34
        {
            return Err(Error::InvalidValidatorUpdate(format!(
                "max_tolerable_byzantine_percentage must be in [1, 33]: {}",
                self.max_tolerable_byzantine_percentage
            )));
        }
        Ok(())
    }
}

impl Write for VoterParams {
    fn write(&self, buf: &mut impl BufMut) {
        self.voter_election_threshold.write(buf);
        self.max_tolerable_byzantine_percentage.write(buf);
    }
}

impl EncodeSize for VoterParams {
    fn encode_size(&self) -> usize {
        self.voter_election_threshold.encode_size()
            + self.max_tolerable_byzantine_percentage.encode_size()
    }
}

impl Read for VoterParams {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            voter_election_threshold: u32::read(buf)?,
            max_tolerable_byzantine_percentage: u32::read(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_codec::DecodeExt;

    #[test]
    fn test_validate() {
        let params = ConsensusParams::default();
        params.validate().unwrap();

        let mut invalid = params.clone();
        invalid.block.max_bytes = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = params.clone();
        invalid.block.max_gas = -2;
        assert!(invalid.validate().is_err());

        let mut invalid = params.clone();
        invalid.validator.pub_key_types.clear();
        assert!(invalid.validate().is_err());

        assert!(VoterParams::default().validate().is_ok());
        assert!(VoterParams {
            voter_election_threshold: 3,
            max_tolerable_byzantine_percentage: 34,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_update_changes_hash() {
        let params = ConsensusParams::default();
        let updated = params.update(&ConsensusParamsUpdate {
            block: Some(BlockParams {
                max_bytes: 1024,
                max_gas: 10,
            }),
            ..Default::default()
        });
        assert_eq!(updated.block.max_bytes, 1024);
        assert_eq!(updated.evidence, params.evidence);
        assert_ne!(updated.hash(), params.hash());
        assert_eq!(params.update(&ConsensusParamsUpdate::default()), params);

        let decoded = ConsensusParams::decode(updated.encode()).unwrap();
        assert_eq!(decoded, updated);
    }
}
