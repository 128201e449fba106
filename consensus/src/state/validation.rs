use super::{median_time, State};
use crate::{types::Block, Error};
use halcyon_codec::EncodeSize;
use halcyon_cryptography::vrf;

/// Checks that `block` can be the next block on top of `state`.
///
/// Evidence is only checked for basic validity here. The evidence pool checks it against
/// historical voters.
pub fn validate_block(state: &State, block: &Block) -> Result<(), Error> {
    block.validate_basic()?;
    let header = &block.header;

    if header.version != state.version {
        return Err(Error::InvalidBlock(format!(
            "wrong version: expected {:?}, got {:?}",
            state.version, header.version
        )));
    }
    if header.chain_id != state.chain_id {
        return Err(Error::InvalidBlock(format!(
            "wrong chain id: expected {}, got {}",
            state.chain_id, header.chain_id
        )));
    }
    if header.height != state.next_height() {
        return Err(Error::InvalidBlock(format!(
            "wrong height: expected {}, got {}",
            state.next_height(),
            header.height
        )));
    }
    if header.last_block_id != state.last_block_id {
        return Err(Error::InvalidBlock(format!(
            "wrong last block id: expected {}, got {}",
            state.last_block_id, header.last_block_id
        )));
    }

    // Hashes of the state the block was built on
    if header.app_hash != state.app_hash {
        return Err(Error::InvalidBlock("wrong app hash".into()));
    }
    if header.consensus_hash != state.consensus_params.hash() {
        return Err(Error::InvalidBlock("wrong consensus hash".into()));
    }
    if header.last_results_hash != state.last_results_hash {
        return Err(Error::InvalidBlock("wrong last results hash".into()));
    }
    if header.validators_hash != state.validators.hash() {
        return Err(Error::InvalidBlock("wrong validators hash".into()));
    }
    if header.next_validators_hash != state.next_validators.hash() {
        return Err(Error::InvalidBlock("wrong next validators hash".into()));
    }
    if header.voters_hash != state.voters.hash() {
        return Err(Error::InvalidBlock("wrong voters hash".into()));
    }

    // The first block has no last commit and carries the genesis time
    if header.height == state.initial_height {
        if !block.last_commit.is_empty() {
            return Err(Error::InvalidBlock(
                "initial block can't have last commit signatures".into(),
            ));
        }
        if header.time != state.last_block_time {
            return Err(Error::InvalidBlock(format!(
                "initial block time {} is not the genesis time {}",
                header.time, state.last_block_time
            )));
        }
    } else {
        state.last_voters.verify_commit(
            &state.chain_id,
            &state.last_block_id,
            header.height - 1,
            &block.last_commit,
        )?;
        if header.time <= state.last_block_time {
            return Err(Error::InvalidBlock(format!(
                "block time {} is not greater than last block time {}",
                header.time, state.last_block_time
            )));
        }
        let median = median_time(&block.last_commit, &state.last_voters);
        if header.time != median {
            return Err(Error::InvalidBlock(format!(
                "block time {} is not the median time {median}",
                header.time
            )));
        }
    }

    // The proposer is selected from the last proof hash and proves the next one
    let proposer = state.proposer(header.round);
    if header.proposer_address != proposer.address {
        return Err(Error::InvalidBlock(format!(
            "wrong proposer for round {}: expected {}, got {}",
            header.round, proposer.address, header.proposer_address
        )));
    }
    let message = state.make_hash_message(header.round);
    if vrf::verify(&proposer.pub_key, &header.proof, &message).is_none() {
        return Err(Error::InvalidBlock("invalid proposer proof".into()));
    }

    let evidence_bytes: usize = block.evidence.iter().map(EncodeSize::encode_size).sum();
    if evidence_bytes as i64 > state.consensus_params.evidence.max_bytes {
        return Err(Error::InvalidEvidence(format!(
            "evidence too large: {evidence_bytes} > {}",
            state.consensus_params.evidence.max_bytes
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state::Genesis,
        types::{Commit, Validator},
    };
    use bytes::Bytes;
    use halcyon_cryptography::{KeyType, PrivateKey};

    fn setup() -> (State, Vec<PrivateKey>) {
        let keys: Vec<PrivateKey> = (0..4)
            .map(|i| PrivateKey::from_seed(KeyType::Ed25519, i))
            .collect();
        let genesis = Genesis {
            genesis_time: 10,
            chain_id: "halcyon".into(),
            initial_height: 1,
            validators: keys
                .iter()
                .map(|key| Validator::new(key.public_key(), 10))
                .collect(),
            ..Default::default()
        };
        (State::from_genesis(&genesis).unwrap(), keys)
    }

    fn proposal(state: &State, keys: &[PrivateKey], round: u32) -> Block {
        let proposer = state.proposer(round).clone();
        let key = keys
            .iter()
            .find(|key| key.public_key() == proposer.pub_key)
            .unwrap();
        let proof = vrf::prove(key, &state.make_hash_message(round));
        state
            .make_block(
                state.next_height(),
                vec![Bytes::from_static(b"k=v")],
                Commit::default(),
                Vec::new(),
                proposer.address,
                round,
                proof,
            )
            .0
    }

    #[test]
    fn test_valid_initial_block() {
        let (state, keys) = setup();
        for round in 0..3 {
            let block = proposal(&state, &keys, round);
            validate_block(&state, &block).unwrap();
        }
    }

    #[test]
    fn test_rejects_wrong_fields() {
        let (state, keys) = setup();
        let block = proposal(&state, &keys, 0);

        let mut wrong = block.clone();
        wrong.header.chain_id = "other".into();
        assert!(validate_block(&state, &wrong).is_err());

        let mut wrong = block.clone();
        wrong.header.height = 2;
        assert!(validate_block(&state, &wrong).is_err());

        let mut wrong = block.clone();
        wrong.header.time += 1;
        assert!(validate_block(&state, &wrong).is_err());

        let mut wrong = block.clone();
        wrong.header.app_hash = Bytes::from_static(b"other");
        assert!(validate_block(&state, &wrong).is_err());

        // The proposer's own proof for another round does not verify
        let key = keys
            .iter()
            .find(|key| key.public_key().address() == block.header.proposer_address)
            .unwrap();
        let mut wrong = block.clone();
        wrong.header.proof = vrf::prove(key, &state.make_hash_message(1));
        assert!(matches!(
            validate_block(&state, &wrong),
            Err(Error::InvalidBlock(reason)) if reason == "invalid proposer proof"
        ));

        // Another validator can't claim the round
        let mut wrong = block;
        let other = state
            .validators
            .validators()
            .iter()
            .find(|val| val.address != wrong.header.proposer_address)
            .unwrap();
        wrong.header.proposer_address = other.address;
        assert!(validate_block(&state, &wrong).is_err());
    }
}
