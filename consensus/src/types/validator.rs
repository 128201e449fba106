use super::merkle::hash_from_byte_slices;
use crate::Error;
use bytes::{Buf, BufMut};
use halcyon_codec::{Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use halcyon_cryptography::{hash, Address, Digest, PublicKey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::{cmp::Ordering, collections::BTreeSet};

/// Upper bound on the total voting power of a validator set.
///
/// Leaves headroom for priority arithmetic.
pub const MAX_TOTAL_VOTING_POWER: i64 = i64::MAX / 8;

/// Priorities are kept within `PRIORITY_WINDOW_SIZE_FACTOR * total_voting_power` of each other.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

/// Upper bound on the number of validators in a set.
pub const MAX_VALIDATORS: usize = 10_000;

/// A staked participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: i64,
    /// Weight of the validator's vote once elected as a voter.
    pub voting_weight: i64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: i64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
            voting_power,
            voting_weight: voting_power,
            proposer_priority: 0,
        }
    }

    /// Orders by power (descending) then address (ascending).
    fn cmp_by_power(&self, other: &Self) -> Ordering {
        other
            .voting_power
            .cmp(&self.voting_power)
            .then_with(|| self.address.cmp(&other.address))
    }

    /// Returns the validator with the higher priority (ties go to the lower address).
    fn compare_proposer_priority<'a>(&'a self, other: &'a Self) -> &'a Self {
        match self.proposer_priority.cmp(&other.proposer_priority) {
            Ordering::Greater => self,
            Ordering::Less => other,
            Ordering::Equal => {
                if self.address <= other.address {
                    self
                } else {
                    other
                }
            }
        }
    }

    /// Bytes committed to by the set hash (priority excluded).
    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut buf = self.pub_key.encode().to_vec();
        self.voting_power.write(&mut buf);
        buf
    }
}

impl Write for Validator {
    fn write(&self, buf: &mut impl BufMut) {
        self.pub_key.write(buf);
        self.voting_power.write(buf);
        self.voting_weight.write(buf);
        self.proposer_priority.write(buf);
    }
}

impl EncodeSize for Validator {
    fn encode_size(&self) -> usize {
        self.pub_key.encode_size()
            + self.voting_power.encode_size()
            + self.voting_weight.encode_size()
            + self.proposer_priority.encode_size()
    }
}

impl Read for Validator {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let pub_key = PublicKey::read(buf)?;
        Ok(Self {
            address: pub_key.address(),
            pub_key,
            voting_power: i64::read(buf)?,
            voting_weight: i64::read(buf)?,
            proposer_priority: i64::read(buf)?,
        })
    }
}

/// All staked validators, sorted by power (descending) then address (ascending).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: i64,
}

impl ValidatorSet {
    /// Creates a set from `validators`, rejecting duplicates and invalid powers.
    ///
    /// New validators start with the priority assigned to joining validators.
    pub fn new(validators: Vec<Validator>) -> Result<Self, Error> {
        let mut set = Self::default();
        if !validators.is_empty() {
            set.update_with_change_set(validators)?;
        }
        Ok(set)
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, val)| val.address == *address)
            .map(|(index, val)| (index as u32, val))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Merkle root over the validators' hash bytes.
    pub fn hash(&self) -> Digest {
        let leaves: Vec<Vec<u8>> = self.validators.iter().map(Validator::hash_bytes).collect();
        hash_from_byte_slices(&leaves)
    }

    fn update_total_voting_power(&mut self) {
        let total = self
            .validators
            .iter()
            .fold(0i64, |acc, val| acc.saturating_add(val.voting_power));
        assert!(
            total <= MAX_TOTAL_VOTING_POWER,
            "total voting power exceeds maximum: {total}"
        );
        self.total_voting_power = total;
    }

    /// Selects the proposer for `(height, round)` given the previous proof hash.
    ///
    /// Each validator is chosen with probability proportional to its voting power. The
    /// result only depends on the arguments and the set, so every node computes the same
    /// proposer.
    pub fn select_proposer(&self, proof_hash: &[u8], height: u64, round: u32) -> &Validator {
        assert!(!self.is_empty(), "empty validator set");
        let mut rng = ChaCha20Rng::from_seed(round_seed(proof_hash, height, round).into());
        let target = rng.gen_range(0..self.total_voting_power as u64);
        let mut cumulative = 0u64;
        for val in &self.validators {
            cumulative += val.voting_power as u64;
            if target < cumulative {
                return val;
            }
        }
        unreachable!("target is below total voting power")
    }

    /// Applies `times` rounds of the proposer priority algorithm, returning the address of
    /// the last validator to win a round.
    pub fn increment_proposer_priority(&mut self, times: u32) -> Address {
        assert!(!self.is_empty(), "empty validator set");
        assert!(times > 0, "cannot call increment_proposer_priority with non-positive times");

        let diff_max = PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power;
        self.rescale_priorities(diff_max);
        self.shift_by_avg_proposer_priority();
        let mut winner = self.validators[0].address;
        for _ in 0..times {
            winner = self.increment_once();
        }
        winner
    }

    fn increment_once(&mut self) -> Address {
        for val in self.validators.iter_mut() {
            val.proposer_priority = val.proposer_priority.saturating_add(val.voting_power);
        }
        let mut mostest = 0;
        for index in 1..self.validators.len() {
            let current = &self.validators[mostest];
            let candidate = &self.validators[index];
            if std::ptr::eq(candidate.compare_proposer_priority(current), candidate) {
                mostest = index;
            }
        }
        let total = self.total_voting_power;
        let val = &mut self.validators[mostest];
        val.proposer_priority = val.proposer_priority.saturating_sub(total);
        val.address
    }

    /// Scales priorities down so that the spread between them is at most `diff_max`.
    pub fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max <= 0 || self.is_empty() {
            return;
        }
        let max = self
            .validators
            .iter()
            .map(|val| val.proposer_priority)
            .max()
            .unwrap_or_default();
        let min = self
            .validators
            .iter()
            .map(|val| val.proposer_priority)
            .min()
            .unwrap_or_default();
        let diff = (max as i128 - min as i128) as u128;
        let diff_max = diff_max as u128;
        if diff > diff_max {
            let ratio = diff.div_ceil(diff_max) as i128;
            for val in self.validators.iter_mut() {
                val.proposer_priority = (val.proposer_priority as i128 / ratio) as i64;
            }
        }
    }

    fn shift_by_avg_proposer_priority(&mut self) {
        if self.is_empty() {
            return;
        }
        let sum: i128 = self
            .validators
            .iter()
            .map(|val| val.proposer_priority as i128)
            .sum();
        let avg = (sum / self.validators.len() as i128) as i64;
        for val in self.validators.iter_mut() {
            val.proposer_priority = val.proposer_priority.saturating_sub(avg);
        }
    }

    /// Applies validator updates: a power of zero removes a validator, any other power adds
    /// or updates it.
    ///
    /// Either all changes are applied or none are.
    pub fn update_with_change_set(&mut self, changes: Vec<Validator>) -> Result<(), Error> {
        if changes.is_empty() {
            return Ok(());
        }

        // Check for duplicates and invalid powers
        let mut seen = BTreeSet::new();
        for change in &changes {
            if !seen.insert(change.address) {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "duplicate entry {}",
                    change.address
                )));
            }
            if change.voting_power < 0 {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "voting power can't be negative: {}",
                    change.voting_power
                )));
            }
            if change.voting_power > MAX_TOTAL_VOTING_POWER {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "voting power can't exceed {MAX_TOTAL_VOTING_POWER}: {}",
                    change.voting_power
                )));
            }
        }
        let (updates, deletes): (Vec<Validator>, Vec<Validator>) =
            changes.into_iter().partition(|val| val.voting_power > 0);

        // Deleted validators must exist
        for delete in &deletes {
            if !self.has_address(&delete.address) {
                return Err(Error::InvalidValidatorUpdate(format!(
                    "failed to find validator {} to remove",
                    delete.address
                )));
            }
        }

        // Compute the total power after the update
        let mut total: i128 = self.total_voting_power as i128;
        for update in &updates {
            let existing = self
                .get_by_address(&update.address)
                .map_or(0, |(_, val)| val.voting_power);
            total += update.voting_power as i128 - existing as i128;
        }
        for delete in &deletes {
            let existing = self
                .get_by_address(&delete.address)
                .map_or(0, |(_, val)| val.voting_power);
            total -= existing as i128;
        }
        if total > MAX_TOTAL_VOTING_POWER as i128 {
            return Err(Error::InvalidValidatorUpdate(format!(
                "total voting power would exceed {MAX_TOTAL_VOTING_POWER}: {total}"
            )));
        }
        if total <= 0 {
            return Err(Error::InvalidValidatorUpdate(
                "applying the validator changes would result in empty set".into(),
            ));
        }
        let total = total as i64;

        // Joining validators start behind everyone else
        let joining_priority = -(total + (total >> 3));
        let mut validators = std::mem::take(&mut self.validators);
        for mut update in updates {
            match validators.iter_mut().find(|val| val.address == update.address) {
                Some(existing) => {
                    existing.voting_power = update.voting_power;
                    existing.voting_weight = update.voting_power;
                }
                None => {
                    update.proposer_priority = joining_priority;
                    update.voting_weight = update.voting_power;
                    validators.push(update);
                }
            }
        }
        validators.retain(|val| !deletes.iter().any(|delete| delete.address == val.address));
        validators.sort_by(Validator::cmp_by_power);
        self.validators = validators;
        self.update_total_voting_power();

        self.rescale_priorities(PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power);
        self.shift_by_avg_proposer_priority();
        Ok(())
    }
}

/// Seed for the proposer draw of a round.
pub(crate) fn round_seed(proof_hash: &[u8], height: u64, round: u32) -> Digest {
    let mut message = Vec::with_capacity(proof_hash.len() + 12);
    message.extend_from_slice(proof_hash);
    message.extend_from_slice(&height.to_be_bytes());
    message.extend_from_slice(&round.to_be_bytes());
    hash(&message)
}

impl Write for ValidatorSet {
    fn write(&self, buf: &mut impl BufMut) {
        self.validators.write(buf);
    }
}

impl EncodeSize for ValidatorSet {
    fn encode_size(&self) -> usize {
        self.validators.encode_size()
    }
}

impl Read for ValidatorSet {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let validators = Vec::<Validator>::read_cfg(buf, &(RangeCfg::from(..=MAX_VALIDATORS), ()))?;
        let total = validators
            .iter()
            .try_fold(0i64, |acc, val| {
                (val.voting_power >= 0)
                    .then(|| acc.checked_add(val.voting_power))
                    .flatten()
            })
            .filter(|total| *total <= MAX_TOTAL_VOTING_POWER)
            .ok_or(CodecError::Invalid("ValidatorSet", "invalid voting power"))?;
        Ok(Self {
            validators,
            total_voting_power: total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_codec::DecodeExt;
    use halcyon_cryptography::{KeyType, PrivateKey};

    fn validator(seed: u64, power: i64) -> Validator {
        Validator::new(
            PrivateKey::from_seed(KeyType::Ed25519, seed).public_key(),
            power,
        )
    }

    fn set(powers: &[i64]) -> ValidatorSet {
        ValidatorSet::new(
            powers
                .iter()
                .enumerate()
                .map(|(i, power)| validator(i as u64, *power))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_sorted_by_power_then_address() {
        let set = set(&[10, 30, 20, 30]);
        let powers: Vec<i64> = set.validators().iter().map(|v| v.voting_power).collect();
        assert_eq!(powers, vec![30, 30, 20, 10]);
        assert!(set.validators()[0].address < set.validators()[1].address);
        assert_eq!(set.total_voting_power(), 90);
    }

    #[test]
    fn test_update_with_change_set() {
        let mut set = set(&[10, 20]);
        let hash = set.hash();

        // Add a validator and remove another
        let removed = set.get_by_index(0).unwrap().clone();
        set.update_with_change_set(vec![
            validator(9, 5),
            Validator::new(removed.pub_key.clone(), 0),
        ])
        .unwrap();
        assert_eq!(set.size(), 2);
        assert!(!set.has_address(&removed.address));
        assert_eq!(set.total_voting_power(), 15);
        assert_ne!(set.hash(), hash);

        // Unknown removal fails and leaves the set untouched
        let before = set.clone();
        assert!(set
            .update_with_change_set(vec![Validator::new(validator(77, 1).pub_key, 0)])
            .is_err());
        assert_eq!(set, before);

        // Duplicates fail
        assert!(set
            .update_with_change_set(vec![validator(50, 1), validator(50, 2)])
            .is_err());

        // Removing everyone fails
        let all: Vec<Validator> = set
            .validators()
            .iter()
            .map(|val| Validator::new(val.pub_key.clone(), 0))
            .collect();
        assert!(set.update_with_change_set(all).is_err());
    }

    #[test]
    fn test_new_validator_priority() {
        let mut set = set(&[10, 10]);
        set.update_with_change_set(vec![validator(5, 10)]).unwrap();
        let (_, joined) = set.get_by_address(&validator(5, 10).address).unwrap();
        let lowest = set
            .validators()
            .iter()
            .map(|val| val.proposer_priority)
            .min()
            .unwrap();
        assert_eq!(joined.proposer_priority, lowest);
    }

    #[test]
    fn test_increment_proposer_priority_alternates() {
        let mut set = set(&[1, 1]);
        let winners: Vec<Address> = (0..4)
            .map(|_| set.increment_proposer_priority(1))
            .collect();
        assert_ne!(winners[0], winners[1]);
        assert_eq!(winners[0], winners[2]);

        // Priorities stay centered
        let sum: i64 = set.validators().iter().map(|v| v.proposer_priority).sum();
        assert!(sum.abs() <= 1);
    }

    #[test]
    fn test_select_proposer_deterministic_and_weighted() {
        let set = set(&[1, 1, 98]);
        let a = set.select_proposer(b"proof", 1, 0).address;
        let b = set.select_proposer(b"proof", 1, 0).address;
        assert_eq!(a, b);

        let heavy = set.validators()[0].address;
        let hits = (0..1000)
            .filter(|round| set.select_proposer(b"proof", 1, *round).address == heavy)
            .count();
        assert!(hits > 900, "hits={hits}");
    }

    #[test]
    fn test_validator_set_codec() {
        let set = set(&[3, 4, 5]);
        let decoded = ValidatorSet::decode(set.encode()).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(decoded.hash(), set.hash());
    }
}
