use crate::types::{Part, Proposal, RoundStateEvent, RoundStep, Vote};
use bytes::{Buf, BufMut};
use halcyon_codec::{EncodeSize, Error as CodecError, FixedSize, RangeCfg, Read, ReadExt, Write};
use std::time::Duration;

/// Longest peer identifier stored alongside a message.
const MAX_PEER_ID_LENGTH: usize = 128;

/// Message exchanged between validators while agreeing on a height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart { height: u64, round: u32, part: Part },
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn height(&self) -> u64 {
        match self {
            Self::Proposal(proposal) => proposal.height,
            Self::BlockPart { height, .. } => *height,
            Self::Vote(vote) => vote.height,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            Self::Proposal(proposal) => proposal.round,
            Self::BlockPart { round, .. } => *round,
            Self::Vote(vote) => vote.round,
        }
    }
}

impl Write for ConsensusMessage {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Proposal(proposal) => {
                0u8.write(buf);
                proposal.write(buf);
            }
            Self::BlockPart {
                height,
                round,
                part,
            } => {
                1u8.write(buf);
                height.write(buf);
                round.write(buf);
                part.write(buf);
            }
            Self::Vote(vote) => {
                2u8.write(buf);
                vote.write(buf);
            }
        }
    }
}

impl EncodeSize for ConsensusMessage {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Proposal(proposal) => proposal.encode_size(),
            Self::BlockPart {
                height,
                round,
                part,
            } => height.encode_size() + round.encode_size() + part.encode_size(),
            Self::Vote(vote) => vote.encode_size(),
        }
    }
}

impl Read for ConsensusMessage {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Self::Proposal(Proposal::read(buf)?)),
            1 => Ok(Self::BlockPart {
                height: u64::read(buf)?,
                round: u32::read(buf)?,
                part: Part::read(buf)?,
            }),
            2 => Ok(Self::Vote(Vote::read(buf)?)),
            tag => Err(CodecError::InvalidEnum("ConsensusMessage", tag)),
        }
    }
}

/// A consensus message and the peer it came from (none for our own messages).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer: Option<String>,
}

impl Write for MsgInfo {
    fn write(&self, buf: &mut impl BufMut) {
        self.msg.write(buf);
        self.peer.write(buf);
    }
}

impl EncodeSize for MsgInfo {
    fn encode_size(&self) -> usize {
        self.msg.encode_size() + self.peer.encode_size()
    }
}

impl Read for MsgInfo {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            msg: ConsensusMessage::read(buf)?,
            peer: Option::<String>::read_cfg(buf, &RangeCfg::from(..=MAX_PEER_ID_LENGTH))?,
        })
    }
}

/// A timeout scheduled for a step of a round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: RoundStep,
}

impl TimeoutInfo {
    /// Position of the timeout in the order of steps.
    pub fn position(&self) -> (u64, u32, RoundStep) {
        (self.height, self.round, self.step)
    }
}

impl Write for TimeoutInfo {
    fn write(&self, buf: &mut impl BufMut) {
        (self.duration.as_millis() as u64).write(buf);
        self.height.write(buf);
        self.round.write(buf);
        self.step.write(buf);
    }
}

impl EncodeSize for TimeoutInfo {
    fn encode_size(&self) -> usize {
        u64::SIZE + u64::SIZE + u32::SIZE + RoundStep::SIZE
    }
}

impl Read for TimeoutInfo {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            duration: Duration::from_millis(u64::read(buf)?),
            height: u64::read(buf)?,
            round: u32::read(buf)?,
            step: RoundStep::read(buf)?,
        })
    }
}

/// Entry of the write-ahead log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalMessage {
    MsgInfo(MsgInfo),
    Timeout(TimeoutInfo),
    RoundState(RoundStateEvent),
    /// Every message of the height has been written and the block committed.
    EndHeight(u64),
}

impl Write for WalMessage {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::MsgInfo(info) => {
                0u8.write(buf);
                info.write(buf);
            }
            Self::Timeout(timeout) => {
                1u8.write(buf);
                timeout.write(buf);
            }
            Self::RoundState(state) => {
                2u8.write(buf);
                state.height.write(buf);
                state.round.write(buf);
                state.step.write(buf);
            }
            Self::EndHeight(height) => {
                3u8.write(buf);
                height.write(buf);
            }
        }
    }
}

impl EncodeSize for WalMessage {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::MsgInfo(info) => info.encode_size(),
            Self::Timeout(timeout) => timeout.encode_size(),
            Self::RoundState(_) => u64::SIZE + u32::SIZE + RoundStep::SIZE,
            Self::EndHeight(_) => u64::SIZE,
        }
    }
}

impl Read for WalMessage {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Self::MsgInfo(MsgInfo::read(buf)?)),
            1 => Ok(Self::Timeout(TimeoutInfo::read(buf)?)),
            2 => Ok(Self::RoundState(RoundStateEvent {
                height: u64::read(buf)?,
                round: u32::read(buf)?,
                step: RoundStep::read(buf)?,
            })),
            3 => Ok(Self::EndHeight(u64::read(buf)?)),
            tag => Err(CodecError::InvalidEnum("WalMessage", tag)),
        }
    }
}

/// A [WalMessage] with the time (milliseconds since the UNIX epoch) it was written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedWalMessage {
    pub time: u64,
    pub msg: WalMessage,
}

impl Write for TimedWalMessage {
    fn write(&self, buf: &mut impl BufMut) {
        self.time.write(buf);
        self.msg.write(buf);
    }
}

impl EncodeSize for TimedWalMessage {
    fn encode_size(&self) -> usize {
        self.time.encode_size() + self.msg.encode_size()
    }
}

impl Read for TimedWalMessage {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self {
            time: u64::read(buf)?,
            msg: WalMessage::read(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockId, PartSet, PartSetHeader, SignedMsgType};
    use bytes::Bytes;
    use halcyon_codec::{DecodeExt, Encode};
    use halcyon_cryptography::{hash, KeyType, PrivateKey};

    fn vote() -> Vote {
        let key = PrivateKey::from_seed(KeyType::Ed25519, 0);
        let mut vote = Vote {
            vote_type: SignedMsgType::Prevote,
            height: 3,
            round: 1,
            block_id: BlockId {
                hash: hash(b"block"),
                part_set_header: PartSetHeader {
                    total: 1,
                    hash: hash(b"parts"),
                },
            },
            timestamp: 42,
            validator_address: key.public_key().address(),
            validator_index: 0,
            signature: Bytes::new(),
        };
        vote.sign("halcyon", &key);
        vote
    }

    #[test]
    fn test_messages_survive_encoding() {
        let parts = PartSet::from_data(&[7u8; 100], 64);
        let messages = vec![
            WalMessage::MsgInfo(MsgInfo {
                msg: ConsensusMessage::Vote(vote()),
                peer: Some("peer-1".into()),
            }),
            WalMessage::MsgInfo(MsgInfo {
                msg: ConsensusMessage::BlockPart {
                    height: 3,
                    round: 1,
                    part: parts.get_part(1).unwrap().clone(),
                },
                peer: None,
            }),
            WalMessage::Timeout(TimeoutInfo {
                duration: Duration::from_millis(1_500),
                height: 3,
                round: 1,
                step: RoundStep::Propose,
            }),
            WalMessage::RoundState(RoundStateEvent {
                height: 3,
                round: 1,
                step: RoundStep::PrecommitWait,
            }),
            WalMessage::EndHeight(2),
        ];
        for msg in messages {
            let timed = TimedWalMessage { time: 99, msg };
            let encoded = timed.encode();
            assert_eq!(encoded.len(), timed.encode_size());
            assert_eq!(TimedWalMessage::decode(encoded).unwrap(), timed);
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut encoded = WalMessage::EndHeight(1).encode();
        encoded[0] = 9;
        assert!(matches!(
            WalMessage::decode(encoded),
            Err(CodecError::InvalidEnum("WalMessage", 9))
        ));
    }

    #[test]
    fn test_timeout_position_orders_by_height_round_step() {
        let timeout = |height, round, step| TimeoutInfo {
            duration: Duration::ZERO,
            height,
            round,
            step,
        };
        assert!(
            timeout(1, 0, RoundStep::Commit).position()
                < timeout(2, 0, RoundStep::NewHeight).position()
        );
        assert!(
            timeout(2, 0, RoundStep::PrecommitWait).position()
                < timeout(2, 1, RoundStep::Propose).position()
        );
        let msg = ConsensusMessage::Vote(vote());
        assert_eq!((msg.height(), msg.round()), (3, 1));
    }
}
