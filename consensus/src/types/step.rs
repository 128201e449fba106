use bytes::{Buf, BufMut};
use halcyon_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use std::fmt::Display;

/// Step of a round, in the order they are entered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum RoundStep {
    #[default]
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    PrevoteWait = 5,
    Precommit = 6,
    PrecommitWait = 7,
    Commit = 8,
}

impl RoundStep {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewHeight => "RoundStepNewHeight",
            Self::NewRound => "RoundStepNewRound",
            Self::Propose => "RoundStepPropose",
            Self::Prevote => "RoundStepPrevote",
            Self::PrevoteWait => "RoundStepPrevoteWait",
            Self::Precommit => "RoundStepPrecommit",
            Self::PrecommitWait => "RoundStepPrecommitWait",
            Self::Commit => "RoundStepCommit",
        }
    }
}

impl Display for RoundStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Write for RoundStep {
    fn write(&self, buf: &mut impl BufMut) {
        (*self as u8).write(buf);
    }
}

impl Read for RoundStep {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            1 => Ok(Self::NewHeight),
            2 => Ok(Self::NewRound),
            3 => Ok(Self::Propose),
            4 => Ok(Self::Prevote),
            5 => Ok(Self::PrevoteWait),
            6 => Ok(Self::Precommit),
            7 => Ok(Self::PrecommitWait),
            8 => Ok(Self::Commit),
            tag => Err(CodecError::InvalidEnum("RoundStep", tag)),
        }
    }
}

impl FixedSize for RoundStep {
    const SIZE: usize = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_codec::{DecodeExt, Encode};

    #[test]
    fn test_step_order() {
        assert!(RoundStep::NewHeight < RoundStep::Propose);
        assert!(RoundStep::PrecommitWait < RoundStep::Commit);
        assert_eq!(RoundStep::Prevote.to_string(), "RoundStepPrevote");
        assert_eq!(
            RoundStep::decode(RoundStep::Commit.encode()).unwrap(),
            RoundStep::Commit
        );
        assert!(RoundStep::decode(&[9u8][..]).is_err());
    }
}
