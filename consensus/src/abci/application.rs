use super::types::*;
use bytes::Bytes;
use halcyon_codec::{DecodeExt, Encode};
use halcyon_cryptography::{
    utils::{from_hex, hex},
    PublicKey,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Response code of a malformed transaction.
pub const CODE_TYPE_ENCODING_ERROR: u32 = 1;

/// Response code of a rejected validator update.
pub const CODE_TYPE_UNAUTHORIZED: u32 = 4;

/// Prefix of transactions that update the validator set.
pub const VALIDATOR_SET_CHANGE_PREFIX: &str = "val:";

/// The deterministic state machine driven by consensus.
///
/// Every method has a no-op default so implementations only override what they use.
pub trait Application: Send + 'static {
    fn info(&mut self, _req: RequestInfo) -> ResponseInfo {
        ResponseInfo::default()
    }

    fn init_chain(&mut self, _req: RequestInitChain) -> ResponseInitChain {
        ResponseInitChain::default()
    }

    fn begin_block(&mut self, _req: RequestBeginBlock) -> ResponseBeginBlock {
        ResponseBeginBlock::default()
    }

    fn deliver_tx(&mut self, _req: RequestDeliverTx) -> ResponseDeliverTx {
        ResponseDeliverTx::default()
    }

    fn end_block(&mut self, _req: RequestEndBlock) -> ResponseEndBlock {
        ResponseEndBlock::default()
    }

    fn commit(&mut self) -> ResponseCommit {
        ResponseCommit::default()
    }

    fn check_tx(&mut self, _req: RequestCheckTx) -> ResponseCheckTx {
        ResponseCheckTx::default()
    }

    fn query(&mut self, _req: RequestQuery) -> ResponseQuery {
        ResponseQuery::default()
    }

    fn list_snapshots(&mut self) -> ResponseListSnapshots {
        ResponseListSnapshots::default()
    }

    fn offer_snapshot(&mut self, _req: RequestOfferSnapshot) -> ResponseOfferSnapshot {
        ResponseOfferSnapshot::default()
    }

    fn load_snapshot_chunk(&mut self, _req: RequestLoadSnapshotChunk) -> ResponseLoadSnapshotChunk {
        ResponseLoadSnapshotChunk::default()
    }

    fn apply_snapshot_chunk(&mut self, _req: RequestApplySnapshotChunk) -> ResponseApplySnapshotChunk {
        ResponseApplySnapshotChunk::default()
    }
}

/// Encodes a validator update as a transaction understood by [KvStoreApplication].
pub fn make_validator_tx(pub_key: &PublicKey, power: i64) -> Bytes {
    Bytes::from(format!(
        "{VALIDATOR_SET_CHANGE_PREFIX}{}!{power}",
        hex(&pub_key.encode())
    ))
}

/// Key-value store application.
///
/// Transactions are `key=value` (or `key`, stored as `key=key`) and `val:<key>!<power>`
/// validator updates. The application hash is the big-endian number of stored entries.
#[derive(Clone, Debug, Default)]
pub struct KvStoreApplication {
    store: BTreeMap<Bytes, Bytes>,
    size: u64,
    height: u64,
    app_hash: Bytes,
    retain_blocks: u64,

    validators: BTreeMap<PublicKey, i64>,
    pending_updates: Vec<ValidatorUpdate>,
}

impl KvStoreApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks consensus to keep only the last `retain_blocks` blocks (zero keeps all).
    pub fn with_retain_blocks(retain_blocks: u64) -> Self {
        Self {
            retain_blocks,
            ..Self::default()
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.store.get(key)
    }

    pub fn validators(&self) -> Vec<ValidatorUpdate> {
        self.validators
            .iter()
            .map(|(pub_key, power)| ValidatorUpdate {
                pub_key: pub_key.clone(),
                power: *power,
            })
            .collect()
    }

    fn update_validator(&mut self, update: ValidatorUpdate) -> ResponseDeliverTx {
        if update.power == 0 {
            if self.validators.remove(&update.pub_key).is_none() {
                return ResponseDeliverTx {
                    code: CODE_TYPE_UNAUTHORIZED,
                    log: format!("cannot remove non-existent validator {}", update.pub_key),
                    ..Default::default()
                };
            }
        } else {
            self.validators.insert(update.pub_key.clone(), update.power);
        }
        self.pending_updates.push(update);
        ResponseDeliverTx::default()
    }

    fn parse_validator_tx(tx: &str) -> Option<ValidatorUpdate> {
        let (pub_key, power) = tx.split_once('!')?;
        let pub_key = PublicKey::decode(from_hex(pub_key)?.as_slice()).ok()?;
        let power = power.parse::<i64>().ok()?;
        Some(ValidatorUpdate { pub_key, power })
    }
}

impl Application for KvStoreApplication {
    fn info(&mut self, _req: RequestInfo) -> ResponseInfo {
        ResponseInfo {
            data: format!("{{\"size\":{}}}", self.size),
            version: env!("CARGO_PKG_VERSION").to_string(),
            app_version: 1,
            last_block_height: self.height,
            last_block_app_hash: self.app_hash.clone(),
        }
    }

    fn init_chain(&mut self, req: RequestInitChain) -> ResponseInitChain {
        for update in req.validators {
            self.validators.insert(update.pub_key, update.power);
        }
        ResponseInitChain::default()
    }

    fn begin_block(&mut self, _req: RequestBeginBlock) -> ResponseBeginBlock {
        self.pending_updates.clear();
        ResponseBeginBlock::default()
    }

    fn deliver_tx(&mut self, req: RequestDeliverTx) -> ResponseDeliverTx {
        if let Some(rest) = req.tx.strip_prefix(VALIDATOR_SET_CHANGE_PREFIX.as_bytes()) {
            let update = std::str::from_utf8(rest)
                .ok()
                .and_then(Self::parse_validator_tx);
            return match update {
                Some(update) => self.update_validator(update),
                None => ResponseDeliverTx {
                    code: CODE_TYPE_ENCODING_ERROR,
                    log: "expected 'val:pubkey!power'".into(),
                    ..Default::default()
                },
            };
        }

        let (key, value) = match req.tx.iter().position(|b| *b == b'=') {
            Some(index) => (req.tx.slice(..index), req.tx.slice(index + 1..)),
            None => (req.tx.clone(), req.tx.clone()),
        };
        if self.store.insert(key.clone(), value.clone()).is_none() {
            self.size += 1;
        }
        ResponseDeliverTx {
            events: vec![AbciEvent {
                kind: "app".into(),
                attributes: vec![
                    EventAttribute {
                        key: Bytes::from_static(b"key"),
                        value: key,
                    },
                    EventAttribute {
                        key: Bytes::from_static(b"value"),
                        value,
                    },
                ],
            }],
            ..Default::default()
        }
    }

    fn end_block(&mut self, _req: RequestEndBlock) -> ResponseEndBlock {
        ResponseEndBlock {
            validator_updates: std::mem::take(&mut self.pending_updates),
            ..Default::default()
        }
    }

    fn commit(&mut self) -> ResponseCommit {
        self.app_hash = Bytes::copy_from_slice(&self.size.to_be_bytes());
        self.height += 1;
        debug!(height = self.height, size = self.size, "committed kvstore");
        let retain_height = if self.retain_blocks > 0 && self.height >= self.retain_blocks {
            self.height - self.retain_blocks + 1
        } else {
            0
        };
        ResponseCommit {
            data: self.app_hash.clone(),
            retain_height,
        }
    }

    fn check_tx(&mut self, _req: RequestCheckTx) -> ResponseCheckTx {
        ResponseCheckTx {
            gas_wanted: 1,
            ..Default::default()
        }
    }

    fn query(&mut self, req: RequestQuery) -> ResponseQuery {
        match self.store.get(&req.data) {
            Some(value) => ResponseQuery {
                log: "exists".into(),
                key: req.data,
                value: value.clone(),
                height: self.height,
                ..Default::default()
            },
            None => ResponseQuery {
                log: "does not exist".into(),
                key: req.data,
                height: self.height,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_cryptography::{KeyType, PrivateKey};

    fn deliver(app: &mut KvStoreApplication, tx: &'static [u8]) -> ResponseDeliverTx {
        app.deliver_tx(RequestDeliverTx {
            tx: Bytes::from_static(tx),
        })
    }

    #[test]
    fn test_kvstore_key_value() {
        let mut app = KvStoreApplication::new();
        app.begin_block(RequestBeginBlock::default());
        assert!(deliver(&mut app, b"abc=def").is_ok());
        assert!(deliver(&mut app, b"ghi").is_ok());
        assert!(deliver(&mut app, b"abc=xyz").is_ok());
        app.end_block(RequestEndBlock { height: 1 });
        let commit = app.commit();
        assert_eq!(commit.data.as_ref(), &2u64.to_be_bytes());

        let info = app.info(RequestInfo::default());
        assert_eq!(info.last_block_height, 1);
        assert_eq!(info.last_block_app_hash, commit.data);

        let res = app.query(RequestQuery {
            data: Bytes::from_static(b"abc"),
            ..Default::default()
        });
        assert_eq!(res.value.as_ref(), b"xyz");
        assert_eq!(app.get(b"ghi").unwrap().as_ref(), b"ghi");
    }

    #[test]
    fn test_kvstore_validator_updates() {
        let mut app = KvStoreApplication::new();
        let pub_key = PrivateKey::from_seed(KeyType::Ed25519, 3).public_key();
        app.begin_block(RequestBeginBlock::default());
        let res = app.deliver_tx(RequestDeliverTx {
            tx: make_validator_tx(&pub_key, 7),
        });
        assert!(res.is_ok());
        let end = app.end_block(RequestEndBlock { height: 1 });
        assert_eq!(end.validator_updates.len(), 1);
        assert_eq!(end.validator_updates[0].power, 7);
        assert_eq!(app.validators().len(), 1);

        // Malformed and unknown removals are rejected
        assert_eq!(
            deliver(&mut app, b"val:zz!1").code,
            CODE_TYPE_ENCODING_ERROR
        );
        let other = PrivateKey::from_seed(KeyType::Ed25519, 4).public_key();
        let res = app.deliver_tx(RequestDeliverTx {
            tx: make_validator_tx(&other, 0),
        });
        assert_eq!(res.code, CODE_TYPE_UNAUTHORIZED);
    }

    #[test]
    fn test_kvstore_retain_height() {
        let mut app = KvStoreApplication::with_retain_blocks(2);
        assert_eq!(app.commit().retain_height, 0);
        assert_eq!(app.commit().retain_height, 1);
        assert_eq!(app.commit().retain_height, 2);
    }
}
