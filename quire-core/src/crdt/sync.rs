//! Document sync messages and yrs helpers shared by clients and the relay.
//!
//! Wire format (the payload part of a multiplexed frame):
//! ```text
//! ┌──────┬──────────────────────────────┐
//! │ tag  │ body                         │
//! │ 1 B  │ state vector / update bytes  │
//! └──────┴──────────────────────────────┘
//! tag 0 = SyncStep1(state vector)
//! tag 1 = SyncStep2(diff update)
//! tag 2 = Update(incremental update)
//! ```

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::CrdtError;

/// A v1 update carrying no blocks and an empty delete set.
pub const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocMessage {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
}

impl DocMessage {
    const TAG_STEP1: u8 = 0;
    const TAG_STEP2: u8 = 1;
    const TAG_UPDATE: u8 = 2;

    pub fn encode(&self) -> Vec<u8> {
        let (tag, body) = match self {
            DocMessage::SyncStep1(b) => (Self::TAG_STEP1, b),
            DocMessage::SyncStep2(b) => (Self::TAG_STEP2, b),
            DocMessage::Update(b) => (Self::TAG_UPDATE, b),
        };
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(tag);
        out.extend_from_slice(body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| CrdtError::Decode("empty sync message".into()))?;
        let body = body.to_vec();
        match *tag {
            Self::TAG_STEP1 => Ok(DocMessage::SyncStep1(body)),
            Self::TAG_STEP2 => Ok(DocMessage::SyncStep2(body)),
            Self::TAG_UPDATE => Ok(DocMessage::Update(body)),
            other => Err(CrdtError::Decode(format!("unknown sync message tag {other}"))),
        }
    }
}

pub fn state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

pub fn encode_diff(doc: &Doc, remote_state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
    let sv = StateVector::decode_v1(remote_state_vector)
        .map_err(|e| CrdtError::Decode(e.to_string()))?;
    let txn = doc.transact();
    Ok(txn.encode_diff_v1(&sv))
}

pub fn full_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

pub fn apply_update(doc: &Doc, update: &[u8]) -> Result<(), CrdtError> {
    let update = Update::decode_v1(update).map_err(|e| CrdtError::Decode(e.to_string()))?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| CrdtError::Apply(e.to_string()))
}

pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE_V1
}
