// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wire format of the reduction protocol.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::CollectiveError;

/// Handler on the home node that folds contributions.
pub(crate) const CONTRIBUTE_HANDLER: &str = "_pgas_reduce_contribute";

/// Handler on every node that wakes the local caller with the result.
pub(crate) const RESULT_HANDLER: &str = "_pgas_reduce_result";

/// One node's contribution to a round, sent to the home node.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Contribution {
    pub tag: String,
    pub body: Vec<u8>,
}

impl Contribution {
    /// Read just the leading tag of an encoded contribution.
    pub(crate) fn peek_tag(bytes: &[u8]) -> Option<String> {
        decode::<String>(bytes).ok()
    }
}

/// Result of a round, broadcast by the home node. A round whose contributions
/// could not be folded completes with the error text instead of a value.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Outcome {
    pub tag: String,
    pub result: Result<Vec<u8>, String>,
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CollectiveError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CollectiveError::Codec(e.to_string()))
}

pub(crate) fn encode_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CollectiveError> {
    encode(value).map(Bytes::from)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CollectiveError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CollectiveError::Codec(e.to_string()))?;
    Ok(value)
}
