// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serialization registry.
//!
//! `SerializerParser<S>` is implemented for every (type, scheme) pair the
//! middleware can carry across a process boundary. Blanket implementations
//! cover `prost` messages and serde types; `String` covers CSTR.

use crate::error::CodecError;
use crate::scheme::{Cstr, Json, Protobuf, Scheme};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;

/// Encode/decode functions and canonical type name for scheme `S`.
pub trait SerializerParser<S: Scheme>: Sized + 'static {
    /// Name written into identifiers. Must be identical in every process.
    fn type_name() -> Cow<'static, str>;

    fn serialize(&self) -> Result<Vec<u8>, CodecError>;

    fn parse(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// Default scheme for a message type, used by `publish`/`subscribe`.
///
/// Types that travel under several schemes use the `*_with` variants and
/// name the scheme explicitly.
pub trait Message: Sized + 'static {
    type Scheme: Scheme;
}

/// Stable name for serde types carried as JSON.
pub trait JsonType {
    const JSON_TYPE: &'static str;
}

impl SerializerParser<Cstr> for String {
    fn type_name() -> Cow<'static, str> {
        Cow::Borrowed("CSTR")
    }

    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_bytes().to_vec())
    }

    fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(String::from_utf8(bytes.to_vec())?)
    }
}

impl Message for String {
    type Scheme = Cstr;
}

impl<T> SerializerParser<Protobuf> for T
where
    T: prost::Message + prost::Name + Default + 'static,
{
    fn type_name() -> Cow<'static, str> {
        Cow::Owned(T::full_name())
    }

    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(T::decode(bytes)?)
    }
}

impl<T> SerializerParser<Json> for T
where
    T: Serialize + DeserializeOwned + JsonType + 'static,
{
    fn type_name() -> Cow<'static, str> {
        Cow::Borrowed(T::JSON_TYPE)
    }

    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
