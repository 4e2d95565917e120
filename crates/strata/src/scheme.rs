// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Marshalling scheme tags and their compile-time markers.
//!
//! A scheme is an integer written into every identifier. Markers implementing
//! [`Scheme`] select the codec statically; the integer travels on the wire.

use std::collections::BTreeSet;

/// Integer scheme tags.
pub struct MarshallingScheme;

impl MarshallingScheme {
    pub const NULL_SCHEME: i32 = -2;
    /// Subscription wildcard only. Never published.
    pub const ALL_SCHEMES: i32 = -1;
    pub const CSTR: i32 = 0;
    pub const PROTOBUF: i32 = 1;
    pub const DCCL: i32 = 2;
    pub const CAPTN_PROTO: i32 = 3;
    pub const MSGPACK: i32 = 4;
    pub const CXX_OBJECT: i32 = 5;
    pub const MAVLINK: i32 = 6;
    pub const JSON: i32 = 7;

    const NAMES: [(i32, &'static str); 10] = [
        (Self::NULL_SCHEME, "NULL_SCHEME"),
        (Self::ALL_SCHEMES, "ALL_SCHEMES"),
        (Self::CSTR, "CSTR"),
        (Self::PROTOBUF, "PROTOBUF"),
        (Self::DCCL, "DCCL"),
        (Self::CAPTN_PROTO, "CAPTN_PROTO"),
        (Self::MSGPACK, "MSGPACK"),
        (Self::CXX_OBJECT, "CXX_OBJECT"),
        (Self::MAVLINK, "MAVLINK"),
        (Self::JSON, "JSON"),
    ];

    /// Canonical name of a known scheme.
    pub fn name(scheme: i32) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(id, _)| *id == scheme)
            .map(|(_, name)| *name)
    }

    /// Canonical name, or the decimal value for unknown schemes.
    pub fn display(scheme: i32) -> String {
        Self::name(scheme).map_or_else(|| scheme.to_string(), str::to_owned)
    }

    /// Parses a canonical name (case-insensitive) or a decimal integer.
    pub fn parse(text: &str) -> Option<i32> {
        let upper = text.trim().to_ascii_uppercase();
        Self::NAMES
            .iter()
            .find(|(_, name)| *name == upper)
            .map(|(id, _)| *id)
            .or_else(|| upper.parse().ok())
    }

    /// True for schemes that may appear in a published identifier.
    pub fn is_concrete(scheme: i32) -> bool {
        scheme >= 0
    }

    /// Scheme-set membership with `ALL_SCHEMES` matching everything.
    pub fn set_matches(set: &BTreeSet<i32>, scheme: i32) -> bool {
        set.contains(&Self::ALL_SCHEMES) || set.contains(&scheme)
    }
}

/// Compile-time scheme marker.
pub trait Scheme: 'static {
    const ID: i32;
}

/// NUL-free UTF-8 text.
pub enum Cstr {}

/// Google protocol buffers via `prost`.
pub enum Protobuf {}

/// JSON via `serde_json`.
pub enum Json {}

impl Scheme for Cstr {
    const ID: i32 = MarshallingScheme::CSTR;
}

impl Scheme for Protobuf {
    const ID: i32 = MarshallingScheme::PROTOBUF;
}

impl Scheme for Json {
    const ID: i32 = MarshallingScheme::JSON;
}
