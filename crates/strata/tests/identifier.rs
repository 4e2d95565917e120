// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identifier round-trip and wildcard matching.

use strata::identifier::{make_identifier, Identifier, IdentifierWildcard};
use strata::MarshallingScheme;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_.:-";

fn component(rng: &mut fastrand::Rng) -> String {
    let len = rng.usize(1..16);
    (0..len)
        .map(|_| CHARSET[rng.usize(..CHARSET.len())] as char)
        .collect()
}

#[test]
fn test_round_trip_random_components() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    for _ in 0..500 {
        let group = component(&mut rng);
        let type_name = component(&mut rng);
        let scheme = rng.i32(0..=MarshallingScheme::JSON);
        let process = rng.u32(..);
        let thread = rng.u64(..);

        let text = make_identifier(
            &type_name,
            scheme,
            &group,
            IdentifierWildcard::NoWildcards,
            process,
            thread,
        )
        .expect("valid components");
        let parsed = Identifier::parse(&text).expect("parse");

        assert_eq!(parsed.group, group);
        assert_eq!(parsed.scheme, scheme);
        assert_eq!(parsed.type_name, type_name);
        assert_eq!(parsed.process, Some(process));
        assert_eq!(parsed.thread, Some(thread));
        assert_eq!(parsed.to_string(), text);
    }
}

#[test]
fn test_wildcard_subscription_matches_any_origin() {
    let mut rng = fastrand::Rng::with_seed(7);
    let subscription = make_identifier(
        "nav.Fix",
        MarshallingScheme::PROTOBUF,
        "nav",
        IdentifierWildcard::ProcessThreadWildcard,
        0,
        0,
    )
    .expect("subscription id");

    for _ in 0..100 {
        let published = make_identifier(
            "nav.Fix",
            MarshallingScheme::PROTOBUF,
            "nav",
            IdentifierWildcard::NoWildcards,
            rng.u32(..),
            rng.u64(..),
        )
        .expect("published id");
        assert!(published.starts_with(&subscription));
    }

    for other_group in ["navx", "na", "other"] {
        let published = make_identifier(
            "nav.Fix",
            MarshallingScheme::PROTOBUF,
            other_group,
            IdentifierWildcard::NoWildcards,
            1,
            1,
        )
        .expect("published id");
        assert!(!published.starts_with(&subscription), "{published}");
    }
}

#[test]
fn test_thread_wildcard_is_prefix_of_full() {
    let base = make_identifier(
        "CSTR",
        MarshallingScheme::CSTR,
        "chat",
        IdentifierWildcard::ThreadWildcard,
        42,
        0,
    )
    .expect("base");
    assert_eq!(base, "/chat/0/CSTR/42/");
    let full = strata::identifier::append_thread(&base, 9);
    assert_eq!(full, "/chat/0/CSTR/42/9/");
    assert_eq!(
        Identifier::parse(&base).expect("parse").wildcard(),
        IdentifierWildcard::ThreadWildcard
    );
}

#[test]
fn test_publication_needs_concrete_scheme() {
    let err = make_identifier(
        "CSTR",
        MarshallingScheme::ALL_SCHEMES,
        "chat",
        IdentifierWildcard::NoWildcards,
        1,
        1,
    )
    .expect_err("wildcard scheme");
    assert!(matches!(err, strata::Error::SchemeMismatch(-1)));
}
