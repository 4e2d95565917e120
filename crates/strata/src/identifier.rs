// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire identifiers: `/group/scheme/type/process/thread/`.
//!
//! Subscriptions are stored under a prefix of the full identifier, so a
//! subscription matches an inbound message by plain byte-prefix comparison:
//!
//! ```text
//!   published   /nav/7/nav.Fix/4242/3/
//!   subscribed  /nav/7/nav.Fix/            (ProcessThreadWildcard)
//!   cached base /nav/7/nav.Fix/4242/       (ThreadWildcard)
//! ```

use crate::error::{Error, Result};
use crate::scheme::MarshallingScheme;
use std::fmt;

/// How many trailing components to omit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierWildcard {
    NoWildcards,
    ThreadWildcard,
    ProcessThreadWildcard,
}

/// Parsed form of an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub group: String,
    pub scheme: i32,
    pub type_name: String,
    pub process: Option<u32>,
    pub thread: Option<u64>,
}

/// Rejects components that would corrupt the identifier framing.
pub fn check_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentifier(format!("empty {kind}")));
    }
    if value.contains('/') || value.contains('\0') {
        return Err(Error::InvalidIdentifier(format!(
            "{kind} {value:?} contains '/' or NUL"
        )));
    }
    Ok(())
}

/// Builds the canonical identifier string.
///
/// `process` and `thread` are ignored when the wildcard level omits them.
/// Published identifiers (`NoWildcards`) must carry a concrete scheme.
pub fn make_identifier(
    type_name: &str,
    scheme: i32,
    group: &str,
    wildcard: IdentifierWildcard,
    process: u32,
    thread: u64,
) -> Result<String> {
    check_component("group", group)?;
    check_component("type name", type_name)?;
    if wildcard == IdentifierWildcard::NoWildcards && !MarshallingScheme::is_concrete(scheme) {
        return Err(Error::SchemeMismatch(scheme));
    }

    let mut id = String::with_capacity(group.len() + type_name.len() + 32);
    id.push('/');
    id.push_str(group);
    id.push('/');
    id.push_str(&scheme.to_string());
    id.push('/');
    id.push_str(type_name);
    id.push('/');
    match wildcard {
        IdentifierWildcard::ProcessThreadWildcard => {}
        IdentifierWildcard::ThreadWildcard => {
            id.push_str(&process.to_string());
            id.push('/');
        }
        IdentifierWildcard::NoWildcards => {
            id.push_str(&process.to_string());
            id.push('/');
            id.push_str(&thread.to_string());
            id.push('/');
        }
    }
    Ok(id)
}

/// Appends the thread component to a `ThreadWildcard` base.
pub fn append_thread(base: &str, thread: u64) -> String {
    let mut id = String::with_capacity(base.len() + 21);
    id.push_str(base);
    id.push_str(&thread.to_string());
    id.push('/');
    id
}

impl Identifier {
    /// Parses an identifier; missing trailing fields become wildcards.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = |why: &str| Error::InvalidIdentifier(format!("{text:?}: {why}"));

        let inner = text
            .strip_prefix('/')
            .ok_or_else(|| malformed("missing leading '/'"))?
            .strip_suffix('/')
            .ok_or_else(|| malformed("missing terminating '/'"))?;

        let parts: Vec<&str> = inner.split('/').collect();
        if parts.len() < 3 {
            return Err(malformed("too few fields"));
        }
        if parts.len() > 5 {
            return Err(malformed("too many fields"));
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(malformed("empty field"));
        }

        let scheme = parts[1]
            .parse::<i32>()
            .map_err(|_| malformed("scheme is not an integer"))?;
        let process = parts
            .get(3)
            .map(|p| p.parse::<u32>())
            .transpose()
            .map_err(|_| malformed("process is not an integer"))?;
        let thread = parts
            .get(4)
            .map(|t| t.parse::<u64>())
            .transpose()
            .map_err(|_| malformed("thread is not an integer"))?;

        Ok(Self {
            group: parts[0].to_owned(),
            scheme,
            type_name: parts[2].to_owned(),
            process,
            thread,
        })
    }

    pub fn wildcard(&self) -> IdentifierWildcard {
        match (self.process, self.thread) {
            (Some(_), Some(_)) => IdentifierWildcard::NoWildcards,
            (Some(_), None) => IdentifierWildcard::ThreadWildcard,
            _ => IdentifierWildcard::ProcessThreadWildcard,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}/", self.group, self.scheme, self.type_name)?;
        if let Some(process) = self.process {
            write!(f, "{process}/")?;
            if let Some(thread) = self.thread {
                write!(f, "{thread}/")?;
            }
        }
        Ok(())
    }
}
