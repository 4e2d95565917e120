// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logical publish/subscribe channels.

use std::borrow::Cow;
use std::fmt;

/// Numeric discriminator meaning "no numeric group".
pub const INVALID_NUMERIC_GROUP: u32 = 0;

/// Name prefix of the groups the framework itself subscribes to.
pub const RESERVED_PREFIX: &str = "strata::";

/// Named channel plus an optional numeric discriminator.
///
/// Static groups are `const`-constructible and typically declared once:
///
/// ```
/// use strata::Group;
/// const NAV: Group = Group::new("nav");
/// assert_eq!(NAV.name(), "nav");
/// ```
///
/// Dynamic groups own their name and are built at runtime with
/// [`Group::dynamic`]. Equality and ordering use (name, numeric) regardless of
/// how the name is stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Group {
    name: Cow<'static, str>,
    numeric: u32,
}

impl Group {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            numeric: INVALID_NUMERIC_GROUP,
        }
    }

    pub const fn with_numeric(name: &'static str, numeric: u32) -> Self {
        Self {
            name: Cow::Borrowed(name),
            numeric,
        }
    }

    pub fn dynamic(name: impl Into<String>) -> Self {
        Self::dynamic_with_numeric(name, INVALID_NUMERIC_GROUP)
    }

    pub fn dynamic_with_numeric(name: impl Into<String>, numeric: u32) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            numeric,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn numeric(&self) -> u32 {
        self.numeric
    }

    /// Group component used in wire identifiers: the name, or `name::numeric`
    /// when a numeric discriminator is set.
    pub fn wire_name(&self) -> Cow<'_, str> {
        if self.has_numeric() {
            Cow::Owned(format!("{}::{}", self.name, self.numeric))
        } else {
            Cow::Borrowed(&self.name)
        }
    }

    pub fn has_numeric(&self) -> bool {
        self.numeric != INVALID_NUMERIC_GROUP
    }

    /// Framework group (shutdown, joinable, forwarding). Registrations on
    /// reserved groups survive `unsubscribe_all`.
    pub fn is_reserved(&self) -> bool {
        self.name.starts_with(RESERVED_PREFIX)
    }

    /// True when the name is heap-owned.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.name, Cow::Owned(_))
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_numeric() {
            write!(f, "{}::{}", self.name, self.numeric)
        } else {
            f.write_str(&self.name)
        }
    }
}

impl From<&'static str> for Group {
    fn from(name: &'static str) -> Self {
        Group::new(name)
    }
}

impl From<String> for Group {
    fn from(name: String) -> Self {
        Group::dynamic(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGET: Group = Group::new("widget");

    #[test]
    fn test_static_equals_dynamic() {
        let dynamic = Group::dynamic(String::from("widget"));
        assert_eq!(WIDGET, dynamic);
        assert!(!WIDGET.is_dynamic());
        assert!(dynamic.is_dynamic());
    }

    #[test]
    fn test_numeric_discriminates() {
        let a = Group::with_numeric("status", 1);
        let b = Group::with_numeric("status", 2);
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.to_string(), "status::1");
        assert_eq!(Group::new("status").to_string(), "status");
        assert_eq!(a.wire_name(), "status::1");
        assert_eq!(Group::new("status").wire_name(), "status");
        assert!(Group::new("strata::shutdown").is_reserved());
        assert!(!Group::new("status").is_reserved());
    }
}
