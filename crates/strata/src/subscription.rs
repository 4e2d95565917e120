// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type-erased subscriptions and the per-transporter subscription store.
//!
//! A typed subscription is turned into a [`SerializationHandler`] trait object
//! by [`SerializationSubscription::new`]: the concrete decode function and the
//! user callback are captured, and the store only ever sees
//! `post(bytes)`. The store keys entries by the `ProcessThreadWildcard`
//! identifier so that matching an inbound message is a byte-prefix test.

use crate::codec::SerializerParser;
use crate::error::{CodecError, Result};
use crate::group::Group;
use crate::scheme::{MarshallingScheme, Scheme};
use regex::Regex;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::rc::Rc;

/// Derives the group a decoded instance belongs to.
pub type GroupFunc<D> = Rc<dyn Fn(&D) -> Group>;

pub(crate) type SharedHandler<D> = Rc<RefCell<dyn FnMut(&D)>>;

/// Callback for regex subscriptions: (payload, scheme, type name, group name).
pub type RegexHandler = Rc<RefCell<dyn FnMut(&[u8], i32, &str, &str)>>;

/// Type-erased subscription entry.
pub trait SerializationHandler {
    /// Decodes `bytes` and dispatches. Returns `Ok(false)` when the instance
    /// was filtered out by the group extractor.
    fn post(&self, bytes: &[u8]) -> std::result::Result<bool, CodecError>;

    fn scheme(&self) -> i32;

    fn type_name(&self) -> &str;

    fn group(&self) -> &Group;
}

/// Calls `handler` unless the group extractor disagrees with `group`.
pub(crate) fn dispatch<D>(
    handler: &SharedHandler<D>,
    group_func: Option<&GroupFunc<D>>,
    group: &Group,
    data: &D,
) -> bool {
    if let Some(group_of) = group_func {
        if group_of(data) != *group {
            return false;
        }
    }
    match handler.try_borrow_mut() {
        Ok(mut f) => {
            (*f)(data);
            true
        }
        Err(_) => {
            log::warn!("[subscription] re-entrant delivery on '{}' dropped", group);
            false
        }
    }
}

/// Typed subscription for data `D` under scheme `S`.
pub struct SerializationSubscription<S, D> {
    handler: SharedHandler<D>,
    group: Group,
    type_name: String,
    group_func: Option<GroupFunc<D>>,
    _scheme: PhantomData<S>,
}

impl<S, D> SerializationSubscription<S, D>
where
    S: Scheme,
    D: SerializerParser<S>,
{
    pub fn new<F>(group: Group, handler: F, group_func: Option<GroupFunc<D>>) -> Self
    where
        F: FnMut(&D) + 'static,
    {
        let handler: SharedHandler<D> = Rc::new(RefCell::new(handler));
        Self::from_shared(group, handler, group_func)
    }

    pub(crate) fn from_shared(
        group: Group,
        handler: SharedHandler<D>,
        group_func: Option<GroupFunc<D>>,
    ) -> Self {
        Self {
            handler,
            group,
            type_name: D::type_name().into_owned(),
            group_func,
            _scheme: PhantomData,
        }
    }

    /// Closure for same-process delivery of already-decoded instances.
    /// Shares the callback and group filter with the serialized path.
    pub(crate) fn local_dispatcher(&self) -> impl FnMut(&D) + 'static {
        let handler = Rc::clone(&self.handler);
        let group_func = self.group_func.clone();
        let group = self.group.clone();
        move |data: &D| {
            dispatch(&handler, group_func.as_ref(), &group, data);
        }
    }
}

impl<S, D> SerializationHandler for SerializationSubscription<S, D>
where
    S: Scheme,
    D: SerializerParser<S>,
{
    fn post(&self, bytes: &[u8]) -> std::result::Result<bool, CodecError> {
        let data = D::parse(bytes)?;
        Ok(dispatch(
            &self.handler,
            self.group_func.as_ref(),
            &self.group,
            &data,
        ))
    }

    fn scheme(&self) -> i32 {
        S::ID
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn group(&self) -> &Group {
        &self.group
    }
}

/// Scheme set plus full-match type and group patterns.
#[derive(Debug, Clone)]
pub struct RegexFilter {
    schemes: BTreeSet<i32>,
    type_regex: Regex,
    group_regex: Regex,
}

impl RegexFilter {
    /// Patterns must match the whole type name / group name.
    pub fn new(
        schemes: impl IntoIterator<Item = i32>,
        type_pattern: &str,
        group_pattern: &str,
    ) -> Result<Self> {
        Ok(Self {
            schemes: schemes.into_iter().collect(),
            type_regex: Regex::new(&format!("^(?:{type_pattern})$"))?,
            group_regex: Regex::new(&format!("^(?:{group_pattern})$"))?,
        })
    }

    pub fn matches(&self, scheme: i32, type_name: &str, group: &str) -> bool {
        MarshallingScheme::set_matches(&self.schemes, scheme)
            && self.type_regex.is_match(type_name)
            && self.group_regex.is_match(group)
    }

    pub fn schemes(&self) -> &BTreeSet<i32> {
        &self.schemes
    }
}

/// Regex subscription with its callback.
#[derive(Clone)]
pub struct RegexSubscription {
    filter: RegexFilter,
    handler: RegexHandler,
}

impl RegexSubscription {
    pub fn new<F>(filter: RegexFilter, handler: F) -> Self
    where
        F: FnMut(&[u8], i32, &str, &str) + 'static,
    {
        Self {
            filter,
            handler: Rc::new(RefCell::new(handler)),
        }
    }

    pub fn filter(&self) -> &RegexFilter {
        &self.filter
    }

    /// Dispatches when the filter matches. Returns whether it did.
    pub fn post(&self, bytes: &[u8], scheme: i32, type_name: &str, group: &str) -> bool {
        if !self.filter.matches(scheme, type_name, group) {
            return false;
        }
        match self.handler.try_borrow_mut() {
            Ok(mut f) => {
                (*f)(bytes, scheme, type_name, group);
                true
            }
            Err(_) => false,
        }
    }
}

/// Store entry: a local handler or a route back to a forwarding thread.
#[derive(Clone)]
pub(crate) enum StoreEntry {
    Local(Rc<dyn SerializationHandler>),
    Forwarded { thread_id: u64, delivery_group: Group },
}

impl StoreEntry {
    pub(crate) fn is_local(&self) -> bool {
        matches!(self, StoreEntry::Local(_))
    }

    pub(crate) fn is_forwarded_from(&self, thread: u64) -> bool {
        matches!(self, StoreEntry::Forwarded { thread_id, .. } if *thread_id == thread)
    }
}

/// Identifier-keyed subscription table.
///
/// Entries are kept in registration order; each identifier carries a
/// reference count so callers know when to subscribe or unsubscribe
/// externally.
#[derive(Default)]
pub struct SubscriptionStore {
    entries: Vec<(String, StoreEntry)>,
    counts: HashMap<String, usize>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry. Returns true when `identifier` had no entry before.
    pub(crate) fn insert(&mut self, identifier: String, entry: StoreEntry) -> bool {
        let count = self.counts.entry(identifier.clone()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        self.entries.push((identifier, entry));
        first
    }

    /// Removes the most recent entry under `identifier` accepted by `pred`.
    ///
    /// Returns `None` when nothing matched, otherwise whether the identifier
    /// is now unused.
    pub(crate) fn remove_last(
        &mut self,
        identifier: &str,
        pred: impl Fn(&StoreEntry) -> bool,
    ) -> Option<bool> {
        let index = self
            .entries
            .iter()
            .rposition(|(id, entry)| id == identifier && pred(entry))?;
        self.entries.remove(index);
        Some(self.release(identifier))
    }

    /// Removes every entry accepted by `pred`. Returns identifiers now unused.
    pub(crate) fn remove_all(&mut self, pred: impl Fn(&StoreEntry) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|(id, entry)| {
            if pred(entry) {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        let mut unused = Vec::new();
        for id in removed {
            if self.release(&id) {
                unused.push(id);
            }
        }
        unused
    }

    fn release(&mut self, identifier: &str) -> bool {
        match self.counts.get_mut(identifier) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(identifier);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every entry whose identifier is a prefix of `message_id`,
    /// in registration order.
    pub(crate) fn matching(&self, message_id: &[u8]) -> Vec<StoreEntry> {
        let matched: Vec<&str> = self
            .counts
            .keys()
            .filter(|id| message_id.starts_with(id.as_bytes()))
            .map(String::as_str)
            .collect();
        if matched.is_empty() {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|(id, _)| matched.contains(&id.as_str()))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Number of entries (local and forwarded).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct identifiers.
    pub fn identifier_count(&self) -> usize {
        self.counts.len()
    }

    pub fn contains_identifier(&self, identifier: &str) -> bool {
        self.counts.contains_key(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::Cstr;
    use std::cell::Cell;

    const CHAT: Group = Group::new("chat");

    fn local(counter: &Rc<Cell<usize>>) -> StoreEntry {
        let c = Rc::clone(counter);
        StoreEntry::Local(Rc::new(SerializationSubscription::<Cstr, String>::new(
            CHAT,
            move |_| c.set(c.get() + 1),
            None,
        )))
    }

    #[test]
    fn test_refcounted_identifiers() {
        let hits = Rc::new(Cell::new(0));
        let mut store = SubscriptionStore::new();
        assert!(store.insert("/chat/0/CSTR/".into(), local(&hits)));
        assert!(!store.insert("/chat/0/CSTR/".into(), local(&hits)));
        assert_eq!(store.identifier_count(), 1);

        assert_eq!(store.remove_last("/chat/0/CSTR/", StoreEntry::is_local), Some(false));
        assert_eq!(store.remove_last("/chat/0/CSTR/", StoreEntry::is_local), Some(true));
        assert_eq!(store.remove_last("/chat/0/CSTR/", StoreEntry::is_local), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_prefix_match_dispatches_once_per_entry() {
        let hits = Rc::new(Cell::new(0));
        let mut store = SubscriptionStore::new();
        store.insert("/chat/0/CSTR/".into(), local(&hits));
        store.insert("/chat/0/CSTR/".into(), local(&hits));
        store.insert("/other/0/CSTR/".into(), local(&hits));

        let matches = store.matching(b"/chat/0/CSTR/12/3/");
        assert_eq!(matches.len(), 2);
        for entry in matches {
            if let StoreEntry::Local(handler) = entry {
                assert!(handler.post(b"hi").expect("decode"));
            }
        }
        assert_eq!(hits.get(), 2);
        assert!(store.matching(b"/chatter/0/CSTR/1/1/").is_empty());
    }

    #[test]
    fn test_remove_all_forwarded() {
        let mut store = SubscriptionStore::new();
        let forwarded = |thread_id: u64| StoreEntry::Forwarded {
            thread_id,
            delivery_group: Group::dynamic(format!("deliver::{thread_id}")),
        };
        store.insert("/a/0/CSTR/".into(), forwarded(1));
        store.insert("/b/0/CSTR/".into(), forwarded(1));
        store.insert("/b/0/CSTR/".into(), forwarded(2));

        let mut unused = store.remove_all(|e| e.is_forwarded_from(1));
        unused.sort();
        assert_eq!(unused, vec!["/a/0/CSTR/".to_string()]);
        assert!(store.contains_identifier("/b/0/CSTR/"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_group_func_filters() {
        let hits = Rc::new(Cell::new(0));
        let c = Rc::clone(&hits);
        let group_of: GroupFunc<String> = Rc::new(|s: &String| {
            Group::dynamic(s.split(':').next().unwrap_or_default().to_owned())
        });
        let sub = SerializationSubscription::<Cstr, String>::new(
            CHAT,
            move |_| c.set(c.get() + 1),
            Some(group_of),
        );
        assert!(sub.post(b"chat:hello").expect("decode"));
        assert!(!sub.post(b"news:hello").expect("decode"));
        assert_eq!(hits.get(), 1);
        assert_eq!(sub.type_name(), "CSTR");
        assert_eq!(sub.scheme(), MarshallingScheme::CSTR);
    }

    #[test]
    fn test_regex_filter_full_match() {
        let filter = RegexFilter::new([MarshallingScheme::JSON], "nav\\..*", "nav").expect("regex");
        assert!(filter.matches(MarshallingScheme::JSON, "nav.Fix", "nav"));
        assert!(!filter.matches(MarshallingScheme::JSON, "nav.Fix", "navigation"));
        assert!(!filter.matches(MarshallingScheme::CSTR, "nav.Fix", "nav"));
        assert!(RegexFilter::new([0], "(", ".*").is_err());
    }
}
