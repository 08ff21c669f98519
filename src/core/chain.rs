//! The append-only link chain owned by one operation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::core::agent::Paw;
use crate::core::link::{Link, LinkId, LinkResult, LinkStatus};
use crate::error::{Error, Result};

/// Ordered links of one operation, indexed by id.
///
/// Links are never removed. Insertion order is causal order.
#[derive(Debug, Clone, Default)]
pub struct LinkChain {
    links: Vec<Link>,
    index: HashMap<LinkId, usize>,
}

impl LinkChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a chain from persisted links, keeping their order.
    pub fn from_links(links: Vec<Link>) -> Self {
        let index = links
            .iter()
            .enumerate()
            .map(|(i, link)| (link.id, i))
            .collect();
        Self { links, index }
    }

    pub fn append(&mut self, link: Link) -> LinkId {
        let id = link.id;
        self.index.insert(id, self.links.len());
        self.links.push(link);
        id
    }

    pub fn get(&self, id: &LinkId) -> Option<&Link> {
        self.index.get(id).map(|&i| &self.links[i])
    }

    fn get_mut(&mut self, id: &LinkId) -> Option<&mut Link> {
        match self.index.get(id) {
            Some(&i) => self.links.get_mut(i),
            None => None,
        }
    }

    pub fn contains(&self, id: &LinkId) -> bool {
        self.index.contains_key(id)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether the same ability, agent and resolved command is already on
    /// the chain with a status other than `DISCARD`.
    pub fn has_equivalent(&self, ability_id: &str, paw: &Paw, command: &str) -> bool {
        self.links.iter().any(|l| {
            !l.cleanup
                && l.status != LinkStatus::Discard
                && l.ability_id == ability_id
                && &l.paw == paw
                && l.command == command
        })
    }

    /// Primary links still dispatchable or running.
    pub fn has_outstanding(&self) -> bool {
        self.links.iter().any(|l| !l.cleanup && l.is_outstanding())
    }

    /// Any link, cleanup included, still dispatchable or running.
    pub fn has_outstanding_any(&self) -> bool {
        self.links.iter().any(Link::is_outstanding)
    }

    /// Mark every queued link for `paw` collected and return them.
    ///
    /// Runs under the caller's exclusive borrow, so two polls for the same
    /// paw can never both receive a link.
    pub fn collect_for(&mut self, paw: &Paw, now: DateTime<Utc>) -> Vec<Link> {
        let mut collected = Vec::new();
        for link in self.links.iter_mut().filter(|l| &l.paw == paw) {
            if link.is_deliverable() && link.collect(now).is_ok() {
                collected.push(link.clone());
            }
        }
        collected
    }

    pub fn conclude(&mut self, result: &LinkResult, now: DateTime<Utc>) -> Result<LinkStatus> {
        let link = self.get_mut(&result.link_id).ok_or_else(|| Error::StaleLink {
            link_id: result.link_id,
            status: LinkStatus::Discard,
        })?;
        link.conclude(result, now)
    }

    /// Time out the given links. Returns those actually transitioned.
    pub fn time_out(&mut self, ids: &[LinkId], now: DateTime<Utc>) -> Vec<LinkId> {
        let mut expired = Vec::new();
        for id in ids {
            if let Some(link) = self.get_mut(id) {
                if link.time_out(now).is_ok() {
                    expired.push(*id);
                }
            }
        }
        expired
    }

    /// Discard work that never reached its agent. Cleanup links are kept.
    pub fn discard_unfinished(&mut self, now: DateTime<Utc>) -> Vec<LinkId> {
        self.links
            .iter_mut()
            .filter(|l| !l.cleanup)
            .filter_map(|l| l.discard(now).then_some(l.id))
            .collect()
    }

    /// Release every held cleanup link.
    pub fn release_held(&mut self, now: DateTime<Utc>) -> Vec<LinkId> {
        self.links
            .iter_mut()
            .filter_map(|l| l.release(now).then_some(l.id))
            .collect()
    }

    pub fn promote_untrusted(&mut self, paw: &Paw, now: DateTime<Utc>) -> Vec<LinkId> {
        self.links
            .iter_mut()
            .filter(|l| &l.paw == paw)
            .filter_map(|l| l.promote(now).then_some(l.id))
            .collect()
    }

    pub fn discard_untrusted(&mut self, paw: &Paw, now: DateTime<Utc>) -> Vec<LinkId> {
        self.links
            .iter_mut()
            .filter(|l| &l.paw == paw && l.status == LinkStatus::Untrusted)
            .filter_map(|l| l.discard(now).then_some(l.id))
            .collect()
    }

    /// Number of links per status code.
    pub fn status_counts(&self) -> Vec<(LinkStatus, usize)> {
        let mut counts: HashMap<LinkStatus, usize> = HashMap::new();
        for link in &self.links {
            *counts.entry(link.status).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.code());
        counts
    }
}
