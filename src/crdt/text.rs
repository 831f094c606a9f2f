// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! A collaborative string value.
//!
//! `TextDoc` wraps an `Rga` with the rules for turning a `TagEdit` into
//! replicated updates:
//!
//! - local edits implicitly know every update of the local site
//! - remote edits get no such fill-in and are stamped under the document's
//!   remote site, so the local site's counter only moves for local typing
//! - an edit whose version mentions updates this replica has not seen yet
//!   waits, and is retried whenever updates integrate
//! - an edit that has waited through `max_deferred_retries` retries is
//!   dropped and reported as expired
//! - a replicated update still missing its origin or targets after
//!   `max_deferred_retries` calls to `expire_pending` is dropped the same way

use thiserror::Error;

use super::op::TagEdit;
use super::primitives::CharId;
use super::primitives::SiteId;
use super::primitives::VersionVector;
use super::rga::Rga;
use super::rga::TextUpdate;

pub const DEFAULT_MAX_DEFERRED_RETRIES: u32 = 16;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TextError {
    #[error("edit expired after {retries} retries, still missing {missing:?}")]
    Expired {
        edit: TagEdit,
        missing: Vec<(SiteId, u64)>,
        retries: u32,
    },
    #[error("text update {id:?} inserts nothing")]
    EmptyUpdate { id: CharId },
    #[error("text update {id:?} runs past the sequence range")]
    OutOfRange { id: CharId },
    #[error("text update {:?} expired waiting for the characters it refers to", .update.id())]
    Stranded { update: TextUpdate },
    #[error("text update stamp {lamport} runs past the sequence range")]
    StampOutOfRange { lamport: u64 },
}

/// What applying an edit or an update produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EditOutcome {
    /// Whether the edit or update itself took effect now.
    pub applied: bool,
    /// New updates to replicate, including those of released deferred edits.
    pub updates: Vec<TextUpdate>,
    /// Deferred edits that ran out of retries.
    pub expired: Vec<TextError>,
}

#[derive(Clone, Debug)]
struct Deferred {
    edit: TagEdit,
    is_remote: bool,
    retries: u32,
}

/// A string tag value shared between sites.
#[derive(Clone, Debug)]
pub struct TextDoc {
    site: SiteId,
    remote_site: SiteId,
    rga: Rga,
    deferred: Vec<Deferred>,
    max_deferred_retries: u32,
}

impl TextDoc {
    pub fn new(site: SiteId) -> TextDoc {
        let remote_site = site.remote();
        return TextDoc {
            site,
            remote_site,
            rga: Rga::new(),
            deferred: Vec::new(),
            max_deferred_retries: DEFAULT_MAX_DEFERRED_RETRIES,
        };
    }

    pub fn with_max_deferred_retries(mut self, retries: u32) -> TextDoc {
        self.max_deferred_retries = retries;
        return self;
    }

    pub fn site(&self) -> &SiteId {
        return &self.site;
    }

    pub fn remote_site(&self) -> &SiteId {
        return &self.remote_site;
    }

    pub fn text(&self) -> String {
        return self.rga.to_string();
    }

    pub fn len(&self) -> u64 {
        return self.rga.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.rga.is_empty();
    }

    /// What this replica has integrated, per site.
    pub fn version(&self) -> VersionVector {
        return self.rga.version();
    }

    /// Every integrated update, for catching up another replica.
    pub fn updates(&self) -> &[TextUpdate] {
        return self.rga.updates();
    }

    pub fn deferred_len(&self) -> usize {
        return self.deferred.len();
    }

    /// Apply an edit issued against `edit.version`.
    pub fn apply_edit(&mut self, edit: &TagEdit, is_remote: bool) -> Result<EditOutcome, TextError> {
        let mut outcome = EditOutcome::default();
        match self.try_apply(edit, is_remote) {
            Some(updates) => {
                outcome.applied = true;
                outcome.updates = updates;
                self.retry_deferred(&mut outcome);
            }
            None => {
                if self.max_deferred_retries == 0 {
                    return Err(self.expire(Deferred { edit: edit.clone(), is_remote, retries: 0 }));
                }
                tracing::debug!(site = %self.site, "deferring edit with unseen version entries");
                self.deferred.push(Deferred {
                    edit: edit.clone(),
                    is_remote,
                    retries: 0,
                });
            }
        }
        return Ok(outcome);
    }

    /// Integrate an update from another replica.
    pub fn integrate(&mut self, update: TextUpdate) -> Result<EditOutcome, TextError> {
        if update.width() == 0 {
            return Err(TextError::EmptyUpdate { id: update.id().clone() });
        }
        if !update.in_range() {
            return Err(TextError::OutOfRange { id: update.id().clone() });
        }
        let mut outcome = EditOutcome::default();
        if self.rga.integrate(update) > 0 {
            outcome.applied = true;
            if !self.deferred.is_empty() {
                self.retry_deferred(&mut outcome);
            }
        }
        return Ok(outcome);
    }

    /// Age the replicated updates still waiting for their dependencies,
    /// once per batch of updates. Returns the ones that ran out of time.
    pub fn expire_pending(&mut self) -> Vec<TextError> {
        return self.rga
            .expire_pending(self.max_deferred_retries)
            .into_iter()
            .map(|update| TextError::Stranded { update })
            .collect();
    }

    pub fn pending_len(&self) -> usize {
        return self.rga.pending_len();
    }

    fn effective_version(&self, edit: &TagEdit, is_remote: bool) -> VersionVector {
        let mut version = edit.version.clone();
        if !is_remote {
            version.observe(&self.site, self.rga.version().get(&self.site));
        }
        return version;
    }

    fn try_apply(&mut self, edit: &TagEdit, is_remote: bool) -> Option<Vec<TextUpdate>> {
        let version = self.effective_version(edit, is_remote);
        if !version.missing_from(&self.rga.version()).is_empty() {
            return None;
        }
        let site = if is_remote { self.remote_site.clone() } else { self.site.clone() };
        return Some(self.rga.apply_ops(&site, &version, &edit.ops));
    }

    fn retry_deferred(&mut self, outcome: &mut EditOutcome) {
        let mut first_pass = true;
        loop {
            let mut progressed = false;
            for mut deferred in std::mem::take(&mut self.deferred) {
                match self.try_apply(&deferred.edit, deferred.is_remote) {
                    Some(updates) => {
                        outcome.updates.extend(updates);
                        progressed = true;
                    }
                    None => {
                        if first_pass {
                            deferred.retries += 1;
                        }
                        if deferred.retries >= self.max_deferred_retries {
                            let err = self.expire(deferred);
                            tracing::warn!(%err, "dropping deferred edit");
                            outcome.expired.push(err);
                        } else {
                            self.deferred.push(deferred);
                        }
                    }
                }
            }
            first_pass = false;
            if !progressed || self.deferred.is_empty() {
                return;
            }
        }
    }

    fn expire(&self, deferred: Deferred) -> TextError {
        let version = self.effective_version(&deferred.edit, deferred.is_remote);
        let missing = version.missing_from(&self.rga.version());
        return TextError::Expired {
            edit: deferred.edit,
            missing,
            retries: deferred.retries,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::op::EditOp;

    fn site(name: &str) -> SiteId {
        return SiteId::from(name);
    }

    fn seeded(name: &str, text: &str) -> TextDoc {
        let mut doc = TextDoc::new(site(name));
        doc.apply_edit(&TagEdit::insert(VersionVector::new(), 0, text), false).unwrap();
        return doc;
    }

    fn catch_up(from: &TextDoc, to: &mut TextDoc) {
        for update in from.updates() {
            to.integrate(update.clone()).unwrap();
        }
    }

    #[test]
    fn local_edits_see_their_own_site() {
        let mut doc = seeded("a", "abc");
        let outcome = doc.apply_edit(&TagEdit::insert(VersionVector::new(), 3, "d"), false).unwrap();
        assert!(outcome.applied);
        assert_eq!(doc.text(), "abcd");
    }

    #[test]
    fn concurrent_insert_and_delete_converge() {
        let base = seeded("base", "abc");
        let mut a = TextDoc::new(site("a"));
        let mut b = TextDoc::new(site("b"));
        catch_up(&base, &mut a);
        catch_up(&base, &mut b);
        let seen = base.version();

        let from_a = a.apply_edit(&TagEdit::insert(seen.clone(), 0, "X"), false).unwrap();
        let from_b = b.apply_edit(&TagEdit::delete(seen.clone(), 0, 1), false).unwrap();
        for update in from_b.updates {
            a.integrate(update).unwrap();
        }
        for update in from_a.updates {
            b.integrate(update).unwrap();
        }

        assert_eq!(a.text(), b.text());
        assert_eq!(a.text(), "Xbc");
    }

    #[test]
    fn remote_edits_use_the_remote_site() {
        let mut doc = seeded("a", "hi");
        let seen = doc.version();
        let outcome = doc.apply_edit(&TagEdit::insert(seen, 2, "!"), true).unwrap();

        assert_eq!(outcome.updates[0].id().site, site("a").remote());
        assert_eq!(doc.version().get(&site("a")), 2);
        assert_eq!(doc.text(), "hi!");
    }

    #[test]
    fn remote_edits_get_no_fill_in() {
        let mut doc = seeded("a", "abc");
        let outcome = doc.apply_edit(&TagEdit::insert(VersionVector::new(), 1, ">"), true).unwrap();
        assert!(outcome.applied);
        assert_eq!(doc.text(), ">abc");

        let mut local = seeded("a", "abc");
        local.apply_edit(&TagEdit::insert(VersionVector::new(), 1, ">"), false).unwrap();
        assert_eq!(local.text(), "a>bc");
    }

    #[test]
    fn edits_wait_for_unseen_updates() {
        let base = seeded("base", "abc");
        let mut doc = TextDoc::new(site("a"));

        let outcome = doc.apply_edit(&TagEdit::insert(base.version(), 3, "!"), false).unwrap();
        assert!(!outcome.applied);
        assert_eq!(doc.deferred_len(), 1);

        let mut released = Vec::new();
        for update in base.updates() {
            released.extend(doc.integrate(update.clone()).unwrap().updates);
        }
        assert_eq!(released.len(), 1);
        assert_eq!(doc.deferred_len(), 0);
        assert_eq!(doc.text(), "abc!");
    }

    #[test]
    fn deferred_edits_expire() {
        let mut doc = TextDoc::new(site("a")).with_max_deferred_retries(2);
        let stale = TagEdit::insert(VersionVector::new().with("ghost", 5), 0, "x");
        doc.apply_edit(&stale, false).unwrap();

        let mut other = TextDoc::new(site("b"));
        let first = other.apply_edit(&TagEdit::insert(VersionVector::new(), 0, "1"), false).unwrap();
        let second = other.apply_edit(&TagEdit::insert(VersionVector::new(), 1, "2"), false).unwrap();

        let outcome = doc.integrate(first.updates[0].clone()).unwrap();
        assert!(outcome.expired.is_empty());
        let outcome = doc.integrate(second.updates[0].clone()).unwrap();
        assert_eq!(outcome.expired.len(), 1);
        assert!(matches!(&outcome.expired[0], TextError::Expired { missing, .. } if missing == &vec![(site("ghost"), 5)]));
        assert_eq!(doc.deferred_len(), 0);
        assert_eq!(doc.text(), "12");
    }

    #[test]
    fn zero_retries_expire_immediately() {
        let mut doc = TextDoc::new(site("a")).with_max_deferred_retries(0);
        let stale = TagEdit::new(VersionVector::new().with("ghost", 1), vec![EditOp::Delete(1)]);
        assert!(matches!(doc.apply_edit(&stale, false), Err(TextError::Expired { .. })));
    }

    #[test]
    fn out_of_range_updates_are_rejected() {
        let mut doc = TextDoc::new(site("a"));
        let update = TextUpdate::Insert {
            id: CharId::new(site("b"), u64::MAX - 1),
            stamp: 1,
            origin: None,
            text: "abc".to_string(),
        };
        assert!(matches!(doc.integrate(update), Err(TextError::OutOfRange { .. })));
        assert!(doc.is_empty());
    }

    #[test]
    fn stranded_updates_expire() {
        let base = seeded("base", "abc");
        let delete = {
            let mut source = TextDoc::new(site("base"));
            catch_up(&base, &mut source);
            source.apply_edit(&TagEdit::delete(base.version(), 0, 1), false).unwrap().updates.remove(0)
        };

        let mut doc = TextDoc::new(site("a")).with_max_deferred_retries(1);
        doc.integrate(delete.clone()).unwrap();
        assert_eq!(doc.pending_len(), 1);
        assert!(doc.expire_pending().is_empty());
        assert_eq!(doc.expire_pending(), vec![TextError::Stranded { update: delete }]);
        assert_eq!(doc.pending_len(), 0);
    }

    #[test]
    fn empty_updates_are_rejected() {
        let mut doc = TextDoc::new(site("a"));
        let update = TextUpdate::Insert {
            id: CharId::new(site("b"), 1),
            stamp: 1,
            origin: None,
            text: String::new(),
        };
        assert!(matches!(doc.integrate(update), Err(TextError::EmptyUpdate { .. })));
    }
}
