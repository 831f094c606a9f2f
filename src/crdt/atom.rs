// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Atoms: the immutable unit of causal history.
//!
//! An atom says "site S, at its sequence N, did X as a consequence of atom
//! C". Atoms are never mutated or removed. Deleting is itself an atom whose
//! cause is the atom being deleted.
//!
//! Wire shape:
//!
//! ```text
//! { "id": { "site": "a", "sequence": 3, "priority": 0 },
//!   "cause": { "site": "a", "sequence": 2, "priority": 0 } | null,
//!   "value": { "type": "set_value", "value": "red" },
//!   "hash": "<blake3 hex>" }
//! ```

use serde::Deserialize;
use serde::Serialize;

use crate::bot::TagValue;
use crate::key::Hash;
use crate::key::KeyPair;
use crate::key::KeyPub;
use crate::key::Signature;
use super::primitives::AtomId;
use super::primitives::SiteClock;

/// Priority given to delete atoms so they sort after sibling content.
pub const DELETE_PRIORITY: u32 = 1;

/// What an atom does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AtomOp {
    /// Create a record with the given bot id. Always a root.
    CreateRecord { id: String },
    /// Create a field on the record that caused it. A field with a space is
    /// a mask that only applies within that space.
    CreateField {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        space: Option<String>,
    },
    /// Give the field that caused it a value.
    SetValue { value: TagValue },
    /// Remove the causal group of the atom that caused it.
    Delete,
}

impl AtomOp {
    pub fn default_priority(&self) -> u32 {
        match self {
            AtomOp::Delete => return DELETE_PRIORITY,
            _ => return 0,
        }
    }

    /// Stable bytes fed into the atom hash.
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            AtomOp::CreateRecord { id } => {
                out.push(0x00);
                encode_str(out, id);
            }
            AtomOp::CreateField { name, space } => {
                out.push(0x01);
                encode_str(out, name);
                match space {
                    Some(space) => {
                        out.push(1);
                        encode_str(out, space);
                    }
                    None => out.push(0),
                }
            }
            AtomOp::SetValue { value } => {
                out.push(0x02);
                let json = serde_json::to_vec(value).unwrap_or_default();
                out.extend_from_slice(&(json.len() as u64).to_le_bytes());
                out.extend_from_slice(&json);
            }
            AtomOp::Delete => {
                out.push(0x03);
            }
        }
    }
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_id(out: &mut Vec<u8>, id: &AtomId) {
    encode_str(out, id.site.as_str());
    out.extend_from_slice(&id.seq.to_le_bytes());
    out.extend_from_slice(&id.priority.to_le_bytes());
}

/// Hash the content of an atom.
pub fn hash_atom(id: &AtomId, cause: Option<&AtomId>, value: &AtomOp) -> Hash {
    let mut bytes = Vec::new();
    encode_id(&mut bytes, id);
    match cause {
        Some(cause) => {
            bytes.push(1);
            encode_id(&mut bytes, cause);
        }
        None => bytes.push(0),
    }
    value.encode(&mut bytes);
    return crate::key::hash(&bytes);
}

/// An immutable edit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: AtomId,
    pub cause: Option<AtomId>,
    pub value: AtomOp,
    pub hash: Hash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl Atom {
    /// Build an atom with an explicit id, computing its hash.
    pub fn new(id: AtomId, cause: Option<AtomId>, value: AtomOp) -> Atom {
        let hash = hash_atom(&id, cause.as_ref(), &value);
        return Atom {
            id,
            cause,
            value,
            hash,
            signature: None,
        };
    }

    /// Check that the stored hash matches the content.
    pub fn verify_hash(&self) -> bool {
        return hash_atom(&self.id, self.cause.as_ref(), &self.value) == self.hash;
    }

    /// Sign the atom hash with the site key.
    pub fn sign(mut self, keypair: &KeyPair) -> Atom {
        self.signature = Some(keypair.sign(&self.hash.0));
        return self;
    }

    pub fn verify_signature(&self, key: &KeyPub) -> bool {
        match &self.signature {
            Some(signature) => return key.verify(&self.hash.0, signature),
            None => return false,
        }
    }

    pub fn is_delete(&self) -> bool {
        return matches!(self.value, AtomOp::Delete);
    }
}

/// Create a new atom stamped with the clock's next sequence.
///
/// The clock first observes the cause, so the new atom always has a larger
/// sequence than the atom it depends on.
pub fn create_atom(clock: &mut SiteClock, cause: Option<&Atom>, value: AtomOp, priority: Option<u32>) -> Atom {
    if let Some(cause) = cause {
        clock.observe(cause.id.seq);
    }
    let priority = priority.unwrap_or_else(|| value.default_priority());
    let id = AtomId::new(clock.site().clone(), clock.tick(), priority);
    return Atom::new(id, cause.map(|c| c.id.clone()), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::primitives::SiteId;

    fn clock(site: &str) -> SiteClock {
        return SiteClock::new(SiteId::from(site));
    }

    #[test]
    fn create_atom_ticks_the_clock() {
        let mut clock = clock("alice");
        let record = create_atom(&mut clock, None, AtomOp::CreateRecord { id: "b1".to_string() }, None);
        let field = create_atom(&mut clock, Some(&record), AtomOp::CreateField { name: "color".to_string(), space: None }, None);

        assert_eq!(record.id.seq, 1);
        assert_eq!(field.id.seq, 2);
        assert_eq!(field.cause, Some(record.id.clone()));
        assert!(record.verify_hash());
    }

    #[test]
    fn create_atom_outruns_remote_cause() {
        let mut remote = SiteClock::with_time(SiteId::from("bob"), 40);
        let record = create_atom(&mut remote, None, AtomOp::CreateRecord { id: "b1".to_string() }, None);

        let mut local = clock("alice");
        let delete = create_atom(&mut local, Some(&record), AtomOp::Delete, None);

        assert!(delete.id.seq > record.id.seq);
        assert_eq!(delete.id.priority, DELETE_PRIORITY);
    }

    #[test]
    fn hash_covers_content() {
        let id = AtomId::new(SiteId::from("alice"), 1, 0);
        let a = Atom::new(id.clone(), None, AtomOp::CreateRecord { id: "b1".to_string() });
        let b = Atom::new(id, None, AtomOp::CreateRecord { id: "b2".to_string() });
        assert_ne!(a.hash, b.hash);

        let mut tampered = a.clone();
        tampered.value = AtomOp::CreateRecord { id: "evil".to_string() };
        assert!(!tampered.verify_hash());
    }

    #[test]
    fn signatures_bind_to_the_site_key() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let mut clock = clock("alice");
        let atom = create_atom(&mut clock, None, AtomOp::CreateRecord { id: "b1".to_string() }, None).sign(&keys);

        assert!(atom.verify_signature(&keys.key_pub));
        assert!(!atom.verify_signature(&other.key_pub));
    }

    #[test]
    fn wire_shape_round_trips() {
        let mut clock = clock("alice");
        let record = create_atom(&mut clock, None, AtomOp::CreateRecord { id: "b1".to_string() }, None);
        let field = create_atom(&mut clock, Some(&record), AtomOp::CreateField { name: "color".to_string(), space: None }, None);
        let value = create_atom(&mut clock, Some(&field), AtomOp::SetValue { value: TagValue::from("red") }, None);

        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["id"], serde_json::json!({ "site": "alice", "sequence": 3, "priority": 0 }));
        assert_eq!(json["cause"]["sequence"], 2);
        assert_eq!(json["value"], serde_json::json!({ "type": "set_value", "value": "red" }));

        let back: Atom = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
        assert!(back.verify_hash());
    }
}
