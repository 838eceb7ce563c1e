//! Certificate listing merge.
//!
//! Local and device listings are merged by thumbprint. Sources are applied
//! in the order given and a later entry for the same thumbprint replaces the
//! earlier one while keeping the earlier position.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use signbridge_types::Thumbprint;

/// Read the `thumbprint` field of a certificate entry.
pub fn thumbprint_of(cert: &Value) -> Option<Thumbprint> {
    cert.get("thumbprint")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(Thumbprint::new)
}

/// Index a listing by thumbprint; entries without one are dropped.
pub fn index_by_thumbprint(listing: &[Value]) -> BTreeMap<Thumbprint, Value> {
    listing
        .iter()
        .filter_map(|cert| thumbprint_of(cert).map(|t| (t, cert.clone())))
        .collect()
}

/// Incremental last-write-wins merge.
#[derive(Debug, Default)]
pub struct ListingMerge {
    order: Vec<Value>,
    index: HashMap<Thumbprint, usize>,
}

impl ListingMerge {
    /// An empty merge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one certificate entry.
    pub fn add(&mut self, cert: Value) {
        match thumbprint_of(&cert) {
            Some(thumb) => match self.index.get(&thumb) {
                Some(&pos) => self.order[pos] = cert,
                None => {
                    self.index.insert(thumb, self.order.len());
                    self.order.push(cert);
                }
            },
            None => self.order.push(cert),
        }
    }

    /// Apply every entry of a source in order.
    pub fn extend<I: IntoIterator<Item = Value>>(&mut self, source: I) {
        for cert in source {
            self.add(cert);
        }
    }

    /// The merged listing.
    pub fn finish(self) -> Vec<Value> {
        self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn later_source_wins_on_conflict() {
        let mut merge = ListingMerge::new();
        merge.extend(vec![
            json!({"thumbprint": "aa", "source": "local"}),
            json!({"thumbprint": "bb", "source": "local"}),
        ]);
        merge.extend(vec![json!({"thumbprint": "aa", "source": "phone"})]);

        let out = merge.finish();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["source"], "phone");
        assert_eq!(out[1]["thumbprint"], "bb");
    }

    #[test]
    fn entries_without_thumbprint_are_kept() {
        let mut merge = ListingMerge::new();
        merge.add(json!({"subjectName": "odd"}));
        merge.add(json!({"subjectName": "odd"}));
        assert_eq!(merge.finish().len(), 2);
    }

    #[test]
    fn index_skips_unidentified_entries() {
        let idx = index_by_thumbprint(&[json!({"thumbprint": "aa"}), json!({"x": 1})]);
        assert_eq!(idx.len(), 1);
        assert!(idx.contains_key(&Thumbprint::new("aa")));
    }
}
