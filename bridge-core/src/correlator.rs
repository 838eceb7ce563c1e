//! Request correlation table for one native channel.
//!
//! Every message sent on a channel carries a fresh [`RequestId`]. Responses
//! are matched back to the waiting callback by that id. Legacy agents may
//! omit the id, in which case the response belongs to the sole outstanding
//! callback; with zero or several outstanding the channel can no longer be
//! correlated and the caller must treat it as fatal.

use std::collections::HashMap;

use signbridge_types::{AgentResponse, ClientId, RequestId};
use thiserror::Error;

/// Correlation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    /// The id was never registered or was already resolved.
    #[error("no callback registered for request {0}")]
    Unknown(RequestId),

    /// A response without id arrived while zero or several callbacks were
    /// outstanding.
    #[error("cannot correlate response without requestId: {outstanding} callbacks outstanding")]
    Ambiguous {
        /// Number of callbacks outstanding.
        outstanding: usize,
    },

    /// The id is already registered.
    #[error("request {0} is already registered")]
    Duplicate(RequestId),
}

struct Entry<C> {
    client: ClientId,
    callback: C,
}

/// Outstanding callbacks keyed by request id.
///
/// Each entry records the session that issued it so a disconnecting session
/// can drop its own callbacks without touching others on a shared channel.
/// A callback is handed out at most once: `resolve`, `remove_client` and
/// `drain` all remove what they return.
pub struct Correlator<C> {
    entries: HashMap<RequestId, Entry<C>>,
}

impl<C> Correlator<C> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a callback for `id`.
    pub fn register(
        &mut self,
        id: RequestId,
        client: ClientId,
        callback: C,
    ) -> Result<(), CorrelationError> {
        if self.entries.contains_key(&id) {
            return Err(CorrelationError::Duplicate(id));
        }
        self.entries.insert(id, Entry { client, callback });
        Ok(())
    }

    /// Match a response to its callback, removing the entry.
    pub fn resolve(
        &mut self,
        response: &AgentResponse,
    ) -> Result<(RequestId, ClientId, C), CorrelationError> {
        let id = match &response.request_id {
            Some(id) => id.clone(),
            None => {
                if self.entries.len() != 1 {
                    return Err(CorrelationError::Ambiguous {
                        outstanding: self.entries.len(),
                    });
                }
                match self.entries.keys().next() {
                    Some(only) => only.clone(),
                    None => return Err(CorrelationError::Ambiguous { outstanding: 0 }),
                }
            }
        };
        match self.entries.remove(&id) {
            Some(entry) => Ok((id, entry.client, entry.callback)),
            None => Err(CorrelationError::Unknown(id)),
        }
    }

    /// Remove a single entry, e.g. when sending failed.
    pub fn remove(&mut self, id: &RequestId) -> Option<C> {
        self.entries.remove(id).map(|e| e.callback)
    }

    /// Remove every entry issued by `client`.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<(RequestId, C)> {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.client == client)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e.callback)))
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<(RequestId, ClientId, C)> {
        self.entries
            .drain()
            .map(|(id, e)| (id, e.client, e.callback))
            .collect()
    }

    /// Whether `client` has anything outstanding.
    pub fn has_client(&self, client: ClientId) -> bool {
        self.entries.values().any(|e| e.client == client)
    }

    /// Number of outstanding callbacks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C> Default for Correlator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for Correlator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("outstanding", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: Option<&str>, value: i64) -> AgentResponse {
        AgentResponse::ok(id.map(RequestId::from_string), json!(value))
    }

    #[test]
    fn resolves_exact_id_once() {
        let mut table = Correlator::new();
        let id = RequestId::from_string("a");
        table.register(id.clone(), ClientId::new(1), "cb-a").unwrap();

        let (got, client, cb) = table.resolve(&response(Some("a"), 1)).unwrap();
        assert_eq!(got, id);
        assert_eq!(client, ClientId::new(1));
        assert_eq!(cb, "cb-a");

        let again = table.resolve(&response(Some("a"), 1));
        assert_eq!(again.unwrap_err(), CorrelationError::Unknown(id));
    }

    #[test]
    fn out_of_order_responses_hit_their_own_callbacks() {
        let mut table = Correlator::new();
        let ids: Vec<String> = (0..16).map(|i| format!("req-{i}")).collect();
        for (i, id) in ids.iter().enumerate() {
            table
                .register(RequestId::from_string(id.clone()), ClientId::new(1), i)
                .unwrap();
        }

        for (i, id) in ids.iter().enumerate().rev() {
            let (_, _, cb) = table.resolve(&response(Some(id), 0)).unwrap();
            assert_eq!(cb, i);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn missing_id_resolves_sole_callback() {
        let mut table = Correlator::new();
        table
            .register(RequestId::from_string("only"), ClientId::new(3), 7)
            .unwrap();
        let (id, _, cb) = table.resolve(&response(None, 0)).unwrap();
        assert_eq!(id.as_str(), "only");
        assert_eq!(cb, 7);
    }

    #[test]
    fn missing_id_with_several_outstanding_is_ambiguous() {
        let mut table = Correlator::new();
        table
            .register(RequestId::from_string("a"), ClientId::new(1), 1)
            .unwrap();
        table
            .register(RequestId::from_string("b"), ClientId::new(2), 2)
            .unwrap();

        let err = table.resolve(&response(None, 0)).unwrap_err();
        assert_eq!(err, CorrelationError::Ambiguous { outstanding: 2 });
        // Nothing was consumed.
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn missing_id_with_nothing_outstanding_is_ambiguous() {
        let mut table: Correlator<()> = Correlator::new();
        let err = table.resolve(&response(None, 0)).unwrap_err();
        assert_eq!(err, CorrelationError::Ambiguous { outstanding: 0 });
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut table = Correlator::new();
        let id = RequestId::from_string("dup");
        table.register(id.clone(), ClientId::new(1), 1).unwrap();
        assert_eq!(
            table.register(id.clone(), ClientId::new(2), 2).unwrap_err(),
            CorrelationError::Duplicate(id)
        );
    }

    #[test]
    fn remove_client_leaves_other_sessions() {
        let mut table = Correlator::new();
        table
            .register(RequestId::from_string("a1"), ClientId::new(1), "a1")
            .unwrap();
        table
            .register(RequestId::from_string("a2"), ClientId::new(1), "a2")
            .unwrap();
        table
            .register(RequestId::from_string("b1"), ClientId::new(2), "b1")
            .unwrap();

        let removed = table.remove_client(ClientId::new(1));
        assert_eq!(removed.len(), 2);
        assert!(!table.has_client(ClientId::new(1)));
        assert!(table.has_client(ClientId::new(2)));
    }

    #[test]
    fn drain_empties_table() {
        let mut table = Correlator::new();
        for i in 0..3 {
            table
                .register(RequestId::new(), ClientId::new(i), i)
                .unwrap();
        }
        assert_eq!(table.drain().len(), 3);
        assert!(table.is_empty());
    }
}
