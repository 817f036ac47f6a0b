//! Local query registry: the replica side of distributed subscriptions.
//!
//! Coordinators register subscriptions here via `CLUSTER_SUB_REGISTER`; every
//! local write is then matched against the registered specs and the
//! resulting updates are routed back to each subscription's coordinator.
//! The registry holds plain values in a side table keyed by subscription id
//! — cleanup after a coordinator crash is a table scan, not a graph walk.

use std::collections::HashSet;

use dashmap::DashMap;
use squall_core::protocol::peer::{SubSpec, SubscriptionRegistration};
use squall_core::protocol::QueryHit;
use squall_core::{Query, Timestamp, Value};

use crate::search::SearchService;
use crate::storage::CrdtMap;

/// An update owed to a coordinator after a local write.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSubUpdate {
    pub subscription_id: String,
    pub coordinator: String,
    /// Live value when the entry currently satisfies the subscription.
    pub value: Option<Value>,
    /// Search relevance, for search subscriptions that match.
    pub score: Option<f64>,
}

/// Replica-side registry of remotely-coordinated subscriptions.
pub struct QueryRegistry {
    subs: DashMap<String, SubscriptionRegistration>,
    by_map: DashMap<String, HashSet<String>>,
}

impl QueryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { subs: DashMap::new(), by_map: DashMap::new() }
    }

    /// Registers (or refreshes) a subscription.
    pub fn register(&self, registration: SubscriptionRegistration) {
        self.by_map
            .entry(registration.map_name.clone())
            .or_default()
            .insert(registration.subscription_id.clone());
        self.subs
            .insert(registration.subscription_id.clone(), registration);
        metrics::gauge!("squall_replica_subscriptions").set(self.subs.len() as f64);
    }

    /// Removes one subscription.
    pub fn unregister(&self, subscription_id: &str) {
        if let Some((_, registration)) = self.subs.remove(subscription_id) {
            if let Some(mut ids) = self.by_map.get_mut(&registration.map_name) {
                ids.remove(subscription_id);
            }
        }
        metrics::gauge!("squall_replica_subscriptions").set(self.subs.len() as f64);
    }

    /// Drops every subscription coordinated by a departed node.
    ///
    /// Returns how many were dropped.
    pub fn drop_coordinator(&self, node_id: &str) -> usize {
        let doomed: Vec<String> = self
            .subs
            .iter()
            .filter(|entry| entry.coordinator == node_id)
            .map(|entry| entry.subscription_id.clone())
            .collect();
        for id in &doomed {
            self.unregister(id);
        }
        doomed.len()
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Whether a subscription id is registered.
    #[must_use]
    pub fn contains(&self, subscription_id: &str) -> bool {
        self.subs.contains_key(subscription_id)
    }

    /// Computes the updates a local write owes to coordinators.
    ///
    /// `live` is the query-visible value after the write (`None` for
    /// deletions and expiries). Updates are produced for every subscription
    /// on the map; a `None` value tells the coordinator to diff the key out
    /// of its result set if present.
    #[must_use]
    pub fn updates_for_write(
        &self,
        map_name: &str,
        key: &str,
        live: Option<&Value>,
        search: &SearchService,
    ) -> Vec<OutboundSubUpdate> {
        let Some(ids) = self.by_map.get(map_name) else {
            return Vec::new();
        };
        let mut updates = Vec::new();
        for id in ids.iter() {
            let Some(registration) = self.subs.get(id) else {
                continue;
            };
            match &registration.spec {
                SubSpec::Query { query } => {
                    let matches =
                        live.is_some_and(|value| query.matches(key, value));
                    updates.push(OutboundSubUpdate {
                        subscription_id: registration.subscription_id.clone(),
                        coordinator: registration.coordinator.clone(),
                        value: if matches { live.cloned() } else { None },
                        score: None,
                    });
                }
                SubSpec::Search { search: search_query } => {
                    let scored = live
                        .and_then(|_| search.score_doc(map_name, search_query, key));
                    match scored {
                        Some((score, _)) => updates.push(OutboundSubUpdate {
                            subscription_id: registration.subscription_id.clone(),
                            coordinator: registration.coordinator.clone(),
                            value: live.cloned(),
                            score: Some(score),
                        }),
                        None => updates.push(OutboundSubUpdate {
                            subscription_id: registration.subscription_id.clone(),
                            coordinator: registration.coordinator.clone(),
                            value: None,
                            score: None,
                        }),
                    }
                }
            }
        }
        updates
    }
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates a query's initial results against a map snapshot.
///
/// Filters live entries by the predicate, applies the query ordering, and
/// truncates to the limit. Each hit carries the record timestamp so the
/// coordinator can suppress duplicates across nodes.
#[must_use]
pub fn evaluate_initial(map: &CrdtMap, query: &Query) -> Vec<QueryHit> {
    let mut entries: Vec<(String, Value)> = map
        .snapshot_entries()
        .into_iter()
        .filter(|(key, value)| query.matches(key, value))
        .collect();
    query.order_entries(&mut entries);
    if let Some(limit) = query.limit {
        entries.truncate(limit as usize);
    }
    entries
        .into_iter()
        .map(|(key, value)| {
            let timestamp = map.timestamp_of(&key).unwrap_or_else(Timestamp::zero);
            QueryHit { key, value, timestamp }
        })
        .collect()
}
