//! In-memory ACS used by tests and local runs without a CCURE instance.

use super::{AcsClient, AcsError, GrantOutcome, RevokeOutcome};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MockCall {
    Authenticate,
    FetchGrants(String),
    Grant(String, String),
    Revoke(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Fetch,
    Grant,
    Revoke,
}

#[derive(Default)]
struct MockState {
    grants: HashMap<String, HashSet<String>>,
    unknown_persons: HashSet<String>,
    scripted: HashMap<(Op, String, String), VecDeque<AcsError>>,
    auth_error: Option<AcsError>,
    calls: Vec<MockCall>,
    in_flight: HashMap<String, usize>,
    max_in_flight_per_person: usize,
    in_flight_total: usize,
    max_in_flight_total: usize,
}

/// Scriptable ACS. Errors queued with `fail_*` are returned in order before
/// the call falls through to the in-memory grant table.
#[derive(Default)]
pub struct MockAcsClient {
    state: Mutex<MockState>,
    latency: Option<Duration>,
}

impl MockAcsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every person-scoped call, so overlapping chains can be observed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_grants<I, S>(&self, person_id: &str, clearance_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().grants.insert(
            person_id.to_string(),
            clearance_ids.into_iter().map(Into::into).collect(),
        );
    }

    pub fn grants_of(&self, person_id: &str) -> HashSet<String> {
        self.state()
            .grants
            .get(person_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make `person_id` unknown to the ACS.
    pub fn mark_unknown(&self, person_id: &str) {
        self.state().unknown_persons.insert(person_id.to_string());
    }

    pub fn fail_authenticate(&self, error: AcsError) {
        self.state().auth_error = Some(error);
    }

    pub fn fail_fetch(&self, person_id: &str, errors: Vec<AcsError>) {
        self.script(Op::Fetch, person_id, "", errors);
    }

    pub fn fail_grant(&self, person_id: &str, clearance_id: &str, errors: Vec<AcsError>) {
        self.script(Op::Grant, person_id, clearance_id, errors);
    }

    pub fn fail_revoke(&self, person_id: &str, clearance_id: &str, errors: Vec<AcsError>) {
        self.script(Op::Revoke, person_id, clearance_id, errors);
    }

    fn script(&self, op: Op, person_id: &str, clearance_id: &str, errors: Vec<AcsError>) {
        self.state()
            .scripted
            .entry((op, person_id.to_string(), clearance_id.to_string()))
            .or_default()
            .extend(errors);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Grant and revoke calls only.
    pub fn mutations(&self) -> Vec<MockCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, MockCall::Grant(..) | MockCall::Revoke(..)))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Highest number of simultaneous calls observed for any single person.
    pub fn max_in_flight_per_person(&self) -> usize {
        self.state().max_in_flight_per_person
    }

    /// Highest number of simultaneous person-scoped calls overall.
    pub fn max_in_flight_total(&self) -> usize {
        self.state().max_in_flight_total
    }

    fn begin(&self, call: MockCall, person_id: &str) {
        let mut state = self.state();
        state.calls.push(call);

        let count = {
            let n = state.in_flight.entry(person_id.to_string()).or_default();
            *n += 1;
            *n
        };
        state.max_in_flight_per_person = state.max_in_flight_per_person.max(count);
        state.in_flight_total += 1;
        state.max_in_flight_total = state.max_in_flight_total.max(state.in_flight_total);
    }

    fn end(&self, person_id: &str) {
        let mut state = self.state();
        if let Some(n) = state.in_flight.get_mut(person_id) {
            *n = n.saturating_sub(1);
        }
        state.in_flight_total = state.in_flight_total.saturating_sub(1);
    }

    async fn enter(&self, call: MockCall, person_id: &str) {
        self.begin(call, person_id);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn next_scripted(&self, op: Op, person_id: &str, clearance_id: &str) -> Option<AcsError> {
        self.state()
            .scripted
            .get_mut(&(op, person_id.to_string(), clearance_id.to_string()))
            .and_then(|q| q.pop_front())
    }

    fn is_unknown(&self, person_id: &str) -> bool {
        self.state().unknown_persons.contains(person_id)
    }
}

#[async_trait]
impl AcsClient for MockAcsClient {
    async fn authenticate(&self) -> Result<(), AcsError> {
        let mut state = self.state();
        state.calls.push(MockCall::Authenticate);
        match &state.auth_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn fetch_grants(&self, person_id: &str) -> Result<HashSet<String>, AcsError> {
        self.enter(MockCall::FetchGrants(person_id.to_string()), person_id)
            .await;

        let result = if let Some(e) = self.next_scripted(Op::Fetch, person_id, "") {
            Err(e)
        } else if self.is_unknown(person_id) {
            Err(AcsError::NotFound(person_id.to_string()))
        } else {
            Ok(self.grants_of(person_id))
        };

        self.end(person_id);
        result
    }

    async fn grant(&self, person_id: &str, clearance_id: &str) -> Result<GrantOutcome, AcsError> {
        self.enter(
            MockCall::Grant(person_id.to_string(), clearance_id.to_string()),
            person_id,
        )
        .await;

        let result = if let Some(e) = self.next_scripted(Op::Grant, person_id, clearance_id) {
            Err(e)
        } else if self.is_unknown(person_id) {
            Err(AcsError::NotFound(person_id.to_string()))
        } else {
            let inserted = self
                .state()
                .grants
                .entry(person_id.to_string())
                .or_default()
                .insert(clearance_id.to_string());
            Ok(if inserted {
                GrantOutcome::Granted
            } else {
                GrantOutcome::AlreadyGranted
            })
        };

        self.end(person_id);
        result
    }

    async fn revoke(
        &self,
        person_id: &str,
        clearance_id: &str,
    ) -> Result<RevokeOutcome, AcsError> {
        self.enter(
            MockCall::Revoke(person_id.to_string(), clearance_id.to_string()),
            person_id,
        )
        .await;

        let result = if let Some(e) = self.next_scripted(Op::Revoke, person_id, clearance_id) {
            Err(e)
        } else {
            let removed = self
                .state()
                .grants
                .get_mut(person_id)
                .is_some_and(|g| g.remove(clearance_id));
            Ok(if removed {
                RevokeOutcome::Revoked
            } else {
                RevokeOutcome::NotGranted
            })
        };

        self.end(person_id);
        result
    }
}
