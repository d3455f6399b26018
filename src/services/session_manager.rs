use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MarketError, Result};
use crate::services::endpoint::{AgentEndpoint, MatcherEndpoint};
use crate::services::session::Session;

/// A declared pairing of a child (wants `desired_parent_id`) with a parent.
/// The pairing outlives its session: removal of a participant tears the
/// session down but keeps the intent, so a later re-registration under the
/// same id reconnects without re-declaring anything.
struct PotentialSession {
    agent_id: String,
    desired_parent_id: String,
    session: Option<Session>,
}

struct TopologyState {
    agent_endpoints: HashMap<String, Arc<dyn AgentEndpoint>>,
    matcher_endpoints: HashMap<String, Arc<dyn MatcherEndpoint>>,
    /// Keyed by child agent id; one declared parent per child.
    potential_sessions: HashMap<String, PotentialSession>,
}

/// The topology matcher: discovers participants and wires them into
/// sessions based on their declared parent relationships.
///
/// All registries and potential sessions live under one mutex, so a whole
/// connection sweep is a single critical section — two concurrent sweeps can
/// never produce duplicate sessions for the same pairing.
pub struct SessionManager {
    state: Mutex<TopologyState>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TopologyState {
                agent_endpoints: HashMap::new(),
                matcher_endpoints: HashMap::new(),
                potential_sessions: HashMap::new(),
            }),
        }
    }

    /// Registers a participant's agent role and tries to complete pairings.
    /// A duplicate id is rejected and the existing binding stays untouched.
    pub async fn add_agent_endpoint(&self, agent: Arc<dyn AgentEndpoint>) -> Result<()> {
        let mut state = self.state.lock().await;
        let agent_id = agent.agent_id().to_string();
        if state.agent_endpoints.contains_key(&agent_id) {
            warn!(agent_id = %agent_id, "an agent with this id is already registered");
            return Err(MarketError::topology_conflict(format!(
                "agent id {} is already registered",
                agent_id
            )));
        }

        let desired_parent_id = agent.desired_parent_id().to_string();
        match state.potential_sessions.get_mut(&agent_id) {
            Some(pairing) if pairing.desired_parent_id != desired_parent_id => {
                info!(
                    agent_id = %agent_id,
                    old_parent = %pairing.desired_parent_id,
                    new_parent = %desired_parent_id,
                    "re-registration changed the desired parent"
                );
                pairing.desired_parent_id = desired_parent_id;
            }
            Some(_) => {}
            None => {
                debug!(
                    agent_id = %agent_id,
                    desired_parent_id = %desired_parent_id,
                    "added potential session"
                );
                state.potential_sessions.insert(
                    agent_id.clone(),
                    PotentialSession {
                        agent_id: agent_id.clone(),
                        desired_parent_id,
                        session: None,
                    },
                );
            }
        }

        state.agent_endpoints.insert(agent_id, agent);
        Self::update_connections(&mut state).await;
        Ok(())
    }

    /// Registers a participant's matcher role and tries to complete pairings.
    pub async fn add_matcher_endpoint(&self, matcher: Arc<dyn MatcherEndpoint>) -> Result<()> {
        let mut state = self.state.lock().await;
        let matcher_id = matcher.agent_id().to_string();
        if state.matcher_endpoints.contains_key(&matcher_id) {
            warn!(matcher_id = %matcher_id, "a matcher with this id is already registered");
            return Err(MarketError::topology_conflict(format!(
                "matcher id {} is already registered",
                matcher_id
            )));
        }

        state.matcher_endpoints.insert(matcher_id, matcher);
        Self::update_connections(&mut state).await;
        Ok(())
    }

    /// Deregisters an agent: its session is torn down, its declared pairing
    /// stays so the same id can reconnect later.
    pub async fn remove_agent_endpoint(&self, agent_id: &str) {
        let mut state = self.state.lock().await;
        if state.agent_endpoints.remove(agent_id).is_none() {
            warn!(agent_id = %agent_id, "removing an agent that is not registered");
            return;
        }
        let session = state
            .potential_sessions
            .get_mut(agent_id)
            .and_then(|pairing| pairing.session.take());
        if let Some(session) = session {
            session.disconnect().await;
        }
        info!(agent_id = %agent_id, "removed agent endpoint");
        Self::update_connections(&mut state).await;
    }

    /// Deregisters a matcher, tearing down every session it was parenting.
    pub async fn remove_matcher_endpoint(&self, matcher_id: &str) {
        let mut state = self.state.lock().await;
        if state.matcher_endpoints.remove(matcher_id).is_none() {
            warn!(matcher_id = %matcher_id, "removing a matcher that is not registered");
            return;
        }

        let sessions: Vec<Session> = state
            .potential_sessions
            .values_mut()
            .filter(|pairing| pairing.desired_parent_id == matcher_id)
            .filter_map(|pairing| pairing.session.take())
            .collect();
        for session in sessions {
            session.disconnect().await;
        }
        info!(matcher_id = %matcher_id, "removed matcher endpoint");
        Self::update_connections(&mut state).await;
    }

    /// Currently connected sessions.
    pub async fn active_sessions(&self) -> Vec<Session> {
        let state = self.state.lock().await;
        state
            .potential_sessions
            .values()
            .filter_map(|pairing| pairing.session.clone())
            .filter(|session| session.is_connected())
            .collect()
    }

    pub async fn active_session_count(&self) -> usize {
        self.active_sessions().await.len()
    }

    /// Runs connection attempts to a fixed point: completing one pairing can
    /// make others completable (a concentrator refuses children until it has
    /// a parent), so all potential sessions are swept repeatedly until a
    /// sweep produces no new connection. Runs inside the manager's critical
    /// section; a matcher's refusal leaves the pairing pending.
    async fn update_connections(state: &mut TopologyState) {
        loop {
            // Sessions torn down by a participant are only cleared here, on
            // the next sweep, freeing the pairing for a reconnect.
            for pairing in state.potential_sessions.values_mut() {
                if pairing
                    .session
                    .as_ref()
                    .is_some_and(|session| session.is_disconnected())
                {
                    pairing.session = None;
                }
            }

            let candidates: Vec<String> = state
                .potential_sessions
                .values()
                .filter(|pairing| pairing.session.is_none())
                .filter(|pairing| state.agent_endpoints.contains_key(&pairing.agent_id))
                .filter(|pairing| {
                    state
                        .matcher_endpoints
                        .contains_key(&pairing.desired_parent_id)
                })
                .map(|pairing| pairing.agent_id.clone())
                .collect();

            let mut connected = 0usize;
            for agent_id in candidates {
                let (agent, matcher, matcher_id) = {
                    let pairing = &state.potential_sessions[&agent_id];
                    let agent = state.agent_endpoints[&pairing.agent_id].clone();
                    let matcher = state.matcher_endpoints[&pairing.desired_parent_id].clone();
                    (agent, matcher, pairing.desired_parent_id.clone())
                };
                if agent.desired_parent_id() != matcher_id {
                    warn!(
                        agent_id = %agent_id,
                        declared = %agent.desired_parent_id(),
                        paired = %matcher_id,
                        "declared parent does not match the retained pairing, skipping"
                    );
                    continue;
                }

                let session = Session::new(agent.clone(), matcher.clone());
                if matcher.connect_to_agent(session.clone()).await {
                    if session.mark_connected().is_err() {
                        continue;
                    }
                    agent.connect_to_matcher(session.clone()).await;
                    info!(
                        session_id = %session.session_id(),
                        agent_id = %agent_id,
                        matcher_id = %matcher_id,
                        "connected session"
                    );
                    if let Some(pairing) = state.potential_sessions.get_mut(&agent_id) {
                        pairing.session = Some(session);
                    }
                    connected += 1;
                } else {
                    debug!(
                        agent_id = %agent_id,
                        matcher_id = %matcher_id,
                        "matcher refused the session, pairing stays pending"
                    );
                }
            }

            if connected == 0 {
                break;
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
