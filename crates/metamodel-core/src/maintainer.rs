//! Contact graph maintenance.
//!
//! Contacts grow in three phases separated by barriers:
//!
//! 1. every agent may add one perceived agent it does not know yet;
//! 2. every agent with two or more contacts may introduce one of them to
//!    another, by linking a `NEW_CONTACT` edge from the introduced agent;
//! 3. every agent folds its incoming proposals (its outgoing `NEW_CONTACT`
//!    edges) into its contacts and unlinks them.
//!
//! Each contact list entry is mirrored by exactly one outgoing `CONTACT` edge.

use crate::config::AgentParams;
use crate::substrate::{Agent, BehaviorError, DistributedId, Layer, PartitionScope};
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::trace;

/// Appends `candidate` to the contacts of `agent`, evicting the oldest contact
/// first when the list is full.
pub fn add_to_contacts(
    agent: &mut Agent,
    candidate: DistributedId,
    scope: &mut PartitionScope<'_>,
    params: &AgentParams,
) -> Result<(), BehaviorError> {
    if agent.contacts.len() >= params.max_contacts
        && let Some(oldest) = agent.contacts.front()
    {
        let edge = scope
            .outgoing_edges(agent.id, Layer::Contact)
            .into_iter()
            .find(|edge| edge.target == oldest)
            .ok_or(BehaviorError::BrokenContactMirror {
                agent: agent.id,
                contact: oldest,
            })?;
        scope.unlink(edge);
        agent.contacts.pop_front();
        trace!(agent = %agent.id, evicted = %oldest, "contact evicted");
    }
    scope.link(agent.id, candidate, Layer::Contact, params.contact_weight);
    agent.contacts.push_back(candidate);
    scope.mark_dirty(agent.id);
    Ok(())
}

/// Phase 1: adds one random perceived agent not yet in the contacts.
pub fn create_relations_from_neighborhood(
    agent: &mut Agent,
    scope: &mut PartitionScope<'_>,
    params: &AgentParams,
) -> Result<(), BehaviorError> {
    let mut perceived = scope.perception_field(agent, params.range_size)?;
    perceived.shuffle(scope.rng());
    let Some(candidate) = perceived
        .into_iter()
        .find(|candidate| !agent.contacts.contains(candidate))
    else {
        return Ok(());
    };
    add_to_contacts(agent, candidate, scope, params)
}

/// Phase 2: introduces a random contact to another contact it does not know.
///
/// Only a `NEW_CONTACT` edge from the introduced agent is created; its
/// contacts are left untouched until it handles the proposal.
pub fn create_relations_from_contacts(
    agent: &mut Agent,
    scope: &mut PartitionScope<'_>,
    params: &AgentParams,
) -> Result<(), BehaviorError> {
    let mut contacts: Vec<DistributedId> = scope
        .outgoing_edges(agent.id, Layer::Contact)
        .into_iter()
        .map(|edge| edge.target)
        .collect();
    if contacts.len() < 2 {
        return Ok(());
    }
    let pick = scope.rng().random_range(0..contacts.len());
    contacts.swap(0, pick);
    let introduced = scope.read_agent(contacts[0])?;
    if let Some(&other) = contacts[1..]
        .iter()
        .find(|other| !introduced.contacts.contains(other))
    {
        scope.link(introduced.id, other, Layer::NewContact, params.contact_weight);
    }
    Ok(())
}

/// Phase 3: commits incoming proposals and unlinks every `NEW_CONTACT` edge.
///
/// Proposals for an agent already in the contacts (two introducers in the
/// same round) or for the agent itself are dropped.
pub fn handle_new_contacts(
    agent: &mut Agent,
    scope: &mut PartitionScope<'_>,
    params: &AgentParams,
) -> Result<(), BehaviorError> {
    for edge in scope.outgoing_edges(agent.id, Layer::NewContact) {
        let candidate = edge.target;
        if candidate != agent.id && !agent.contacts.contains(&candidate) {
            add_to_contacts(agent, candidate, scope, params)?;
        }
        scope.unlink(edge);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::Substrate;
    use crate::substrate::tests::line;

    fn params(max_contacts: usize) -> AgentParams {
        AgentParams {
            max_contacts,
            ..AgentParams::default()
        }
    }

    fn add(substrate: &mut Substrate, agent: DistributedId, candidate: DistributedId, max: usize) {
        substrate
            .with_agent(agent, |a, scope| {
                add_to_contacts(a, candidate, scope, &params(max))
            })
            .expect("agent exists")
            .expect("contact added");
    }

    fn contact_targets(substrate: &Substrate, agent: DistributedId) -> Vec<DistributedId> {
        substrate
            .graph()
            .edges()
            .outgoing(agent, Layer::Contact)
            .map(|edge| edge.target)
            .collect()
    }

    #[test]
    fn full_list_evicts_oldest_contact_and_edge() {
        let mut substrate = line(4, 1);
        let ids: Vec<DistributedId> = (0..4)
            .map(|cell| substrate.spawn_agent(cell).expect("agent"))
            .collect();
        let owner = ids[0];
        add(&mut substrate, owner, ids[1], 2);
        add(&mut substrate, owner, ids[2], 2);
        add(&mut substrate, owner, ids[3], 2);
        substrate.synchronize();

        let agent = substrate.agent(owner).expect("owner");
        assert_eq!(agent.contacts().to_vec(), vec![ids[2], ids[3]]);
        let mut targets = contact_targets(&substrate, owner);
        targets.sort();
        assert_eq!(targets, vec![ids[2], ids[3]]);
        assert_eq!(
            substrate.graph().agent(owner).expect("published").contacts,
            agent.contacts().clone()
        );
    }

    #[test]
    fn capacity_one_keeps_only_latest() {
        let mut substrate = line(3, 1);
        let ids: Vec<DistributedId> = (0..3)
            .map(|cell| substrate.spawn_agent(cell).expect("agent"))
            .collect();
        add(&mut substrate, ids[0], ids[1], 1);
        substrate.synchronize();
        add(&mut substrate, ids[0], ids[2], 1);
        substrate.synchronize();
        let agent = substrate.agent(ids[0]).expect("agent");
        assert_eq!(agent.contacts().to_vec(), vec![ids[2]]);
        assert_eq!(contact_targets(&substrate, ids[0]), vec![ids[2]]);
    }

    #[test]
    fn missing_contact_edge_is_reported() {
        let mut substrate = line(3, 1);
        let ids: Vec<DistributedId> = (0..3)
            .map(|cell| substrate.spawn_agent(cell).expect("agent"))
            .collect();
        let outcome = substrate
            .with_agent(ids[0], |agent, scope| {
                agent.contacts.push_back(ids[1]);
                add_to_contacts(agent, ids[2], scope, &params(1))
            })
            .expect("agent exists");
        assert_eq!(
            outcome,
            Err(BehaviorError::BrokenContactMirror {
                agent: ids[0],
                contact: ids[1]
            })
        );
    }

    #[test]
    fn neighborhood_phase_adds_one_new_contact() {
        let mut substrate = line(3, 1);
        let a = substrate.spawn_agent(1).expect("a");
        let b = substrate.spawn_agent(1).expect("b");
        let c = substrate.spawn_agent(2).expect("c");
        let p = params(5);
        for round in 1..=3usize {
            substrate
                .with_agent(a, |agent, scope| {
                    create_relations_from_neighborhood(agent, scope, &p)
                })
                .expect("agent exists")
                .expect("phase runs");
            substrate.synchronize();
            let contacts = substrate.agent(a).expect("a").contacts().len();
            assert_eq!(contacts, round.min(2));
        }
        let mut known = substrate.agent(a).expect("a").contacts().to_vec();
        known.sort();
        assert_eq!(known, vec![b, c]);
    }

    #[test]
    fn introductions_round_trip_through_new_contact_edges() {
        let mut substrate = line(3, 3);
        let a = substrate.spawn_agent(0).expect("a");
        let b = substrate.spawn_agent(1).expect("b");
        let c = substrate.spawn_agent(2).expect("c");
        let p = params(5);
        add(&mut substrate, a, b, 5);
        add(&mut substrate, a, c, 5);
        substrate.synchronize();

        substrate
            .with_agent(a, |agent, scope| create_relations_from_contacts(agent, scope, &p))
            .expect("agent exists")
            .expect("proposal");
        assert_eq!(substrate.pending_edges(Layer::NewContact), 1);
        substrate.synchronize();
        assert_eq!(substrate.graph().edges().count(Layer::NewContact), 1);
        // Proposals do not touch either endpoint's contacts.
        assert!(substrate.agent(b).expect("b").contacts().is_empty());
        assert!(substrate.agent(c).expect("c").contacts().is_empty());

        let edge = *substrate
            .graph()
            .edges()
            .iter()
            .find(|edge| edge.layer == Layer::NewContact)
            .expect("proposal edge");
        let introduced = edge.source;
        let other = edge.target;
        assert!([b, c].contains(&introduced) && [b, c].contains(&other) && introduced != other);

        substrate
            .with_agent(introduced, |agent, scope| handle_new_contacts(agent, scope, &p))
            .expect("agent exists")
            .expect("commit");
        substrate.synchronize();
        assert_eq!(substrate.graph().edges().count(Layer::NewContact), 0);
        assert_eq!(
            substrate.agent(introduced).expect("introduced").contacts().to_vec(),
            vec![other]
        );
        assert_eq!(contact_targets(&substrate, introduced), vec![other]);
    }

    #[test]
    fn known_proposals_are_dropped_but_unlinked() {
        let mut substrate = line(2, 1);
        let a = substrate.spawn_agent(0).expect("a");
        let b = substrate.spawn_agent(1).expect("b");
        let p = params(5);
        add(&mut substrate, a, b, 5);
        substrate.with_agent(a, |agent, scope| {
            scope.link(agent.id(), b, Layer::NewContact, 1.0);
            scope.link(agent.id(), agent.id(), Layer::NewContact, 1.0);
        });
        substrate.synchronize();
        substrate
            .with_agent(a, |agent, scope| handle_new_contacts(agent, scope, &p))
            .expect("agent exists")
            .expect("commit");
        substrate.synchronize();
        assert_eq!(substrate.agent(a).expect("a").contacts().to_vec(), vec![b]);
        assert_eq!(substrate.graph().edges().count(Layer::NewContact), 0);
        assert_eq!(substrate.graph().edges().count(Layer::Contact), 1);
    }
}
