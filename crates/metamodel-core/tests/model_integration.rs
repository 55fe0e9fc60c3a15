use metamodel_core::{
    AgentInteractions, AgentParams, Attractor, CellInteraction, Environment, GridPoint, Layer,
    Model, ModelConfig, MovePolicy, Phase, Tick, UtilityKind,
};

fn grid_config(seed: u64) -> ModelConfig {
    ModelConfig {
        grid_width: 12,
        grid_height: 12,
        partitions: 4,
        occupation_rate: 0.3,
        rng_seed: Some(seed),
        agent: AgentParams {
            max_contacts: 3,
            range_size: 1,
            ..AgentParams::default()
        },
        ..ModelConfig::default()
    }
}

#[test]
fn contacts_stay_bounded_and_mirrored_on_every_environment() {
    for environment in [
        Environment::Grid,
        Environment::Random,
        Environment::Clustered,
        Environment::SmallWorld,
    ] {
        let config = ModelConfig {
            environment,
            num_cells: 120,
            output_degree: 4,
            p: 0.2,
            ..grid_config(17)
        };
        let mut model = Model::new(config).expect("model");
        for _ in 0..12 {
            model.step().expect("step");
            model
                .check_contacts()
                .unwrap_or_else(|err| panic!("{environment:?}: {err}"));
            assert!(model.agents().all(|agent| agent.contacts().len() <= 3));
        }
        assert_eq!(model.graph().edges().count(Layer::NewContact), 0);
    }
}

#[test]
fn max_policy_drives_agents_toward_the_attractor() {
    let config = ModelConfig {
        utility: UtilityKind::Linear,
        attractors: vec![Attractor::new(GridPoint::new(6, 6), 10.0)],
        agent_interactions: AgentInteractions::None,
        agent: AgentParams {
            move_policy: MovePolicy::Max,
            range_size: 1,
            ..AgentParams::default()
        },
        ..grid_config(5)
    };
    let mut model = Model::new(config).expect("model");
    model.run(20).expect("run");
    let target = GridPoint::new(6, 6);
    for state in model.agent_states() {
        let point = state.location_point.expect("grid cells carry points");
        assert_eq!(point, target, "agent {} stuck at {point:?}", state.id);
    }
}

#[test]
fn disabled_contacts_leave_contact_layers_empty() {
    let config = ModelConfig {
        agent_interactions: AgentInteractions::None,
        ..grid_config(8)
    };
    let mut model = Model::new(config).expect("model");
    let summaries: Vec<_> = (0..5).map(|_| model.step().expect("step")).collect();
    assert!(summaries.iter().all(|summary| summary.contact_edges == 0));
    assert!(model.agents().all(|agent| agent.contacts().is_empty()));
    assert_eq!(model.tick(), Tick(5));
}

#[test]
fn cell_interactions_are_probed_and_committed() {
    let config = ModelConfig {
        cell_interactions: CellInteraction::ReadAllWriteAll,
        dynamic_cell_edge_weights: true,
        cell_edge_weight: 0.25,
        ..grid_config(12)
    };
    let mut model = Model::new(config).expect("model");
    let summary = model.step().expect("step");
    let successors = model.graph().edges().count(Layer::CellSuccessor) as u64;
    assert!(summary.probes.local_writes + summary.probes.distant_writes >= successors);
    assert!(summary.probes.distant_writes > 0);
    let acquisitions: u64 = model.graph().cells().iter().map(|cell| cell.acquisitions()).sum();
    assert_eq!(acquisitions, successors);
    assert!(
        model
            .graph()
            .edges()
            .iter()
            .filter(|edge| edge.layer == Layer::CellSuccessor)
            .all(|edge| edge.weight >= 0.25)
    );
}

#[test]
fn manual_phases_match_barrier_protocol() {
    let mut model = Model::new(grid_config(30)).expect("model");
    model
        .run_phase(Phase::CreateRelationsFromNeighborhood)
        .expect("neighborhood");
    assert!(model.run_phase(Phase::Move).is_err());
    model.synchronize();
    model.run_phase(Phase::Move).expect("move after barrier");
    model.synchronize();
    model.check_contacts().expect("mirror");
}

#[test]
fn agent_states_round_trip_through_json() {
    let mut model = Model::new(grid_config(44)).expect("model");
    model.run(4).expect("run");
    let states = model.agent_states();
    let json = serde_json::to_string(&states).expect("serialize");
    let restored: Vec<metamodel_core::AgentState> =
        serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored, states);
    for state in &states {
        assert!(!state.perceptions.contains(&state.id));
    }
}
