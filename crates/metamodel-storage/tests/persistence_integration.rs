use metamodel_core::{AgentParams, Model, ModelConfig};
use metamodel_storage::{StoragePipeline, Table};

fn config() -> ModelConfig {
    ModelConfig {
        grid_width: 10,
        grid_height: 10,
        partitions: 2,
        occupation_rate: 0.4,
        persistence_interval: 1,
        history_capacity: 16,
        rng_seed: Some(0x5eed),
        agent: AgentParams {
            max_contacts: 3,
            ..AgentParams::default()
        },
        ..ModelConfig::default()
    }
}

#[test]
fn pipeline_persists_ticks_agents_and_contacts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("metamodel.duckdb");
    let path_str = path.to_str().expect("utf8 path");
    let pipeline = StoragePipeline::with_thresholds(path_str, 1, 1, 1).expect("pipeline");
    let storage = pipeline.storage();

    let final_states = {
        let mut model = Model::with_persistence(config(), Box::new(pipeline)).expect("model");
        model.run(5).expect("run");
        model.agent_states()
    };

    let mut guard = storage.lock().expect("storage lock");
    guard.flush().expect("flush");
    assert_eq!(guard.row_count(Table::Ticks).expect("ticks"), 5);
    assert_eq!(
        guard.row_count(Table::Agents).expect("agents"),
        5 * final_states.len() as i64
    );

    let metrics = guard.latest_metrics(32).expect("latest metrics");
    assert!(!metrics.is_empty(), "expected persisted metrics");
    assert!(metrics.iter().all(|reading| reading.tick == 4));
    assert!(metrics.iter().any(|reading| reading.name == "tick_micros"));

    for state in &final_states {
        let contacts = guard.contacts_at(4, state.id).expect("contacts");
        assert_eq!(contacts, state.contacts.to_vec(), "agent {}", state.id);
    }

    let ranked = guard.most_connected(3).expect("connectivity");
    assert!(ranked.len() <= 3);
    assert!(
        ranked
            .windows(2)
            .all(|pair| pair[0].avg_contacts >= pair[1].avg_contacts)
    );
    assert!(ranked.iter().all(|stats| stats.max_contacts <= 3));
}

#[test]
fn persistence_interval_thins_recorded_ticks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sparse.duckdb");
    let path_str = path.to_str().expect("utf8 path");
    let pipeline = StoragePipeline::new(path_str).expect("pipeline");
    let storage = pipeline.storage();
    {
        let config = ModelConfig {
            persistence_interval: 3,
            ..config()
        };
        let mut model = Model::with_persistence(config, Box::new(pipeline)).expect("model");
        model.run(7).expect("run");
    }
    let mut guard = storage.lock().expect("storage lock");
    // ticks 0, 3 and 6
    assert_eq!(guard.row_count(Table::Ticks).expect("ticks"), 3);
}
