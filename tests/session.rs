use std::fs;
use std::path::PathBuf;

use duet::archive::{DirectoryArchive, MemoryArchive};
use duet::model::{EchoModel, GenerationResponse};
use duet::note::Actor;
use duet::seeding::SeedPhase;
use duet::sink::RecordingSink;
use duet::{DuetConfig, Engine, History, InputEvent};

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("duet-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn step<A: duet::archive::Archive>(engine: &mut Engine<RecordingSink, A>, seconds: f64) {
    let steps = (seconds / 0.05).round() as usize;
    for _ in 0..steps {
        engine.advance(0.05);
        for request in engine.take_requests() {
            let notes = EchoModel::respond(&request);
            engine.apply_generation(GenerationResponse {
                epoch: request.epoch,
                notes: Some(notes),
            });
        }
    }
}

fn seed<A: duet::archive::Archive>(engine: &mut Engine<RecordingSink, A>) {
    for key in [30u8, 34, 37, 42, 37] {
        engine.handle_input(InputEvent::KeyDown { key, velocity: 0.7 });
        step(engine, 0.25);
        engine.handle_input(InputEvent::KeyUp { key });
        step(engine, 0.25);
    }
}

#[test]
fn full_session_archives_every_branch() {
    let dir = temp_dir("session");
    let config = DuetConfig::default();
    let archive = DirectoryArchive::new(&dir, 21, 0).expect("archive dir");
    let mut engine = Engine::new(config, RecordingSink::new(), archive).expect("engine");
    engine.set_title("integration");

    seed(&mut engine);
    step(&mut engine, 3.0);
    assert_eq!(engine.phase(), SeedPhase::Committed);

    step(&mut engine, 6.0);
    assert!(engine.sink().triggers().any(|t| t.actor == Actor::Model));

    let outcome = engine.rewind().expect("rewind");
    assert!(engine
        .history()
        .expect("history")
        .notes
        .iter()
        .all(|n| n.time < outcome.position));

    step(&mut engine, 3.0);
    assert!(engine.sink().triggers().any(|t| t.is_replay));
    engine.reset();
    assert_eq!(engine.phase(), SeedPhase::Idle);

    let mut yaml: Vec<PathBuf> = fs::read_dir(&dir)
        .expect("read archive")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|e| e == "yaml"))
        .collect();
    yaml.sort();
    assert_eq!(yaml.len(), 2);
    assert_eq!(
        fs::read_dir(&dir)
            .expect("read archive")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "mid"))
            .count(),
        2
    );

    let first = History::load(&yaml[0]).expect("first branch");
    assert_eq!(first.title, "integration");
    assert!(first.notes.iter().any(|n| n.actor == Actor::Player));
    assert!(first.notes.iter().all(|n| n.length.seconds().is_some()));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn archived_history_replays_as_shared_session() {
    let dir = temp_dir("replay");
    let archive = DirectoryArchive::new(&dir, 21, 0).expect("archive dir");
    let mut engine = Engine::new(DuetConfig::default(), RecordingSink::new(), archive).expect("engine");
    seed(&mut engine);
    engine.reset();

    for ext in ["yaml", "mid"] {
        let path = fs::read_dir(&dir)
            .expect("read archive")
            .filter_map(|e| e.ok().map(|e| e.path()))
            .find(|p| p.extension().is_some_and(|e| e == ext))
            .expect("archived file");
        let shared = History::load_shared(&path, 21, 88).expect("load shared");
        assert_eq!(shared.notes.len(), 5);

        let mut replay = Engine::new(DuetConfig::default(), RecordingSink::new(), MemoryArchive::new())
            .expect("engine");
        replay.load_shared(shared);
        assert_eq!(replay.phase(), SeedPhase::Committed);
        step(&mut replay, 3.0);

        let replayed: Vec<_> = replay.sink().triggers().filter(|t| t.is_replay).collect();
        assert_eq!(replayed.len(), 5);
        let keys: Vec<u8> = replayed.iter().map(|t| t.key).collect();
        assert_eq!(keys, vec![30, 34, 37, 42, 37]);
    }

    let _ = fs::remove_dir_all(&dir);
}
