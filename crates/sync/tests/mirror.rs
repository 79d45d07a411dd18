//! Long-running worker: the delta-fed mirror never drifts from the worker.

use chronostate_common::Value;
use chronostate_sync::{ReducerRegistry, WorkerConfig, spawn_worker};
use serde_json::json;

fn board_registry() -> ReducerRegistry {
    let mut registry = ReducerRegistry::new();
    registry.register("move", |state, payload| {
        let mut board = state.as_map().cloned().ok_or("board must be a map")?;
        let piece = payload.as_str().ok_or("piece must be a string")?;
        let position = board.get(piece).and_then(Value::as_int).unwrap_or(0);
        board.insert(piece.to_owned(), Value::Int(position + 1));
        Ok(Value::Map(board))
    });
    registry.register("remove", |state, payload| {
        let mut board = state.as_map().cloned().ok_or("board must be a map")?;
        let piece = payload.as_str().ok_or("piece must be a string")?;
        board.remove(piece).ok_or("no such piece")?;
        Ok(Value::Map(board))
    });
    registry
}

#[tokio::test]
async fn mirror_matches_worker_after_many_actions() {
    let mut worker = spawn_worker(board_registry(), Value::map(), WorkerConfig { channel_capacity: 2 });
    for round in 0..200 {
        let piece = ["knight", "rook", "pawn"][round % 3];
        worker.dispatch("move", Value::from(piece)).await.unwrap();
        if round % 50 == 49 {
            worker.dispatch("remove", Value::from("pawn")).await.unwrap();
        }
    }
    let mirrored = worker.snapshot().clone();
    let version = worker.version();
    worker.resync().await.unwrap();
    assert_eq!(worker.version(), version);
    assert_eq!(worker.snapshot(), &mirrored);
    assert_eq!(mirrored.as_map().unwrap()["knight"], Value::from(json!(67)));
}
