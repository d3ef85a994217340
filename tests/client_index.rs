//! The client map and the camera index must agree after any interleaving of
//! add, remove, disconnect and frame delivery.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camstream::capture::{Frame, PixelFormat};
use camstream::pipeline::ProcessingResult;
use camstream::stream::{StreamConfig, StreamEngine, Subscription};
use proptest::prelude::*;
use serde_json::json;

const CAMERAS: [&str; 3] = ["cam0", "cam1", "cam2"];
const LIMIT: usize = 2;

#[derive(Debug, Clone)]
enum Op {
    Add { client: u8, camera: usize },
    Remove { client: u8 },
    Disconnect { client: u8 },
    Frame { camera: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, 0usize..3).prop_map(|(client, camera)| Op::Add { client, camera }),
        (0u8..6).prop_map(|client| Op::Remove { client }),
        (0u8..6).prop_map(|client| Op::Disconnect { client }),
        (0usize..3).prop_map(|camera| Op::Frame { camera }),
    ]
}

fn engine() -> StreamEngine {
    let engine = StreamEngine::new();
    engine
        .initialize(StreamConfig {
            max_clients_per_camera: LIMIT,
            ..Default::default()
        })
        .unwrap();
    engine.start().unwrap();
    engine
}

fn result(camera: &str) -> ProcessingResult {
    let frame = Frame::new(camera, 4, 4, PixelFormat::Rgb24, vec![10u8; 4 * 4 * 3]);
    ProcessingResult::ok(frame, json!({}), Duration::ZERO)
}

/// Index consistency that must hold regardless of history.
fn assert_consistent(engine: &StreamEngine) {
    let mut indexed = BTreeSet::new();
    for camera in engine.cameras() {
        let clients = engine.camera_clients(&camera);
        assert!(!clients.is_empty(), "empty index entry for {camera}");
        assert!(clients.len() <= LIMIT);
        assert_eq!(clients.len(), engine.camera_client_count(&camera));
        for id in clients {
            assert!(indexed.insert(id.clone()), "{id} indexed twice");
            assert_eq!(engine.client_info(&id).unwrap().camera_id, camera);
        }
    }
    let active: BTreeSet<String> = engine.active_clients().into_iter().collect();
    assert_eq!(active, indexed);
    assert_eq!(engine.client_count(), active.len());
}

proptest! {
    #[test]
    fn index_matches_model(ops in prop::collection::vec(op(), 1..60)) {
        let engine = engine();
        // client id -> (camera, live subscription)
        let mut model: BTreeMap<String, (usize, Option<Subscription>)> = BTreeMap::new();
        let t0 = Instant::now();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                Op::Add { client, camera } => {
                    let id = format!("c{client}");
                    let on_camera = model.values().filter(|(cam, _)| *cam == camera).count();
                    let expect_ok = !model.contains_key(&id) && on_camera < LIMIT;
                    let added = engine.add_client(id.as_str(), CAMERAS[camera]);
                    prop_assert_eq!(added.is_ok(), expect_ok);
                    if let Ok(sub) = added {
                        model.insert(id, (camera, Some(sub)));
                    }
                }
                Op::Remove { client } => {
                    let id = format!("c{client}");
                    prop_assert_eq!(engine.remove_client(&id), model.remove(&id).is_some());
                }
                Op::Disconnect { client } => {
                    if let Some((_, sub)) = model.get_mut(&format!("c{client}")) {
                        sub.take();
                    }
                }
                Op::Frame { camera } => {
                    let at = t0 + Duration::from_millis(step as u64 * 100);
                    engine.handle_frame_at(&result(CAMERAS[camera]), at);
                    // disconnected subscribers of that camera are removed on delivery
                    model.retain(|_, (cam, sub)| *cam != camera || sub.is_some());
                    for (_, sub) in model.values_mut() {
                        if let Some(sub) = sub {
                            sub.drain();
                        }
                    }
                }
            }

            assert_consistent(&engine);
            let expected: Vec<String> = model.keys().cloned().collect();
            prop_assert_eq!(engine.active_clients(), expected);
        }
    }
}

#[test]
fn threaded_interleaving_keeps_index_consistent() {
    let engine = Arc::new(engine());

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut subs = Vec::new();
                for round in 0..200usize {
                    let camera = CAMERAS[(worker + round) % CAMERAS.len()];
                    let id = format!("w{worker}-{}", round % 5);
                    match round % 4 {
                        0 | 1 => {
                            if let Ok(sub) = engine.add_client(id.as_str(), camera) {
                                subs.push(sub);
                            }
                        }
                        2 => {
                            engine.remove_client(&id);
                        }
                        _ => {
                            // drop one subscription without removing it
                            subs.pop();
                            engine.handle_frame(&result(camera));
                        }
                    }
                    for sub in &mut subs {
                        sub.drain();
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_consistent(&engine);
    engine.stop();
    assert_eq!(engine.client_count(), 0);
    assert!(engine.cameras().is_empty());
}
