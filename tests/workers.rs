//! Worker-pool behavior observed through the public engine surface:
//! growth under concurrent sessions, shrink back to the floor when idle.

mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use support::*;
use weft::{Config, Engine};

#[test]
fn pool_grows_under_load_and_shrinks_when_idle() {
    init_log();
    let config = Config {
        min_workers: 1,
        max_workers: 4,
        max_worker_idle: Duration::from_secs(1),
        ..Config::default()
    };
    let engine = Engine::new(config, Arc::new(TestHost));
    assert_eq!(engine.live_workers(), 1);

    // four concurrent sessions, each with a request that naps on the
    // worker, forces the pool wide open
    let mut sessions = Vec::new();
    for _ in 0..4 {
        let (server_end, client_end) = pipe();
        let engine2 = Arc::clone(&engine);
        let server = thread::spawn(move || {
            let _ = engine2.serve_connection(server_end);
        });
        let client = TestClient::new(client_end);
        client.handshake();
        client.send_get(1, "/nap");
        sessions.push((client, server));
        // spread arrivals so each registration sees the busy pool and
        // grows it, instead of all landing on one idle worker
        thread::sleep(Duration::from_millis(50));
    }

    let mut peak = engine.live_workers();
    for (client, _) in sessions.iter_mut() {
        let response = client.collect_response(1, Duration::from_secs(10));
        assert!(response.status_is_200());
        assert_eq!(response.body, b"rested");
        peak = peak.max(engine.live_workers());
    }
    assert!(peak > 1, "pool never grew past one worker");
    assert!(peak <= 4);

    for (client, server) in sessions {
        client.close();
        server.join().unwrap();
    }

    // everyone idle: surplus workers should time out and exit
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if engine.live_workers() == 1 {
            break;
        }
        if Instant::now() > deadline {
            panic!(
                "workers did not shrink to min: {} live",
                engine.live_workers()
            );
        }
        thread::sleep(Duration::from_millis(50));
    }

    engine.shutdown();
    assert_eq!(engine.live_workers(), 0);
}
