// Test-only participants for multiplayer integration tests.
//
// Wraps the real `start_server` and `connect` front-ends, each driven by a
// `Ticker` in place of a game loop, and adds the blocking helpers tests need:
// wait for a join to be confirmed, wait for a condition to hold across
// sessions. Everything between the helpers (sockets, reader threads, the
// session logic) is the production code path.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use railnet_protocol::CarDescriptor;
use railnet_session::track::Collaborators;
use railnet_session::{
    ClientHandle, ServerHandle, Session, SessionConfig, SessionStatus, Ticker, connect,
    start_server,
};

/// Default timeout for blocking waits.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between checks of a waited-for condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Period of the tick threads.
const TICK_PERIOD: Duration = Duration::from_millis(10);

/// Config with short timers and a small consist library: `freight.con` has a
/// locomotive and two wagons, `light.con` a single locomotive.
pub fn test_config(name: &str) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.host = "127.0.0.1".into();
    config.port = 0;
    config.player.name = name.into();
    config.player.consist = Some("freight.con".into());
    config.player.path = "north".into();
    config.timing.move_interval_ms = 20;
    config.timing.resync_interval_ms = 200;
    config.timing.alive_interval_ms = 1000;
    config.timing.shutdown_grace_ms = 50;
    config.consists = BTreeMap::from([
        (
            "freight.con".to_owned(),
            vec![
                CarDescriptor::new("dash9.eng", "", false),
                CarDescriptor::new("boxcar.wag", "", false),
                CarDescriptor::new("tanker.wag", "", true),
            ],
        ),
        (
            "light.con".to_owned(),
            vec![CarDescriptor::new("gp38.eng", "", false)],
        ),
    ]);
    config
}

/// Block until `condition` holds, panicking with `what` after
/// `POLL_TIMEOUT`.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// A hosting participant with its own tick thread.
pub struct TestServer {
    handle: ServerHandle,
    ticker: Ticker,
    pub addr: SocketAddr,
}

impl TestServer {
    pub fn start(name: &str) -> Self {
        let config = test_config(name);
        let (handle, addr) = start_server(&config, Collaborators::from_config(&config))
            .expect("TestServer::start failed");
        let ticker =
            Ticker::spawn(handle.session().clone(), TICK_PERIOD).expect("tick thread failed");
        Self {
            handle,
            ticker,
            addr,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        self.handle.session()
    }

    /// Leave the session; connected clients fall back to single-player.
    pub fn stop(self) {
        self.ticker.stop();
        self.handle.stop();
    }
}

/// A joining participant with its own tick thread.
pub struct TestClient {
    handle: ClientHandle,
    ticker: Ticker,
}

impl TestClient {
    /// Connect and send the join, without waiting for the answer.
    pub fn connect(addr: SocketAddr, name: &str) -> Self {
        let mut config = test_config(name);
        config.port = addr.port();
        let handle =
            connect(&config, Collaborators::from_config(&config)).expect("TestClient::connect failed");
        let ticker =
            Ticker::spawn(handle.session().clone(), TICK_PERIOD).expect("tick thread failed");
        Self { handle, ticker }
    }

    /// Connect and wait until the server confirmed the join.
    pub fn join(addr: SocketAddr, name: &str) -> Self {
        let client = Self::connect(addr, name);
        wait_until(&format!("{name} to be admitted"), || {
            client.session().status() == SessionStatus::Active
        });
        client
    }

    pub fn session(&self) -> &Arc<Session> {
        self.handle.session()
    }

    pub fn disconnect(self) {
        self.ticker.stop();
        self.handle.disconnect();
    }
}
