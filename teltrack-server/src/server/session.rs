//! Terminal session handling.
//!
//! Each TCP connection is owned by one [`Session`] task. Protocol
//! behavior lives in [`DeviceSession`], a synchronous state machine that
//! maps one inbound message to a list of side effects and at most one
//! acknowledgement; the async task merely drives bytes through the frame
//! assembler and executes the effects it is handed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use teltrack_protocol::{codec, DeviceId, FrameAssembler, Location, Message};

use crate::database::{DatabaseHandle, HeartbeatRecord, PositionRecord};
use crate::registry::DeviceRegistry;
use crate::server::listener::SessionConfig;

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for a login.
    Unauthenticated,
    /// Login accepted, identifier bound.
    Authenticated,
    /// Connection torn down, binding released.
    Closed,
}

/// A side effect requested by the state machine. Effects are listed,
/// not executed inline, so transitions stay testable without a runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Bind the device to this session and persist the login.
    Bind(teltrack_protocol::Login),
    /// Refresh the device's last-seen time.
    Touch(DeviceId),
    /// Persist a heartbeat status sample.
    StoreHeartbeat(HeartbeatRecord),
    /// Persist an accepted position and cache it on the registry entry.
    StorePosition(PositionRecord),
}

/// An acknowledgement to send, echoing the inbound serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub protocol: u8,
    pub serial: u16,
}

/// Result of applying one inbound message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transition {
    pub effects: Vec<Effect>,
    pub response: Option<Ack>,
}

/// Per-connection protocol state machine.
#[derive(Debug)]
pub struct DeviceSession {
    state: SessionState,
    device_id: Option<DeviceId>,
    dedup_window: Duration,
    /// When the last location was accepted for storage.
    last_accepted_at: Option<Instant>,
}

impl DeviceSession {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            state: SessionState::Unauthenticated,
            device_id: None,
            dedup_window,
            last_accepted_at: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device_id(&self) -> Option<DeviceId> {
        self.device_id
    }

    /// Apply one inbound message.
    ///
    /// `protocol` is the wire protocol number the frame carried; the
    /// acknowledgement echoes it along with `serial`.
    pub fn handle(&mut self, msg: &Message, protocol: u8, serial: u16, now: Instant) -> Transition {
        match (self.state, msg) {
            (SessionState::Unauthenticated, Message::Login(login)) => {
                self.state = SessionState::Authenticated;
                self.device_id = Some(login.device_id);
                Transition {
                    effects: vec![Effect::Bind(*login)],
                    response: Some(Ack { protocol, serial }),
                }
            }
            (SessionState::Unauthenticated, Message::Heartbeat(_) | Message::Location(_)) => {
                warn!(
                    "Protocol violation: {} before login (serial {})",
                    msg.kind(),
                    serial
                );
                Transition::default()
            }
            (SessionState::Authenticated, Message::Login(login)) => {
                // Re-authentication refreshes the binding.
                self.device_id = Some(login.device_id);
                Transition {
                    effects: vec![Effect::Bind(*login)],
                    response: Some(Ack { protocol, serial }),
                }
            }
            (SessionState::Authenticated, Message::Heartbeat(hb)) => {
                let device_id = self.device_id.expect("authenticated without identifier");
                Transition {
                    effects: vec![
                        Effect::Touch(device_id),
                        Effect::StoreHeartbeat(HeartbeatRecord {
                            device_id,
                            battery_level: hb.battery_level,
                            signal_strength: hb.signal_strength,
                            terminal_info: hb.terminal_info,
                        }),
                    ],
                    response: Some(Ack { protocol, serial }),
                }
            }
            (SessionState::Authenticated, Message::Location(loc)) => {
                let device_id = self.device_id.expect("authenticated without identifier");
                let accepted = match self.last_accepted_at {
                    Some(last) => now.duration_since(last) >= self.dedup_window,
                    None => true,
                };
                // The ack is a transport contract: sent even when the
                // report is deduplicated against storage.
                let mut effects = vec![Effect::Touch(device_id)];
                if accepted {
                    self.last_accepted_at = Some(now);
                    effects.push(Effect::StorePosition(position_record(device_id, loc)));
                } else {
                    debug!(
                        "Deduplicated location for {} (serial {})",
                        device_id, serial
                    );
                }
                Transition {
                    effects,
                    response: Some(Ack { protocol, serial }),
                }
            }
            (_, Message::Unknown { protocol, body }) => {
                debug!(
                    "Unknown protocol {:#04X} ({} byte body), ignoring",
                    protocol,
                    body.len()
                );
                Transition::default()
            }
            (SessionState::Closed, _) => Transition::default(),
        }
    }

    /// Tear down the session. Returns the identifier whose binding must
    /// be released, if the session was authenticated.
    pub fn close(&mut self) -> Option<DeviceId> {
        self.state = SessionState::Closed;
        self.device_id.take()
    }
}

fn position_record(device_id: DeviceId, loc: &Location) -> PositionRecord {
    PositionRecord {
        device_id,
        recorded_at: loc.timestamp,
        latitude: loc.latitude,
        longitude: loc.longitude,
        speed_kmh: loc.speed_kmh,
        course: loc.course(),
        satellites: loc.satellites,
        acc_on: loc.acc_on,
    }
}

/// A terminal connection. Generic over the stream so the connection
/// driver can run against in-memory pipes in tests.
pub struct Session<S> {
    /// Unique session ID.
    id: u64,
    /// Terminal address.
    #[allow(dead_code)]
    addr: SocketAddr,
    /// TCP socket.
    socket: S,
    /// Frame reassembly buffer.
    assembler: FrameAssembler,
    /// Protocol state machine.
    machine: DeviceSession,
    /// Reference to the device registry.
    registry: Arc<DeviceRegistry>,
    /// Reference to the database.
    database: DatabaseHandle,
    /// Idle and persistence timeouts.
    config: SessionConfig,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        socket: S,
        registry: Arc<DeviceRegistry>,
        database: DatabaseHandle,
        config: SessionConfig,
    ) -> Self {
        let machine = DeviceSession::new(config.dedup_window);
        Self {
            id,
            addr,
            socket,
            assembler: FrameAssembler::new(),
            machine,
            registry,
            database,
            config,
        }
    }

    /// Drive the connection until the peer disconnects or goes idle.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut buf = [0u8; 2048];

        loop {
            let read = tokio::time::timeout(self.config.idle_timeout, self.socket.read(&mut buf));
            let n = match read.await {
                Ok(Ok(0)) => {
                    debug!("[Session {}] Peer closed connection", self.id);
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.teardown().await;
                    return Err(e);
                }
                Err(_) => {
                    info!(
                        "[Session {}] Idle for {:?}, closing",
                        self.id, self.config.idle_timeout
                    );
                    break;
                }
            };

            let results: Vec<_> = self.assembler.feed(&buf[..n]).collect();
            for result in results {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("[Session {}] Framing fault: {}", self.id, e);
                        continue;
                    }
                };
                let msg = codec::decode(&frame);
                debug!(
                    "[Session {}] Received {} (protocol {:#04X}, serial {})",
                    self.id,
                    msg.kind(),
                    frame.protocol,
                    frame.serial
                );

                let transition =
                    self.machine
                        .handle(&msg, frame.protocol, frame.serial, Instant::now());
                for effect in transition.effects {
                    self.apply(effect).await;
                }
                if let Some(ack) = transition.response {
                    let bytes = codec::encode_ack(ack.protocol, ack.serial);
                    // A failed ack write ends the session; the binding
                    // must still be released.
                    if let Err(e) = self.socket.write_all(&bytes).await {
                        self.teardown().await;
                        return Err(e);
                    }
                }
            }
        }

        // Partially buffered bytes are discarded with the connection.
        self.teardown().await;
        Ok(())
    }

    async fn apply(&mut self, effect: Effect) {
        let now = Instant::now();
        match effect {
            Effect::Bind(login) => {
                if let Some(superseded) = self.registry.bind(login.device_id, self.id, now).await {
                    info!(
                        "[Session {}] Device {} taken over from session {}",
                        self.id, login.device_id, superseded
                    );
                } else {
                    info!("[Session {}] Device {} logged in", self.id, login.device_id);
                }
                self.store(move |db| db.record_login(&login).map(|_| ()));
            }
            Effect::Touch(device_id) => {
                self.registry.touch(device_id, self.id, now).await;
            }
            Effect::StoreHeartbeat(record) => {
                self.store(move |db| db.insert_heartbeat(&record).map(|_| ()));
            }
            Effect::StorePosition(record) => {
                self.registry
                    .record_position(record.device_id, self.id, record.clone(), now)
                    .await;
                self.store(move |db| db.insert_position(&record).map(|_| ()));
            }
        }
    }

    /// Fire-and-forget database write, bounded by a short timeout.
    /// Persistence failures are logged and never stall the session or
    /// suppress the acknowledgement.
    fn store<F>(&self, op: F)
    where
        F: FnOnce(&crate::database::Database) -> crate::database::Result<()> + Send + 'static,
    {
        let database = self.database.clone();
        let timeout = self.config.store_timeout;
        let session_id = self.id;
        tokio::spawn(async move {
            let write = async {
                let db = database.lock().await;
                op(&db)
            };
            match tokio::time::timeout(timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[Session {}] Database write failed: {}", session_id, e),
                Err(_) => warn!(
                    "[Session {}] Database write timed out after {:?}",
                    session_id, timeout
                ),
            }
        });
    }

    async fn teardown(&mut self) {
        if let Some(device_id) = self.machine.close() {
            self.registry.release(device_id, self.id).await;
            info!("[Session {}] Released device {}", self.id, device_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use teltrack_protocol::{Frame, Heartbeat, Login, PROTO_HEARTBEAT, PROTO_LOCATION_EXT, PROTO_LOGIN};

    const DEDUP: Duration = Duration::from_secs(10);

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn login_msg() -> Message {
        Message::Login(Login {
            device_id: DeviceId::new(867_440_069_849_404).unwrap(),
            model_code: 0x0123,
            timezone_language: 0x0001,
        })
    }

    fn heartbeat_msg() -> Message {
        Message::Heartbeat(Heartbeat {
            terminal_info: 0x40,
            battery_level: 4,
            signal_strength: 3,
            extended_status: 0x0001,
        })
    }

    fn location_msg() -> Message {
        Message::Location(Location {
            timestamp: chrono::NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(9, 30, 45)
                .unwrap(),
            satellites: 8,
            latitude: 22.575833,
            longitude: 113.915653,
            speed_kmh: 50,
            course_status: 0x154C,
            mcc: 460,
            mnc: 0,
            lac: 0x287D,
            cell_id: 0x001F71,
            acc_on: true,
        })
    }

    fn has_store(transition: &Transition) -> bool {
        transition
            .effects
            .iter()
            .any(|e| matches!(e, Effect::StorePosition(_)))
    }

    #[test]
    fn test_heartbeat_before_login_is_violation() {
        let mut machine = DeviceSession::new(DEDUP);
        let t = machine.handle(&heartbeat_msg(), PROTO_HEARTBEAT, 7, Instant::now());
        assert!(t.effects.is_empty());
        assert!(t.response.is_none());
        assert_eq!(machine.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_location_before_login_is_violation() {
        let mut machine = DeviceSession::new(DEDUP);
        let t = machine.handle(&location_msg(), PROTO_LOCATION_EXT, 7, Instant::now());
        assert!(t.effects.is_empty());
        assert!(t.response.is_none());
    }

    #[test]
    fn test_login_binds_and_acks() {
        let mut machine = DeviceSession::new(DEDUP);
        let t = machine.handle(&login_msg(), PROTO_LOGIN, 1, Instant::now());
        assert!(matches!(t.effects[..], [Effect::Bind(_)]));
        assert_eq!(
            t.response,
            Some(Ack {
                protocol: PROTO_LOGIN,
                serial: 1
            })
        );
        assert_eq!(machine.state(), SessionState::Authenticated);
        assert_eq!(
            machine.device_id(),
            Some(DeviceId::new(867_440_069_849_404).unwrap())
        );
    }

    #[test]
    fn test_heartbeat_after_login_acks_same_serial() {
        let mut machine = DeviceSession::new(DEDUP);
        let now = Instant::now();
        machine.handle(&login_msg(), PROTO_LOGIN, 1, now);

        let t = machine.handle(&heartbeat_msg(), PROTO_HEARTBEAT, 7, now);
        assert_eq!(
            t.response,
            Some(Ack {
                protocol: PROTO_HEARTBEAT,
                serial: 7
            })
        );
        assert!(t
            .effects
            .iter()
            .any(|e| matches!(e, Effect::StoreHeartbeat(_))));
        assert!(t.effects.iter().any(|e| matches!(e, Effect::Touch(_))));
    }

    #[test]
    fn test_relogin_refreshes_binding() {
        let mut machine = DeviceSession::new(DEDUP);
        let now = Instant::now();
        machine.handle(&login_msg(), PROTO_LOGIN, 1, now);
        let t = machine.handle(&login_msg(), PROTO_LOGIN, 2, now);
        assert!(matches!(t.effects[..], [Effect::Bind(_)]));
        assert_eq!(t.response.map(|a| a.serial), Some(2));
        assert_eq!(machine.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_dedup_boundary() {
        let mut machine = DeviceSession::new(DEDUP);
        let t0 = Instant::now();
        machine.handle(&login_msg(), PROTO_LOGIN, 1, t0);

        let first = machine.handle(&location_msg(), PROTO_LOCATION_EXT, 2, t0);
        assert!(has_store(&first));
        assert!(first.response.is_some());

        // 9.9s later: dropped but still acknowledged.
        let near = t0 + Duration::from_millis(9_900);
        let second = machine.handle(&location_msg(), PROTO_LOCATION_EXT, 3, near);
        assert!(!has_store(&second));
        assert_eq!(second.response.map(|a| a.serial), Some(3));

        // 10.1s after the first accept: accepted again.
        let far = t0 + Duration::from_millis(10_100);
        let third = machine.handle(&location_msg(), PROTO_LOCATION_EXT, 4, far);
        assert!(has_store(&third));
    }

    #[test]
    fn test_dedup_window_anchored_to_accepted_report() {
        let mut machine = DeviceSession::new(DEDUP);
        let t0 = Instant::now();
        machine.handle(&login_msg(), PROTO_LOGIN, 1, t0);
        machine.handle(&location_msg(), PROTO_LOCATION_EXT, 2, t0);

        // A deduped report must not extend the window.
        let mid = t0 + Duration::from_secs(5);
        let deduped = machine.handle(&location_msg(), PROTO_LOCATION_EXT, 3, mid);
        assert!(!has_store(&deduped));

        let after = t0 + Duration::from_secs(11);
        let accepted = machine.handle(&location_msg(), PROTO_LOCATION_EXT, 4, after);
        assert!(has_store(&accepted));
    }

    #[test]
    fn test_unknown_ignored_in_any_state() {
        let mut machine = DeviceSession::new(DEDUP);
        let unknown = Message::Unknown {
            protocol: 0x94,
            body: Bytes::from_static(&[0x01, 0x02]),
        };
        let t = machine.handle(&unknown, 0x94, 5, Instant::now());
        assert_eq!(t, Transition::default());
        assert_eq!(machine.state(), SessionState::Unauthenticated);

        machine.handle(&login_msg(), PROTO_LOGIN, 1, Instant::now());
        let t = machine.handle(&unknown, 0x94, 6, Instant::now());
        assert_eq!(t, Transition::default());
        assert_eq!(machine.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_close_releases_identifier_once() {
        let mut machine = DeviceSession::new(DEDUP);
        machine.handle(&login_msg(), PROTO_LOGIN, 1, Instant::now());
        assert_eq!(
            machine.close(),
            Some(DeviceId::new(867_440_069_849_404).unwrap())
        );
        assert_eq!(machine.state(), SessionState::Closed);
        assert_eq!(machine.close(), None);
    }

    #[test]
    fn test_end_to_end_pinned_frames() {
        // Decoded from captured traffic: login then location, dedup off
        // the critical path because only one location arrives.
        let mut assembler = FrameAssembler::new();
        let mut machine = DeviceSession::new(DEDUP);
        let mut stream = hex("787811010867440069849404012300010001233f0d0a");
        stream.extend(hex(
            "7878202218030f091e2d08026c10540c38c97032154c01cc00287d001f71010003e9770d0a",
        ));

        let frames: Vec<Frame> = assembler
            .feed(&stream)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(frames.len(), 2);

        let now = Instant::now();
        let login = machine.handle(&codec::decode(&frames[0]), frames[0].protocol, frames[0].serial, now);
        assert_eq!(
            codec::encode_ack(login.response.unwrap().protocol, login.response.unwrap().serial)
                .to_vec(),
            hex("787805010001d9dc0d0a")
        );
        assert_eq!(
            machine.device_id(),
            Some(DeviceId::new(867_440_069_849_404).unwrap())
        );

        let loc = machine.handle(&codec::decode(&frames[1]), frames[1].protocol, frames[1].serial, now);
        let Some(Effect::StorePosition(record)) = loc
            .effects
            .iter()
            .find(|e| matches!(e, Effect::StorePosition(_)))
        else {
            panic!("expected a stored position");
        };
        assert!((record.latitude - 22.575_833_333_333_332).abs() < 1e-9);
        assert!((record.longitude - 113.915_653_333_333_34).abs() < 1e-9);
        assert_eq!(record.course, 332);
        assert_eq!(
            codec::encode_ack(loc.response.unwrap().protocol, loc.response.unwrap().serial).to_vec(),
            hex("78780522000316910d0a")
        );
    }

    #[tokio::test]
    async fn test_failed_ack_write_releases_binding() {
        let device_id = DeviceId::new(867_440_069_849_404).unwrap();

        // Deliver a valid login, then drop our end of the pipe so the
        // acknowledgement write fails mid-session.
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(&hex("787811010867440069849404012300010001233f0d0a"))
            .await
            .unwrap();
        drop(client);

        let registry = Arc::new(DeviceRegistry::new());
        let database = Arc::new(tokio::sync::Mutex::new(
            crate::database::Database::open_in_memory().unwrap(),
        ));
        let mut session = Session::new(
            1,
            "127.0.0.1:0".parse().unwrap(),
            server,
            Arc::clone(&registry),
            database,
            SessionConfig::default(),
        );

        assert!(session.run().await.is_err());

        // The device stays known but its binding must be gone.
        let entry = registry.lookup(device_id).await.unwrap();
        assert_eq!(entry.session_id, None);
    }
}
