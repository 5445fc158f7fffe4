//! Engine discovery: ping a running engine, or spawn one locally and retry
//!
//! ```text
//! Idle → AwaitingAck ─┬─ ack ──────────────────────────────→ Connected
//!                     ├─ timeout, fail_on_not_found ───────→ Failed
//!                     └─ timeout → SpawningLocal → AwaitingAck2 ─┬─ ack → Connected
//!                                                                └─ timeout → Failed
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rosc::OscType;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::launcher::EngineLauncher;
use crate::transport::{int_arg, str_arg, ArgKind, OscTransport};

/// Host a spawned engine is reached on
pub const LOCAL_ENGINE_HOST: &str = "127.0.0.1";

/// Handshake wait used when none is configured
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(700);

pub const PING_PATH: &str = "/ping";
pub const PING_ACK_PATH: &str = "/pingack";

/// Where the engine listens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct EngineAddress {
    pub host: String,
    pub port: u16,
}

impl EngineAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address of an engine spawned on this machine
    pub fn local(port: u16) -> Self {
        Self::new(LOCAL_ENGINE_HOST, port)
    }

    /// Resolve to a socket address, preferring IPv4 to match the bound endpoint
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if self.host.is_empty() {
            return Err(EngineError::InvalidAddress(self.to_string()));
        }

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| EngineError::InvalidAddress(format!("{} ({})", self, e)))?
            .collect();

        candidates
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| EngineError::InvalidAddress(self.to_string()))
    }

    /// Local interface address the OS routes toward this engine
    ///
    /// Connecting a UDP socket sends nothing; it only selects the route.
    pub async fn local_route(&self) -> Result<IpAddr> {
        let target = self.resolve().await?;
        let route_err = |e: std::io::Error| EngineError::InvalidAddress(format!("{} ({})", self, e));

        let any: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let scout = UdpSocket::bind(any).await.map_err(route_err)?;
        scout.connect(target).await.map_err(route_err)?;
        Ok(scout.local_addr().map_err(route_err)?.ip())
    }
}

impl fmt::Display for EngineAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Reply to `/ping`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingAck {
    pub host_url: String,
    pub version: String,
    pub loop_count: i32,
}

/// Handshake progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorState {
    Idle,
    AwaitingAck,
    SpawningLocal,
    AwaitingAck2,
    Connected(PingAck),
    Failed,
}

/// Handshake knobs
#[derive(Debug, Clone)]
pub struct LocatorOptions {
    pub timeout: Duration,
    /// Give up instead of spawning a local engine when nobody answers
    pub fail_on_not_found: bool,
}

impl Default for LocatorOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            fail_on_not_found: false,
        }
    }
}

#[derive(Debug, Default)]
struct PendingHandshake {
    ack: Option<PingAck>,
}

impl PendingHandshake {
    fn acknowledged(&self) -> bool {
        self.ack.is_some()
    }
}

/// Acknowledgment flag shared between the `/pingack` handler and the waiter
///
/// `pending` is `Some` only while a handshake phase is open; acks arriving
/// outside a phase are ignored.
#[derive(Default)]
struct Handshake {
    pending: Mutex<Option<PendingHandshake>>,
    notify: Notify,
}

impl Handshake {
    fn arm(&self) {
        *self.pending.lock() = Some(PendingHandshake::default());
    }

    fn acknowledge(&self, ack: PingAck) {
        let signalled = {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(p) if !p.acknowledged() => {
                    debug!("Handshake acknowledged by {} (v{})", ack.host_url, ack.version);
                    p.ack = Some(ack);
                    true
                }
                Some(_) => {
                    debug!("Ignoring duplicate ping ack from {}", ack.host_url);
                    false
                }
                None => {
                    debug!("Ignoring late ping ack from {}", ack.host_url);
                    false
                }
            }
        };
        if signalled {
            self.notify.notify_one();
        }
    }

    /// Close the phase if an ack arrived; leave it open otherwise
    fn take_ack(&self) -> Option<PingAck> {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(PendingHandshake::acknowledged) {
            pending.take().and_then(|p| p.ack)
        } else {
            None
        }
    }

    /// Close the phase and return whatever ack made it in, in one critical section
    fn disarm(&self) -> Option<PingAck> {
        self.pending.lock().take().and_then(|p| p.ack)
    }

    async fn wait(&self, timeout: Duration, transport: &OscTransport) -> Result<Option<PingAck>> {
        let deadline = Instant::now() + timeout;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        let closed = transport.closed();
        tokio::pin!(closed);

        loop {
            if let Some(ack) = self.take_ack() {
                return Ok(Some(ack));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = &mut sleep => return Ok(self.disarm()),
                _ = &mut closed => {
                    self.disarm();
                    return Err(EngineError::Cancelled);
                }
            }
        }
    }
}

/// Result of a successful handshake
#[derive(Debug, Clone)]
pub struct EngineConnection {
    pub address: EngineAddress,
    pub ack: PingAck,
    pub spawned: bool,
}

/// Runs the connect-or-spawn handshake against one target
pub struct EngineLocator {
    target: EngineAddress,
    options: LocatorOptions,
    state: LocatorState,
    handshake: Arc<Handshake>,
}

impl EngineLocator {
    pub fn new(target: EngineAddress, options: LocatorOptions) -> Self {
        Self {
            target,
            options,
            state: LocatorState::Idle,
            handshake: Arc::new(Handshake::default()),
        }
    }

    pub fn state(&self) -> &LocatorState {
        &self.state
    }

    /// Current target (rebound to the local host after a spawn)
    pub fn target(&self) -> &EngineAddress {
        &self.target
    }

    /// Install the `/pingack` handler on `transport`
    pub fn install(&self, transport: &OscTransport) {
        let handshake = Arc::clone(&self.handshake);
        transport.register_handler(
            PING_ACK_PATH,
            &[ArgKind::Str, ArgKind::Str, ArgKind::Int],
            move |args| {
                handshake.acknowledge(PingAck {
                    host_url: str_arg(args, 0).to_string(),
                    version: str_arg(args, 1).to_string(),
                    loop_count: int_arg(args, 2),
                });
            },
        );
    }

    /// Drive the state machine to `Connected` or `Failed`
    ///
    /// The transport must be started and have this locator installed.
    pub async fn locate(
        &mut self,
        transport: &OscTransport,
        launcher: &dyn EngineLauncher,
    ) -> Result<EngineConnection> {
        self.transition(LocatorState::AwaitingAck);
        if let Some(ack) = self.ping(transport).await? {
            return Ok(self.connected(ack, false));
        }

        if self.options.fail_on_not_found {
            self.transition(LocatorState::Failed);
            return Err(EngineError::NoEngine {
                target: self.target.clone(),
                spawn_attempted: false,
            });
        }

        self.transition(LocatorState::SpawningLocal);
        let port = self.target.port;
        info!("No engine at {}, launching a local engine on port {}", self.target, port);
        if let Err(e) = launcher.launch(port).await {
            warn!("Failed to launch local engine: {:#}", e);
            self.transition(LocatorState::Failed);
            return Err(EngineError::NoEngine {
                target: self.target.clone(),
                spawn_attempted: true,
            });
        }
        self.target = EngineAddress::local(port);

        self.transition(LocatorState::AwaitingAck2);
        if let Some(ack) = self.ping(transport).await? {
            return Ok(self.connected(ack, true));
        }

        self.transition(LocatorState::Failed);
        Err(EngineError::NoEngine {
            target: self.target.clone(),
            spawn_attempted: true,
        })
    }

    async fn ping(&mut self, transport: &OscTransport) -> Result<Option<PingAck>> {
        self.handshake.arm();

        let args = vec![
            OscType::String(transport.url().to_string()),
            OscType::String(PING_ACK_PATH.to_string()),
        ];
        if let Err(e) = transport.send(&self.target, PING_PATH, args).await {
            // Indistinguishable from a lost datagram: nobody will answer
            warn!("Ping to {} not sent: {}", self.target, e);
            self.handshake.disarm();
            return Ok(None);
        }

        match self.handshake.wait(self.options.timeout, transport).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                self.transition(LocatorState::Failed);
                Err(e)
            }
        }
    }

    fn connected(&mut self, ack: PingAck, spawned: bool) -> EngineConnection {
        info!(
            "✅ Connected to engine {} at {} ({} loops)",
            ack.version, self.target, ack.loop_count
        );
        self.transition(LocatorState::Connected(ack.clone()));
        EngineConnection {
            address: self.target.clone(),
            ack,
            spawned,
        }
    }

    fn transition(&mut self, next: LocatorState) {
        debug!("Locator {:?} → {:?}", self.state, next);
        self.state = next;
    }
}
