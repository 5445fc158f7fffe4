//! Engine session façade
//!
//! Ties the transport, the locator, the mapping codec and the subscription
//! bus together. A session is created with [`EngineSession::connect`], asks
//! for the engine's state with [`EngineSession::initialize_subscribers`],
//! issues commands, and ends with [`EngineSession::cleanup`].
//!
//! Inbound `/loop/update` and `/mapping/update` messages are republished on
//! the [`Topic::Loops`] and [`Topic::Mappings`] topics. Subscribers are
//! called on the transport's receive task.

mod mirror;

pub use mirror::EngineMirror;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rosc::OscType;
use tracing::{debug, info, warn};

use crate::bus::{Subscriber, SubscriptionBus};
use crate::config::AppConfig;
use crate::error::{EngineError, Result};
use crate::launcher::EngineLauncher;
use crate::locator::{EngineAddress, EngineLocator, LocatorOptions, PingAck, LOCAL_ENGINE_HOST};
use crate::mapping::{self, MidiMappingInfo};
use crate::transport::{str_arg, ArgKind, OscTransport};

pub const LOOP_LIST_PATH: &str = "/loop_list";
pub const MAPPING_LIST_PATH: &str = "/midi_binding_list";
pub const REGISTER_PATH: &str = "/register_auto_update";
pub const UNREGISTER_PATH: &str = "/unregister_auto_update";
pub const LOOP_UPDATE_PATH: &str = "/loop/update";
pub const MAPPING_UPDATE_PATH: &str = "/mapping/update";
pub const LOOP_ADD_PATH: &str = "/loop_add";
pub const LOOP_DEL_PATH: &str = "/loop_del";
pub const MAPPING_ADD_PATH: &str = "/add_midi_binding";
pub const MAPPING_DEL_PATH: &str = "/remove_midi_binding";
pub const QUIT_PATH: &str = "/quit";

/// Subscription keys published by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Loops,
    Mappings,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Loops, Topic::Mappings];

    /// Name the engine uses for auto-update registration
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Loops => "loops",
            Topic::Mappings => "mappings",
        }
    }

    /// Path the engine sends this topic's updates to
    pub fn update_path(self) -> &'static str {
        match self {
            Topic::Loops => LOOP_UPDATE_PATH,
            Topic::Mappings => MAPPING_UPDATE_PATH,
        }
    }

    fn list_path(self) -> &'static str {
        match self {
            Topic::Loops => LOOP_LIST_PATH,
            Topic::Mappings => MAPPING_LIST_PATH,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an update adds or removes an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Remove,
}

impl ChangeKind {
    pub fn code(self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Remove => "remove",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "add" => Some(ChangeKind::Add),
            "remove" => Some(ChangeKind::Remove),
            _ => None,
        }
    }
}

/// Payload published on the session topics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineUpdate {
    Loop { change: ChangeKind, name: String },
    Mapping { change: ChangeKind, mapping: MidiMappingInfo },
}

impl EngineUpdate {
    pub fn topic(&self) -> Topic {
        match self {
            EngineUpdate::Loop { .. } => Topic::Loops,
            EngineUpdate::Mapping { .. } => Topic::Mappings,
        }
    }

    pub fn change(&self) -> ChangeKind {
        match self {
            EngineUpdate::Loop { change, .. } | EngineUpdate::Mapping { change, .. } => *change,
        }
    }
}

pub type EngineBus = SubscriptionBus<Topic, EngineUpdate>;

/// What [`EngineSession::cleanup`] does to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Send `/quit`
    QuitEngine,
    /// Leave the engine running, cancel auto-updates
    Unregister,
}

/// Everything needed to open a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineAddress,
    /// Interface the reply endpoint binds
    pub listen_host: String,
    pub listen_port: Option<u16>,
    /// Host the engine is told to reply to; derived from the route to the engine when unset
    pub advertise_host: Option<String>,
    pub locator: LocatorOptions,
    pub shutdown: ShutdownPolicy,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            engine: EngineAddress::new(&config.engine.host, config.engine.port),
            listen_host: config.listen.host.clone(),
            listen_port: config.listen.port,
            advertise_host: config.listen.advertise_host.clone(),
            locator: LocatorOptions {
                timeout: Duration::from_millis(config.engine.handshake_timeout_ms),
                fail_on_not_found: config.engine.fail_on_not_found,
            },
            shutdown: if config.engine.quit_on_exit {
                ShutdownPolicy::QuitEngine
            } else {
                ShutdownPolicy::Unregister
            },
        }
    }
}

/// Per-item result of a batch command
///
/// Batches are not atomic: every item is sent even if an earlier one failed,
/// nothing is rolled back or retried, and failures are reported here.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub sent: Vec<T>,
    pub failed: Vec<(T, EngineError)>,
}

impl<T> BatchOutcome<T> {
    fn new() -> Self {
        Self {
            sent: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A live connection to one engine
pub struct EngineSession {
    transport: OscTransport,
    engine: EngineAddress,
    ack: PingAck,
    spawned: bool,
    bus: Arc<EngineBus>,
    shutdown: ShutdownPolicy,
}

impl EngineSession {
    /// Bind the local endpoint and run the handshake
    ///
    /// Fails with [`EngineError::Bind`] when the endpoint cannot be bound and
    /// [`EngineError::NoEngine`] when no engine answers.
    pub async fn connect(config: SessionConfig, launcher: &dyn EngineLauncher) -> Result<Self> {
        let advertised = advertised_host(&config).await;
        let transport =
            OscTransport::bind_advertised(&config.listen_host, config.listen_port, &advertised)
                .await?;
        let bus = Arc::new(EngineBus::with_topics(Topic::ALL));
        install_update_handlers(&transport, &bus);

        let mut locator = EngineLocator::new(config.engine.clone(), config.locator.clone());
        locator.install(&transport);
        transport.start();

        let connection = match locator.locate(&transport, launcher).await {
            Ok(connection) => connection,
            Err(e) => {
                transport.stop().await;
                return Err(e);
            }
        };

        info!(
            "Session open with {} (listening on {})",
            connection.address,
            transport.url()
        );

        Ok(Self {
            transport,
            engine: connection.address,
            ack: connection.ack,
            spawned: connection.spawned,
            bus,
            shutdown: config.shutdown,
        })
    }

    /// Engine address in use (the local host if an engine was spawned)
    pub fn engine(&self) -> &EngineAddress {
        &self.engine
    }

    /// Handshake reply, for display and version checks
    pub fn ack(&self) -> &PingAck {
        &self.ack
    }

    /// True if the engine was launched by this session
    pub fn spawned(&self) -> bool {
        self.spawned
    }

    pub fn reply_url(&self) -> &str {
        self.transport.url()
    }

    pub fn bus(&self) -> Arc<EngineBus> {
        Arc::clone(&self.bus)
    }

    /// Request full snapshots and register for future changes on both topics
    ///
    /// The four requests are fire-and-forget; the resulting updates arrive on
    /// the bus asynchronously, possibly after this returns.
    pub async fn initialize_subscribers(&self) -> Result<()> {
        for topic in Topic::ALL {
            self.send(topic.list_path(), self.reply_args(topic)).await?;
        }
        for topic in Topic::ALL {
            self.send(REGISTER_PATH, self.topic_args(topic)).await?;
        }
        debug!("Requested engine state and auto-updates");
        Ok(())
    }

    pub fn subscribe(&self, topic: Topic, subscriber: Subscriber<EngineUpdate>) {
        self.bus.subscribe(topic, subscriber);
    }

    pub fn unsubscribe(&self, topic: Topic, subscriber: &Subscriber<EngineUpdate>) {
        self.bus.unsubscribe(topic, subscriber);
    }

    pub async fn new_loop(&self, name: &str) -> Result<()> {
        self.send(LOOP_ADD_PATH, vec![OscType::String(name.to_string())])
            .await
    }

    /// Delete loops, one message per name
    pub async fn remove_loops<S: AsRef<str>>(&self, names: &[S]) -> BatchOutcome<String> {
        let mut outcome = BatchOutcome::new();
        for name in names {
            let name = name.as_ref().to_string();
            match self
                .send(LOOP_DEL_PATH, vec![OscType::String(name.clone())])
                .await
            {
                Ok(()) => outcome.sent.push(name),
                Err(e) => {
                    warn!("Failed to request removal of loop '{}': {}", name, e);
                    outcome.failed.push((name, e));
                }
            }
        }
        outcome
    }

    pub async fn new_mapping(&self, info: &MidiMappingInfo) -> Result<()> {
        self.send(MAPPING_ADD_PATH, vec![OscType::String(mapping::encode(info))])
            .await
    }

    /// Delete mappings, one message per mapping
    pub async fn remove_mappings(&self, infos: &[MidiMappingInfo]) -> BatchOutcome<MidiMappingInfo> {
        let mut outcome = BatchOutcome::new();
        for info in infos {
            match self
                .send(MAPPING_DEL_PATH, vec![OscType::String(mapping::encode(info))])
                .await
            {
                Ok(()) => outcome.sent.push(info.clone()),
                Err(e) => {
                    warn!("Failed to request removal of mapping {}: {}", info, e);
                    outcome.failed.push((info.clone(), e));
                }
            }
        }
        outcome
    }

    /// Quit the engine or unregister from it, then stop the transport
    pub async fn cleanup(self) -> Result<()> {
        let result = match self.shutdown {
            ShutdownPolicy::QuitEngine => {
                info!("Asking engine at {} to quit", self.engine);
                self.send(QUIT_PATH, vec![]).await
            }
            ShutdownPolicy::Unregister => {
                info!("Unregistering auto-updates from {}", self.engine);
                let mut result = Ok(());
                for topic in Topic::ALL {
                    let sent = self.send(UNREGISTER_PATH, self.topic_args(topic)).await;
                    if let Err(e) = sent {
                        warn!("Failed to unregister {}: {}", topic, e);
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
                result
            }
        };

        self.transport.stop().await;
        result
    }

    async fn send(&self, path: &str, args: Vec<OscType>) -> Result<()> {
        self.transport.send(&self.engine, path, args).await
    }

    fn reply_args(&self, topic: Topic) -> Vec<OscType> {
        vec![
            OscType::String(self.transport.url().to_string()),
            OscType::String(topic.update_path().to_string()),
        ]
    }

    fn topic_args(&self, topic: Topic) -> Vec<OscType> {
        let mut args = vec![OscType::String(topic.as_str().to_string())];
        args.extend(self.reply_args(topic));
        args
    }
}

/// Host for the reply URL
///
/// An explicit setting wins, then a concrete bind address. A wildcard bind
/// advertises the local address routed toward the engine, or the loopback
/// host when the engine cannot be resolved (a spawned engine is local).
async fn advertised_host(config: &SessionConfig) -> String {
    if let Some(host) = &config.advertise_host {
        return host.clone();
    }
    let wildcard = config
        .listen_host
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_unspecified());
    if !wildcard {
        return config.listen_host.clone();
    }
    match config.engine.local_route().await {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            warn!("No route to {}, advertising {}: {}", config.engine, LOCAL_ENGINE_HOST, e);
            LOCAL_ENGINE_HOST.to_string()
        }
    }
}

/// Route inbound update messages onto the bus
fn install_update_handlers(transport: &OscTransport, bus: &Arc<EngineBus>) {
    let loops = Arc::clone(bus);
    transport.register_handler(LOOP_UPDATE_PATH, &[ArgKind::Str, ArgKind::Str], move |args| {
        let Some(change) = ChangeKind::from_code(str_arg(args, 0)) else {
            warn!("Dropping loop update with unknown change '{}'", str_arg(args, 0));
            return;
        };
        loops.publish(
            Topic::Loops,
            &EngineUpdate::Loop {
                change,
                name: str_arg(args, 1).to_string(),
            },
        );
    });

    let mappings = Arc::clone(bus);
    transport.register_handler(MAPPING_UPDATE_PATH, &[ArgKind::Str, ArgKind::Str], move |args| {
        let Some(change) = ChangeKind::from_code(str_arg(args, 0)) else {
            warn!("Dropping mapping update with unknown change '{}'", str_arg(args, 0));
            return;
        };
        match mapping::decode(str_arg(args, 1)) {
            Ok(mapping) => mappings.publish(Topic::Mappings, &EngineUpdate::Mapping { change, mapping }),
            Err(e) => warn!("Dropping mapping update '{}': {}", str_arg(args, 1), e),
        }
    });
}
