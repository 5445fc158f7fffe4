//! OSC/UDP message transport
//!
//! Owns the local endpoint the engine replies to, sends fire-and-forget OSC
//! messages, and runs the receive loop on its own tokio task. Inbound
//! messages are dispatched to handlers registered by address path. Handlers
//! run synchronously on the receive task, one at a time, in arrival order;
//! anything that needs another execution context must hop there itself.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{EngineError, Result};
use crate::locator::EngineAddress;

/// Largest datagram the receive loop accepts
const RECV_BUFFER_SIZE: usize = rosc::decoder::MTU;

/// Expected type of one inbound OSC argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Int,
}

impl ArgKind {
    fn matches(self, arg: &OscType) -> bool {
        matches!(
            (self, arg),
            (ArgKind::Str, OscType::String(_)) | (ArgKind::Int, OscType::Int(_))
        )
    }
}

/// Argument signature a handler accepts
pub type ArgSpec = &'static [ArgKind];

/// Callback invoked with the arguments of a matching inbound message
pub type Handler = Arc<dyn Fn(&[OscType]) + Send + Sync>;

type HandlerTable = HashMap<String, (ArgSpec, Handler)>;

/// UDP endpoint speaking OSC to the engine
pub struct OscTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    url: String,
    handlers: Arc<RwLock<HandlerTable>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OscTransport {
    /// Bind a local endpoint and advertise the bound host
    ///
    /// # Arguments
    /// * `host` - Interface to bind and advertise in the reply URL
    /// * `preferred_port` - Port to bind, or `None` for any free port
    pub async fn bind(host: &str, preferred_port: Option<u16>) -> Result<Self> {
        Self::bind_advertised(host, preferred_port, host).await
    }

    /// Bind a local endpoint, advertising a different host in the reply URL
    ///
    /// Used when binding a wildcard address such as `0.0.0.0`, which the
    /// engine cannot send to.
    pub async fn bind_advertised(
        host: &str,
        preferred_port: Option<u16>,
        advertised_host: &str,
    ) -> Result<Self> {
        let bind_err = |source| EngineError::Bind {
            host: host.to_string(),
            port: preferred_port,
            source,
        };

        let socket = UdpSocket::bind((host, preferred_port.unwrap_or(0)))
            .await
            .map_err(bind_err)?;
        let local_addr = socket.local_addr().map_err(bind_err)?;
        let url = reply_url(advertised_host, local_addr.port());

        debug!("OSC endpoint bound on {}, replies to {}", local_addr, url);

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            url,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// OSC URL the engine should send replies to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Route inbound messages on `path` to `handler`
    ///
    /// Registering a path twice replaces the earlier handler.
    pub fn register_handler<F>(&self, path: &str, arg_spec: ArgSpec, handler: F)
    where
        F: Fn(&[OscType]) + Send + Sync + 'static,
    {
        let previous = self
            .handlers
            .write()
            .insert(path.to_string(), (arg_spec, Arc::new(handler)));
        if previous.is_some() {
            debug!("Replaced OSC handler for {}", path);
        }
    }

    /// Send one OSC message, without any delivery acknowledgment
    pub async fn send(
        &self,
        destination: &EngineAddress,
        path: &str,
        args: Vec<OscType>,
    ) -> Result<()> {
        let target = destination.resolve().await?;

        let packet = OscPacket::Message(OscMessage {
            addr: path.to_string(),
            args,
        });
        let bytes = rosc::encoder::encode(&packet).map_err(|e| EngineError::Send {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| EngineError::Send {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        trace!("📤 OSC {} -> {}", path, target);
        Ok(())
    }

    /// Spawn the receive loop; a second call while running is a no-op
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("OSC receive loop already running");
            return;
        }
        if *self.shutdown_tx.borrow() {
            warn!("OSC transport already stopped, not restarting");
            return;
        }

        let socket = Arc::clone(&self.socket);
        let handlers = Arc::clone(&self.handlers);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = wait_stopped(&mut shutdown_rx) => {
                        debug!("OSC receive loop shutting down");
                        break;
                    }
                    res = socket.recv_from(&mut buf) => match res {
                        Ok((len, from)) => dispatch_datagram(&handlers, &buf[..len], from),
                        Err(e) => warn!("OSC receive failed: {}", e),
                    },
                }
            }
        }));
    }

    /// Stop the receive loop and wait for it to exit
    ///
    /// No handler is invoked after this returns.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("OSC receive loop ended abnormally: {}", e);
            }
        }
    }

    /// Resolves once [`OscTransport::stop`] has been requested
    pub async fn closed(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        wait_stopped(&mut rx).await;
    }
}

/// Resolves when the flag flips to true or the sender goes away
async fn wait_stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

fn reply_url(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("osc.udp://[{}]:{}/", ip, port),
        _ => format!("osc.udp://{}:{}/", host, port),
    }
}

fn dispatch_datagram(handlers: &RwLock<HandlerTable>, datagram: &[u8], from: SocketAddr) {
    match rosc::decoder::decode_udp(datagram) {
        Ok((_, packet)) => dispatch_packet(handlers, packet, from),
        Err(e) => warn!("Dropping undecodable OSC datagram from {}: {:?}", from, e),
    }
}

fn dispatch_packet(handlers: &RwLock<HandlerTable>, packet: OscPacket, from: SocketAddr) {
    match packet {
        OscPacket::Message(msg) => dispatch_message(handlers, msg, from),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                dispatch_packet(handlers, inner, from);
            }
        }
    }
}

fn dispatch_message(handlers: &RwLock<HandlerTable>, msg: OscMessage, from: SocketAddr) {
    debug!("📥 OSC {} {:?} from {}", msg.addr, msg.args, from);

    // Clone out of the table so the handler may register other handlers.
    let entry = handlers.read().get(&msg.addr).cloned();
    let Some((spec, handler)) = entry else {
        debug!("No handler for OSC path {}", msg.addr);
        return;
    };

    let signature_ok =
        spec.len() == msg.args.len() && spec.iter().zip(&msg.args).all(|(k, a)| k.matches(a));
    if !signature_ok {
        warn!(
            "Dropping {}: arguments {:?} do not match {:?}",
            msg.addr, msg.args, spec
        );
        return;
    }

    handler(&msg.args);
}

/// Borrow the string at `index`, assuming the handler's argument signature was checked
pub fn str_arg(args: &[OscType], index: usize) -> &str {
    match args.get(index) {
        Some(OscType::String(s)) => s,
        _ => "",
    }
}

/// Integer at `index`, assuming the handler's argument signature was checked
pub fn int_arg(args: &[OscType], index: usize) -> i32 {
    match args.get(index) {
        Some(OscType::Int(i)) => *i,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn send_raw(to: SocketAddr, path: &str, args: Vec<OscType>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = rosc::encoder::encode(&OscPacket::Message(OscMessage {
            addr: path.to_string(),
            args,
        }))
        .unwrap();
        socket.send_to(&bytes, to).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_any_port() {
        let transport = OscTransport::bind("127.0.0.1", None).await.unwrap();
        assert_ne!(transport.local_addr().port(), 0);
        assert_eq!(
            transport.url(),
            format!("osc.udp://127.0.0.1:{}/", transport.local_addr().port())
        );
    }

    #[tokio::test]
    async fn test_bind_wildcard_advertises_reachable_host() {
        let transport = OscTransport::bind_advertised("0.0.0.0", None, "127.0.0.1")
            .await
            .unwrap();
        let port = transport.local_addr().port();
        assert!(transport.local_addr().ip().is_unspecified());
        assert_eq!(transport.url(), format!("osc.udp://127.0.0.1:{}/", port));

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        transport.register_handler("/x", &[], move |_| {
            let _ = tx.send(());
        });
        transport.start();
        send_raw(SocketAddr::from(([127, 0, 0, 1], port)), "/x", vec![]).await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        transport.stop().await;
    }

    #[test]
    fn test_reply_url_brackets_ipv6() {
        assert_eq!(reply_url("::1", 9000), "osc.udp://[::1]:9000/");
        assert_eq!(reply_url("studio.local", 9000), "osc.udp://studio.local:9000/");
    }

    #[tokio::test]
    async fn test_bind_taken_port_fails() {
        let first = OscTransport::bind("127.0.0.1", None).await.unwrap();
        let port = first.local_addr().port();
        let second = OscTransport::bind("127.0.0.1", Some(port)).await;
        assert!(matches!(second, Err(EngineError::Bind { port: Some(p), .. }) if p == port));
    }

    #[tokio::test]
    async fn test_dispatch_by_path_and_signature() {
        let transport = OscTransport::bind("127.0.0.1", None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.register_handler("/loop/update", &[ArgKind::Str, ArgKind::Str], move |args| {
            let _ = tx.send(format!("{} {}", str_arg(args, 0), str_arg(args, 1)));
        });
        transport.start();

        let addr = transport.local_addr();
        // Wrong signature is dropped, unknown path is ignored
        send_raw(addr, "/loop/update", vec![OscType::Int(1)]).await;
        send_raw(addr, "/nobody", vec![]).await;
        send_raw(
            addr,
            "/loop/update",
            vec![OscType::String("add".into()), OscType::String("L1".into())],
        )
        .await;

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "add L1");

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_reregister_replaces_handler() {
        let transport = OscTransport::bind("127.0.0.1", None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx2 = tx.clone();

        transport.register_handler("/x", &[], move |_| {
            let _ = tx.send("first");
        });
        transport.register_handler("/x", &[], move |_| {
            let _ = tx2.send("second");
        });
        transport.start();

        send_raw(transport.local_addr(), "/x", vec![]).await;
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "second");

        transport.stop().await;
    }

    #[tokio::test]
    async fn test_no_handler_after_stop() {
        let transport = OscTransport::bind("127.0.0.1", None).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        transport.register_handler("/x", &[], move |_| {
            let _ = tx.send(());
        });
        transport.start();
        transport.stop().await;

        send_raw(transport.local_addr(), "/x", vec![]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // closed() resolves immediately once stopped
        tokio::time::timeout(Duration::from_millis(100), transport.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let transport = OscTransport::bind("127.0.0.1", None).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = EngineAddress::new("127.0.0.1", peer.local_addr().unwrap().port());

        transport
            .send(&dest, "/loop_add", vec![OscType::String("L1".into())])
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buf[..len]).unwrap();
        match packet {
            OscPacket::Message(msg) => {
                assert_eq!(msg.addr, "/loop_add");
                assert_eq!(msg.args, vec![OscType::String("L1".into())]);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_to_unresolvable_host_fails_locally() {
        let transport = OscTransport::bind("127.0.0.1", None).await.unwrap();
        let dest = EngineAddress::new("", 9);
        let res = transport.send(&dest, "/quit", vec![]).await;
        assert!(matches!(res, Err(EngineError::InvalidAddress(_))));
    }
}
