//! CoAP (RFC 7252) client over UDP.
//!
//! Message encoding is `coap-lite`'s; this module adds what the appliance
//! needs on top: confirmable requests with piggybacked or separate
//! responses, observe registrations and keep-alive pings. Nothing is
//! retransmitted; request deadlines are enforced by the caller.

use bytes::Bytes;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType};
use klimat_proto::{ContentFormat, Notification, Observation, ProtocolError, Result, Transport};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const MAX_DATAGRAM_SIZE: usize = 4096;

/// Notifications buffered per observer before new ones are dropped
const OBSERVER_CAPACITY: usize = 32;

const OBSERVE_REGISTER: u32 = 0;
const OBSERVE_DEREGISTER: u32 = 1;

/// Renders a code as `class.detail`, e.g. `4.04`
pub fn code_string(code: MessageClass) -> String {
    let code = u8::from(code);
    format!("{}.{:02}", code >> 5, code & 0x1f)
}

/// Big-endian uint with leading zero bytes removed
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

pub fn new_packet(message_type: MessageType, code: MessageClass, message_id: u16) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(message_type);
    packet.header.code = code;
    packet.header.message_id = message_id;
    packet
}

/// Adds one option per path segment
pub fn set_path(packet: &mut Packet, option: CoapOption, path: &str) {
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        packet.add_option(option, segment.as_bytes().to_vec());
    }
}

pub fn path(packet: &Packet, option: CoapOption) -> String {
    let segments: Vec<String> = packet
        .get_option(option)
        .map(|values| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect()
        })
        .unwrap_or_default();
    format!("/{}", segments.join("/"))
}

pub fn first_option(packet: &Packet, option: CoapOption) -> Option<&[u8]> {
    packet
        .get_option(option)
        .and_then(|values| values.front())
        .map(|v| v.as_slice())
}

fn is_success(packet: &Packet) -> bool {
    u8::from(packet.header.code) >> 5 == 2
}

fn is_confirmable(packet: &Packet) -> bool {
    packet.header.get_type() == MessageType::Confirmable
}

/// Empty ACK for a push, with the options the device's own app sends along
fn push_ack(message_id: u16, path: &str) -> Packet {
    let mut ack = new_packet(MessageType::Acknowledgement, MessageClass::Empty, message_id);
    ack.add_option(
        CoapOption::ContentFormat,
        encode_uint(u32::from(ContentFormat::TextPlain.number())),
    );
    set_path(&mut ack, CoapOption::LocationPath, path);
    ack
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    packet
        .to_bytes()
        .map_err(|e| ProtocolError::Format(format!("cannot encode coap message: {:?}", e)))
}

pub fn decode(datagram: &[u8]) -> Result<Packet> {
    Packet::from_bytes(datagram)
        .map_err(|e| ProtocolError::Format(format!("invalid coap message: {:?}", e)))
}

struct Observer {
    path: String,
    tx: mpsc::Sender<Notification>,
}

#[derive(Default)]
struct Routes {
    pending: HashMap<Vec<u8>, oneshot::Sender<Packet>>,
    observers: HashMap<Vec<u8>, Observer>,
}

type SharedRoutes = Arc<Mutex<Routes>>;

fn lock(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a pending request when its future is dropped, e.g. on timeout
struct PendingRequest<'a> {
    routes: &'a Mutex<Routes>,
    token: Vec<u8>,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        lock(self.routes).pending.remove(&self.token);
    }
}

/// CoAP client bound to a single device
pub struct CoapTransport {
    socket: Arc<UdpSocket>,
    routes: SharedRoutes,
    next_message_id: Arc<AtomicU16>,
    next_token: AtomicU32,
    shutdown: CancellationToken,
}

impl CoapTransport {
    /// Opens a UDP socket towards `addr` and starts the receive loop and,
    /// when `keepalive` is set, periodic pings.
    pub async fn dial(addr: &str, dial_timeout: Duration, keepalive: Option<Duration>) -> Result<Self> {
        let socket = timeout(dial_timeout, connect_socket(addr))
            .await
            .map_err(|_| ProtocolError::Timeout("dial"))??;
        let socket = Arc::new(socket);

        let transport = Self {
            socket: Arc::clone(&socket),
            routes: SharedRoutes::default(),
            next_message_id: Arc::new(AtomicU16::new(rand::random())),
            next_token: AtomicU32::new(rand::random()),
            shutdown: CancellationToken::new(),
        };

        tokio::spawn(receive_loop(
            socket,
            Arc::clone(&transport.routes),
            transport.shutdown.clone(),
        ));

        if let Some(interval) = keepalive.filter(|i| !i.is_zero()) {
            tokio::spawn(keepalive_loop(
                Arc::clone(&transport.socket),
                Arc::clone(&transport.next_message_id),
                interval,
                transport.shutdown.clone(),
            ));
        }

        debug!("CoAP transport dialed {}", addr);
        Ok(transport)
    }

    fn message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn token(&self) -> Vec<u8> {
        self.next_token.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec()
    }

    async fn exchange(&self, packet: Packet) -> Result<Packet> {
        let token = packet.get_token().to_vec();
        let (tx, rx) = oneshot::channel();
        lock(&self.routes).pending.insert(token.clone(), tx);
        let _pending = PendingRequest {
            routes: &self.routes,
            token,
        };

        send_packet(&self.socket, &packet).await?;

        let response = rx
            .await
            .map_err(|_| ProtocolError::Transport("connection closed".to_string()))?;

        if !is_success(&response) {
            return Err(ProtocolError::Transport(format!(
                "device answered {} to {}",
                code_string(response.header.code),
                path(&packet, CoapOption::UriPath)
            )));
        }
        Ok(response)
    }

    fn request_packet(&self, method: RequestType, uri: &str) -> Packet {
        let mut packet = new_packet(
            MessageType::Confirmable,
            MessageClass::Request(method),
            self.message_id(),
        );
        packet.set_token(self.token());
        set_path(&mut packet, CoapOption::UriPath, uri);
        packet
    }
}

impl Drop for CoapTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Transport for CoapTransport {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let packet = self.request_packet(RequestType::Get, path);
        Ok(Bytes::from(self.exchange(packet).await?.payload))
    }

    async fn post(&self, path: &str, format: ContentFormat, payload: Vec<u8>) -> Result<Bytes> {
        let mut packet = self.request_packet(RequestType::Post, path);
        packet.add_option(CoapOption::ContentFormat, encode_uint(u32::from(format.number())));
        packet.payload = payload;
        Ok(Bytes::from(self.exchange(packet).await?.payload))
    }

    async fn observe(&self, path: &str) -> Result<Observation> {
        let mut packet = self.request_packet(RequestType::Get, path);
        packet.add_option(CoapOption::Observe, encode_uint(OBSERVE_REGISTER));
        let token = packet.get_token().to_vec();

        // The registration response carries the current state and is
        // forwarded to the observer by the receive loop
        let (tx, rx) = mpsc::channel(OBSERVER_CAPACITY);
        lock(&self.routes).observers.insert(
            token.clone(),
            Observer {
                path: path.to_string(),
                tx,
            },
        );

        if let Err(e) = self.exchange(packet).await {
            lock(&self.routes).observers.remove(&token);
            return Err(e);
        }

        let cancel = self.shutdown.child_token();
        tokio::spawn(deregister_on_cancel(
            Arc::clone(&self.socket),
            Arc::clone(&self.routes),
            Arc::clone(&self.next_message_id),
            token,
            path.to_string(),
            cancel.clone(),
        ));

        Ok(Observation {
            notifications: rx,
            cancel,
        })
    }

    async fn acknowledge(&self, notification: &Notification) -> Result<()> {
        trace!("Acknowledging push {}", notification.message_id);
        send_packet(
            &self.socket,
            &push_ack(notification.message_id, &notification.path),
        )
        .await
    }
}

async fn connect_socket(addr: &str) -> Result<UdpSocket> {
    let remote = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ProtocolError::Transport(format!("could not resolve {}", addr)))?;

    let local = if remote.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(socket)
}

async fn send_packet(socket: &UdpSocket, packet: &Packet) -> Result<()> {
    let buf = encode(packet)?;
    socket.send(&buf).await?;
    Ok(())
}

async fn receive_loop(socket: Arc<UdpSocket>, routes: SharedRoutes, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let len = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(len) => len,
                Err(e) => {
                    warn!("CoAP receive error: {}", e);
                    continue;
                }
            },
        };

        match decode(&buf[..len]) {
            Ok(packet) => dispatch(&socket, &routes, packet).await,
            Err(e) => warn!("Dropping undecodable datagram: {}", e),
        }
    }

    // Dropping the senders ends every pending request and observation
    let mut routes = lock(&routes);
    routes.pending.clear();
    routes.observers.clear();
    debug!("CoAP receive loop stopped");
}

async fn dispatch(socket: &UdpSocket, routes: &Mutex<Routes>, packet: Packet) {
    let message_id = packet.header.message_id;

    if packet.header.code == MessageClass::Empty {
        // Empty ACK ahead of a separate response, or the reply to a ping
        trace!("Empty {:?} for message {}", packet.header.get_type(), message_id);
        return;
    }

    enum Route {
        Response(oneshot::Sender<Packet>, Option<(mpsc::Sender<Notification>, String)>),
        Notify(mpsc::Sender<Notification>, String),
        Unknown,
    }

    let token = packet.get_token().to_vec();
    let route = {
        let mut routes = lock(routes);
        let observer = routes
            .observers
            .get(&token)
            .map(|observer| (observer.tx.clone(), observer.path.clone()));

        match (routes.pending.remove(&token), observer) {
            (Some(tx), observer) => Route::Response(tx, observer),
            (None, Some((tx, path))) => Route::Notify(tx, path),
            (None, None) => Route::Unknown,
        }
    };

    match route {
        Route::Response(tx, observer) => {
            if is_confirmable(&packet) {
                // Separate response, acknowledged at the transport level
                let ack = new_packet(MessageType::Acknowledgement, MessageClass::Empty, message_id);
                if let Err(e) = send_packet(socket, &ack).await {
                    warn!("Failed to acknowledge response {}: {}", message_id, e);
                }
            }

            if let Some((observer_tx, path)) = observer {
                if is_success(&packet) && !packet.payload.is_empty() {
                    let notification = Notification {
                        payload: Bytes::from(packet.payload.clone()),
                        message_id,
                        confirmable: false,
                        path,
                    };
                    notify(socket, routes, &token, &observer_tx, notification).await;
                }
            }
            let _ = tx.send(packet);
        }
        Route::Notify(tx, path) => {
            trace!(
                "Push {} on {} (observe seq {:?})",
                message_id,
                path,
                first_option(&packet, CoapOption::Observe).map(decode_uint)
            );
            let notification = Notification {
                confirmable: is_confirmable(&packet),
                payload: Bytes::from(packet.payload),
                message_id,
                path,
            };
            notify(socket, routes, &token, &tx, notification).await;
        }
        Route::Unknown => {
            if is_confirmable(&packet) {
                debug!("Resetting unexpected message {}", message_id);
                let reset = new_packet(MessageType::Reset, MessageClass::Empty, message_id);
                if let Err(e) = send_packet(socket, &reset).await {
                    warn!("Failed to reset message {}: {}", message_id, e);
                }
            }
        }
    }
}

/// Queues a push for its observer. A push that doesn't fit is dropped, but
/// still acknowledged so the device keeps the observation alive.
async fn notify(
    socket: &UdpSocket,
    routes: &Mutex<Routes>,
    token: &[u8],
    tx: &mpsc::Sender<Notification>,
    notification: Notification,
) {
    match tx.try_send(notification) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("Observer lagging, dropping push {}", dropped.message_id);
            if dropped.confirmable {
                let ack = push_ack(dropped.message_id, &dropped.path);
                if let Err(e) = send_packet(socket, &ack).await {
                    warn!("Failed to acknowledge push {}: {}", dropped.message_id, e);
                }
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            lock(routes).observers.remove(token);
        }
    }
}

async fn deregister_on_cancel(
    socket: Arc<UdpSocket>,
    routes: SharedRoutes,
    next_message_id: Arc<AtomicU16>,
    token: Vec<u8>,
    path: String,
    cancel: CancellationToken,
) {
    cancel.cancelled().await;

    if lock(&routes).observers.remove(&token).is_none() {
        return;
    }

    let message_id = next_message_id.fetch_add(1, Ordering::Relaxed);
    let mut packet = new_packet(
        MessageType::NonConfirmable,
        MessageClass::Request(RequestType::Get),
        message_id,
    );
    packet.set_token(token);
    set_path(&mut packet, CoapOption::UriPath, &path);
    packet.add_option(CoapOption::Observe, encode_uint(OBSERVE_DEREGISTER));

    match send_packet(&socket, &packet).await {
        Ok(()) => debug!("Deregistered observation of {}", path),
        Err(e) => warn!("Failed to deregister observation of {}: {}", path, e),
    }
}

async fn keepalive_loop(
    socket: Arc<UdpSocket>,
    next_message_id: Arc<AtomicU16>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let message_id = next_message_id.fetch_add(1, Ordering::Relaxed);
        let ping = new_packet(MessageType::Confirmable, MessageClass::Empty, message_id);
        trace!("Ping {}", message_id);
        if let Err(e) = send_packet(&socket, &ping).await {
            warn!("Keep-alive ping failed: {}", e);
        }
    }
}
