use crate::framing::{decode_message, encode_message};
use crate::state::{ControlAck, Desired, Envelope, Info, ReportedState, ReportedStatus};
use crate::transport::{
    ContentFormat, Observation, Transport, CONTROL_PATH, INFO_PATH, STATUS_PATH, SYNC_PATH,
};
use crate::{ProtocolError, Result, Session, SessionId};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default deadline for every request sent to the device
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded status updates buffered per subscription. Past this the oldest
/// update is dropped so pushes keep being acknowledged.
pub const STATUS_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub request_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Client for a single appliance.
///
/// The session counter lives behind a lock: building a command frame,
/// sending it and advancing the counter happen as one step, so concurrent
/// `set` calls never reuse a session id.
pub struct Device<T: Transport> {
    transport: Arc<T>,
    session: Mutex<Session>,
    request_timeout: Duration,
}

impl<T: Transport> Device<T> {
    /// Wraps a transport without talking to the device yet
    pub fn new(transport: T, options: DeviceOptions) -> Self {
        Self::with_rng(transport, options, &mut StdRng::from_entropy())
    }

    /// Like [`Device::new`], drawing the initial session id from `rng`
    pub fn with_rng<R: RngCore + ?Sized>(transport: T, options: DeviceOptions, rng: &mut R) -> Self {
        Self {
            transport: Arc::new(transport),
            session: Mutex::new(Session::unbound(rng)),
            request_timeout: options.request_timeout,
        }
    }

    /// Wraps the transport and performs the sync handshake
    pub async fn connect(transport: T, options: DeviceOptions) -> Result<Self> {
        let device = Self::new(transport, options);
        device.sync().await?;
        Ok(device)
    }

    /// Posts our session id to the sync endpoint and adopts the device's
    /// counter. Can be called again to start over with a fresh session.
    pub async fn sync(&self) -> Result<SessionId> {
        let mut session = self.session.lock().await;
        let offered = session.id();
        debug!("Sync handshake offering session {}", offered);

        let response = self
            .request(
                "sync",
                self.transport
                    .post(SYNC_PATH, ContentFormat::TextPlain, offered.hex().into_bytes()),
            )
            .await?;

        let counter = SessionId::from_hex(&response)?;
        session.bind(counter);

        info!("Synced with device counter {}, next session {}", counter, session.id());
        Ok(session.id())
    }

    pub async fn info(&self) -> Result<Info> {
        let payload = self.request("info", self.transport.get(INFO_PATH)).await?;
        let info: Info = serde_json::from_slice(&payload)?;
        debug!("Device info: {:?}", info);
        Ok(info)
    }

    /// Session id the next command will use, once synced
    pub async fn session_id(&self) -> Option<SessionId> {
        let session = self.session.lock().await;
        session.is_active().then(|| session.id())
    }

    /// Sends a desired state patch.
    ///
    /// The session advances after every attempt, whether or not it succeeds.
    /// The device answers `success` even for commands it ignores, so an `Ok`
    /// only means the command was accepted on the wire.
    pub async fn set(&self, desired: Desired) -> Result<()> {
        if desired.is_empty() {
            return Err(ProtocolError::Command("nothing to set".to_string()));
        }
        let payload = serde_json::to_vec(&Envelope::desired(desired))?;

        let result = {
            let mut session = self.session.lock().await;
            if !session.is_active() {
                return Err(ProtocolError::NotSynced("set"));
            }

            let id = session.id();
            debug!("Sending command under session {}: {}", id, String::from_utf8_lossy(&payload));

            let result = match encode_message(id, &payload) {
                Ok(frame) => {
                    self.request(
                        "control",
                        self.transport
                            .post(CONTROL_PATH, ContentFormat::ApplicationJson, frame),
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            session.advance();
            result
        };

        let response = result?;
        let ack: ControlAck = serde_json::from_slice(&response)?;

        if !ack.is_success() {
            warn!("Device rejected command: {}", String::from_utf8_lossy(&response));
            return Err(ProtocolError::Command(format!(
                "device answered status {:?}",
                ack.status
            )));
        }

        debug!("Command acknowledged");
        Ok(())
    }

    /// Subscribes to status pushes.
    ///
    /// Each push is acknowledged (when the device asks for it) before it is
    /// decoded. Frames that fail to decode are handed to the caller as errors
    /// and the subscription keeps running.
    pub async fn observe_status(&self) -> Result<Subscription> {
        if !self.session.lock().await.is_active() {
            return Err(ProtocolError::NotSynced("observe_status"));
        }

        let observation = self
            .request("observe", self.transport.observe(STATUS_PATH))
            .await?;
        let cancel = observation.cancel.clone();
        let queue = Arc::new(StatusQueue::default());

        tokio::spawn(pump_status(
            Arc::clone(&self.transport),
            observation,
            Arc::clone(&queue),
        ));
        info!("Observing {}", STATUS_PATH);

        Ok(Subscription { queue, cancel })
    }

    /// The underlying transport, for anything this client doesn't cover
    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn request<F, O>(&self, what: &'static str, request: F) -> Result<O>
    where
        F: Future<Output = Result<O>>,
    {
        timeout(self.request_timeout, request)
            .await
            .map_err(|_| ProtocolError::Timeout(what))?
    }
}

/// Decodes a status push: frame first, then the JSON inside it
pub fn decode_status(frame: &[u8]) -> Result<ReportedStatus> {
    let plaintext = decode_message(frame)?;
    let envelope: Envelope<ReportedState> = serde_json::from_slice(&plaintext)?;
    Ok(envelope.state.reported)
}

/// Updates decoded by the pump and not yet taken by the subscriber
#[derive(Default)]
struct StatusQueue {
    updates: StdMutex<VecDeque<Result<ReportedStatus>>>,
    ready: Notify,
}

impl StatusQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Result<ReportedStatus>>> {
        self.updates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, update: Result<ReportedStatus>) {
        let mut updates = self.lock();
        if updates.len() >= STATUS_QUEUE_CAPACITY {
            updates.pop_front();
            warn!("Status subscriber lagging, dropped the oldest update");
        }
        updates.push_back(update);
        drop(updates);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<Result<ReportedStatus>> {
        self.lock().pop_front()
    }
}

async fn pump_status<T: Transport>(
    transport: Arc<T>,
    mut observation: Observation,
    queue: Arc<StatusQueue>,
) {
    let cancel = observation.cancel.clone();

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            received = observation.notifications.recv() => match received {
                Some(notification) => notification,
                None => {
                    debug!("Transport closed the status observation");
                    break;
                }
            },
        };

        if notification.confirmable {
            if let Err(e) = transport.acknowledge(&notification).await {
                warn!("Failed to acknowledge push {}: {}", notification.message_id, e);
            }
        }

        let update = decode_status(&notification.payload);
        if let Err(e) = &update {
            warn!(
                "Failed to decode status push: {}, payload: {}",
                e,
                String::from_utf8_lossy(&notification.payload)
            );
        }

        queue.push(update);
    }

    cancel.cancel();
    debug!("Status observation stopped");
}

/// Stream of decoded status updates. Dropping it cancels the observation.
///
/// Holds at most [`STATUS_QUEUE_CAPACITY`] undelivered updates; a subscriber
/// that falls behind loses the oldest ones.
pub struct Subscription {
    queue: Arc<StatusQueue>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Next update, or `None` once the observation has stopped and every
    /// buffered update was taken
    pub async fn next(&mut self) -> Option<Result<ReportedStatus>> {
        loop {
            if let Some(update) = self.queue.pop() {
                return Some(update);
            }
            if self.cancel.is_cancelled() {
                return None;
            }

            tokio::select! {
                _ = self.queue.ready.notified() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Stops the observation. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle that cancels this subscription from another task
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FanSpeed, Power};
    use crate::transport::Notification;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    /// In-memory device that records everything sent to it
    #[derive(Default)]
    struct MockTransport {
        info: Vec<u8>,
        sync_reply: Vec<u8>,
        control_replies: StdMutex<VecDeque<Result<Bytes>>>,
        hang_control: bool,
        sync_posts: StdMutex<Vec<Vec<u8>>>,
        control_posts: StdMutex<Vec<Vec<u8>>>,
        acks: StdMutex<Vec<u16>>,
        observer: StdMutex<Option<(mpsc::Sender<Notification>, CancellationToken)>>,
    }

    impl MockTransport {
        fn new(sync_reply: &str) -> Self {
            Self {
                sync_reply: sync_reply.as_bytes().to_vec(),
                ..Default::default()
            }
        }

        fn reply_control(&self, reply: Result<Bytes>) {
            self.control_replies.lock().unwrap().push_back(reply);
        }

        fn observer(&self) -> (mpsc::Sender<Notification>, CancellationToken) {
            self.observer.lock().unwrap().clone().expect("not observing")
        }
    }

    impl Transport for MockTransport {
        async fn get(&self, path: &str) -> Result<Bytes> {
            assert_eq!(path, INFO_PATH);
            Ok(Bytes::from(self.info.clone()))
        }

        async fn post(&self, path: &str, format: ContentFormat, payload: Vec<u8>) -> Result<Bytes> {
            match path {
                SYNC_PATH => {
                    assert_eq!(format, ContentFormat::TextPlain);
                    self.sync_posts.lock().unwrap().push(payload);
                    Ok(Bytes::from(self.sync_reply.clone()))
                }
                CONTROL_PATH => {
                    self.control_posts.lock().unwrap().push(payload);
                    if self.hang_control {
                        std::future::pending::<()>().await;
                    }
                    let reply = self.control_replies.lock().unwrap().pop_front();
                    reply.unwrap_or_else(|| Ok(Bytes::from_static(br#"{"status":"success"}"#)))
                }
                other => panic!("unexpected post to {}", other),
            }
        }

        async fn observe(&self, path: &str) -> Result<Observation> {
            assert_eq!(path, STATUS_PATH);
            let (tx, rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            *self.observer.lock().unwrap() = Some((tx, cancel.clone()));
            Ok(Observation {
                notifications: rx,
                cancel,
            })
        }

        async fn acknowledge(&self, notification: &Notification) -> Result<()> {
            self.acks.lock().unwrap().push(notification.message_id);
            Ok(())
        }
    }

    fn seeded_device(transport: MockTransport) -> Device<MockTransport> {
        Device::with_rng(transport, DeviceOptions::default(), &mut StdRng::seed_from_u64(3))
    }

    async fn synced_device(transport: MockTransport) -> Device<MockTransport> {
        let device = seeded_device(transport);
        device.sync().await.unwrap();
        device
    }

    fn power_on() -> Desired {
        Desired {
            power: Some(Power::On),
            ..Default::default()
        }
    }

    fn push(message_id: u16, payload: Vec<u8>) -> Notification {
        Notification {
            payload: Bytes::from(payload),
            message_id,
            confirmable: true,
            path: STATUS_PATH.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sync_handshake() {
        let device = seeded_device(MockTransport::new("0000000A"));
        assert_eq!(device.session_id().await, None);

        let id = device.sync().await.unwrap();
        assert_eq!(id.hex(), "0000000B");
        assert_eq!(device.session_id().await, Some(SessionId::new(0x0b)));

        let offered = SessionId::generate(&mut StdRng::seed_from_u64(3));
        let posts = device.transport().sync_posts.lock().unwrap().clone();
        assert_eq!(posts, vec![offered.hex().into_bytes()]);
    }

    #[tokio::test]
    async fn test_sync_rejects_garbage() {
        let device = seeded_device(MockTransport::new("nope"));
        let result = device.sync().await;
        assert!(matches!(result, Err(ProtocolError::Format(_))));
        assert_eq!(device.session_id().await, None);
    }

    #[tokio::test]
    async fn test_set_power_on_end_to_end() {
        let device = synced_device(MockTransport::new("0000000A")).await;

        device.set(power_on()).await.unwrap();

        let frame = device.transport().control_posts.lock().unwrap()[0].clone();
        assert!(frame.starts_with(b"0000000B"));
        assert_eq!(
            decode_message(&frame).unwrap(),
            br#"{"state":{"desired":{"pwr":"1"}}}"#
        );
        assert_eq!(device.session_id().await.unwrap().hex(), "0000000C");
    }

    #[tokio::test]
    async fn test_set_advances_on_rejection() {
        let device = synced_device(MockTransport::new("0000000A")).await;
        device
            .transport()
            .reply_control(Ok(Bytes::from_static(br#"{"status":"failed"}"#)));

        let result = device.set(power_on()).await;
        assert!(matches!(result, Err(ProtocolError::Command(_))));
        assert_eq!(device.session_id().await.unwrap().hex(), "0000000C");
    }

    #[tokio::test]
    async fn test_session_monotonic_over_mixed_outcomes() {
        let transport = MockTransport::new("00000100");
        transport.reply_control(Ok(Bytes::from_static(br#"{"status":"success"}"#)));
        transport.reply_control(Ok(Bytes::from_static(b"{}")));
        transport.reply_control(Err(ProtocolError::Transport("unreachable".to_string())));
        transport.reply_control(Ok(Bytes::from_static(b"not json")));
        transport.reply_control(Ok(Bytes::from_static(br#"{"status":"success"}"#)));
        let device = synced_device(transport).await;

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(device.set(power_on()).await.is_ok());
        }

        assert_eq!(outcomes, vec![true, false, false, false, true]);
        assert_eq!(device.session_id().await, Some(SessionId::new(0x101 + 5)));

        let sessions: Vec<SessionId> = device
            .transport()
            .control_posts
            .lock()
            .unwrap()
            .iter()
            .map(|frame| SessionId::parse(frame))
            .collect();
        let expected: Vec<SessionId> = (0x101..0x106).map(SessionId::new).collect();
        assert_eq!(sessions, expected);
    }

    #[tokio::test]
    async fn test_concurrent_sets_use_distinct_sessions() {
        let device = Arc::new(synced_device(MockTransport::new("00000000")).await);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let device = Arc::clone(&device);
            handles.push(tokio::spawn(async move {
                device
                    .set(Desired {
                        fan_speed: Some(FanSpeed::Turbo),
                        ..Default::default()
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut sessions: Vec<u32> = device
            .transport()
            .control_posts
            .lock()
            .unwrap()
            .iter()
            .map(|frame| SessionId::parse(frame).value())
            .collect();
        sessions.sort_unstable();
        assert_eq!(sessions, (1..=10).collect::<Vec<u32>>());
        assert_eq!(device.session_id().await, Some(SessionId::new(11)));
    }

    #[tokio::test]
    async fn test_set_times_out_and_still_advances() {
        let transport = MockTransport {
            hang_control: true,
            ..MockTransport::new("00000001")
        };
        let device = Device::with_rng(
            transport,
            DeviceOptions {
                request_timeout: Duration::from_millis(50),
            },
            &mut StdRng::seed_from_u64(1),
        );
        device.sync().await.unwrap();

        let result = device.set(power_on()).await;
        assert!(matches!(result, Err(ProtocolError::Timeout("control"))));
        assert_eq!(device.session_id().await, Some(SessionId::new(3)));
    }

    #[tokio::test]
    async fn test_requires_sync() {
        let device = seeded_device(MockTransport::new("0000000A"));

        let result = device.set(power_on()).await;
        assert!(matches!(result, Err(ProtocolError::NotSynced("set"))));

        let result = device.observe_status().await;
        assert!(matches!(result, Err(ProtocolError::NotSynced("observe_status"))));

        assert!(device.transport().control_posts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_info() {
        let transport = MockTransport {
            info: br#"{"name":"Living room","type":"AC2729","swversion":"0.2.1","device_id":"1c"}"#
                .to_vec(),
            ..MockTransport::new("00000001")
        };
        let device = seeded_device(transport);

        let info = device.info().await.unwrap();
        assert_eq!(info.name, "Living room");
        assert_eq!(info.device_id, "1c");
        assert_eq!(info.sw_version, "0.2.1");
    }

    #[tokio::test]
    async fn test_observe_survives_corrupt_frame() {
        let device = synced_device(MockTransport::new("0000000A")).await;
        let mut subscription = device.observe_status().await.unwrap();
        let (pushes, _) = device.transport().observer();

        let status = br#"{"state":{"reported":{"pwr":"1","om":"s","iaql":3,"rh":45}}}"#;
        // The device keys pushes with its own view of the session
        let valid = encode_message(SessionId::new(0x5000), status).unwrap();

        pushes.send(push(1, b"0000000BDEADBEEF".to_vec())).await.unwrap();
        pushes.send(push(2, valid)).await.unwrap();

        let first = subscription.next().await.unwrap();
        assert!(matches!(first, Err(ProtocolError::Format(_))));

        let second = subscription.next().await.unwrap().unwrap();
        assert!(second.is_on());
        assert_eq!(second.fan_speed, Some(FanSpeed::Silent));
        assert_eq!(second.air_quality.normalized(), "2");
        assert_eq!(second.humidity, 45);

        assert_eq!(*device.transport().acks.lock().unwrap(), vec![1, 2]);
        // Decoding pushes never touches the local counter
        assert_eq!(device.session_id().await.unwrap().hex(), "0000000B");
    }

    #[tokio::test]
    async fn test_observe_reports_bad_json() {
        let device = synced_device(MockTransport::new("0000000A")).await;
        let mut subscription = device.observe_status().await.unwrap();
        let (pushes, _) = device.transport().observer();

        let garbage = encode_message(SessionId::new(9), b"<html>").unwrap();
        let mut notification = push(7, garbage);
        notification.confirmable = false;
        pushes.send(notification).await.unwrap();

        let update = subscription.next().await.unwrap();
        assert!(matches!(update, Err(ProtocolError::Json(_))));
        assert!(device.transport().acks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_releases_observation() {
        let device = synced_device(MockTransport::new("0000000A")).await;
        let mut subscription = device.observe_status().await.unwrap();
        let (_, transport_cancel) = device.transport().observer();

        subscription.cancel();
        subscription.cancel();
        assert!(subscription.is_cancelled());
        assert!(transport_cancel.is_cancelled());
        assert!(subscription.next().await.is_none());

        subscription.cancel_handle().cancel();
    }

    #[tokio::test]
    async fn test_drop_cancels_observation() {
        let device = synced_device(MockTransport::new("0000000A")).await;
        let subscription = device.observe_status().await.unwrap();
        let (_, transport_cancel) = device.transport().observer();

        drop(subscription);
        assert!(transport_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_idle_subscriber_does_not_hold_back_acks() {
        let device = synced_device(MockTransport::new("0000000A")).await;
        let mut subscription = device.observe_status().await.unwrap();
        let (pushes, _) = device.transport().observer();

        for humidity in 1..=40u16 {
            let status = format!(r#"{{"state":{{"reported":{{"rh":{}}}}}}}"#, humidity);
            let frame = encode_message(SessionId::new(0x70), status.as_bytes()).unwrap();
            pushes.send(push(humidity, frame)).await.unwrap();
        }

        timeout(Duration::from_secs(1), async {
            while device.transport().acks.lock().unwrap().len() < 40 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("every push acknowledged");
        assert_eq!(
            *device.transport().acks.lock().unwrap(),
            (1..=40).collect::<Vec<u16>>()
        );

        // Only the newest updates are kept for the late reader
        let mut humidities = Vec::new();
        for _ in 0..STATUS_QUEUE_CAPACITY {
            humidities.push(subscription.next().await.unwrap().unwrap().humidity);
        }
        assert_eq!(humidities, (25..=40).collect::<Vec<i64>>());

        subscription.cancel();
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn test_set_refuses_empty_patch() {
        let device = synced_device(MockTransport::new("0000000A")).await;

        let result = device.set(Desired::default()).await;
        assert!(matches!(result, Err(ProtocolError::Command(_))));
        assert!(device.transport().control_posts.lock().unwrap().is_empty());
        assert_eq!(device.session_id().await.unwrap().hex(), "0000000B");
    }

    #[test]
    fn test_decode_status() {
        let frame = encode_message(
            SessionId::new(1),
            br#"{"state":{"reported":{"iaql":12,"err":49408}}}"#,
        )
        .unwrap();
        let status = decode_status(&frame).unwrap();
        assert_eq!(status.air_quality.level(), 5);
        assert_eq!(status.err.to_string(), "Error: 49408, refill water tank");
    }
}
