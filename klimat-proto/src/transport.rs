use crate::Result;
use bytes::Bytes;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const INFO_PATH: &str = "/sys/dev/info";
pub const SYNC_PATH: &str = "/sys/dev/sync";
pub const CONTROL_PATH: &str = "/sys/dev/control";
pub const STATUS_PATH: &str = "/sys/dev/status";

/// Content formats the device understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    TextPlain,
    ApplicationJson,
}

impl ContentFormat {
    /// CoAP Content-Format registry number
    pub fn number(self) -> u16 {
        match self {
            ContentFormat::TextPlain => 0,
            ContentFormat::ApplicationJson => 50,
        }
    }
}

/// A message pushed on an observed resource
#[derive(Debug, Clone)]
pub struct Notification {
    pub payload: Bytes,
    pub message_id: u16,
    /// The sender waits for an acknowledgement of this message
    pub confirmable: bool,
    pub path: String,
}

/// A live observe registration.
///
/// Notifications arrive on the channel until `cancel` is triggered or the
/// transport goes away. Cancelling releases the registration on the transport.
#[derive(Debug)]
pub struct Observation {
    pub notifications: mpsc::Receiver<Notification>,
    pub cancel: CancellationToken,
}

/// Request/response messaging layer used to reach the device
pub trait Transport: Send + Sync + 'static {
    fn get(&self, path: &str) -> impl Future<Output = Result<Bytes>> + Send;

    fn post(
        &self,
        path: &str,
        format: ContentFormat,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<Bytes>> + Send;

    fn observe(&self, path: &str) -> impl Future<Output = Result<Observation>> + Send;

    /// Acknowledges a confirmable notification
    fn acknowledge(&self, notification: &Notification) -> impl Future<Output = Result<()>> + Send;
}
