use std::fmt;
use std::net::IpAddr;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::auth::AuthMethod;
use crate::errors::{RelayError, Result};
use crate::packet::Packet;

pub type Responder<T> = oneshot::Sender<T>;

/// Caller-supplied credential check, invoked with the methods the path
/// accepts and its expected user and pass. Its error is relayed to the
/// caller unchanged.
pub type CredentialValidator = Box<dyn FnOnce(&[AuthMethod], &str, &str) -> Result<()> + Send>;

pub struct DescribeReq {
    pub path_name: String,
    pub remote_addr: String,
    pub local_addr: String,
    pub ip: IpAddr,
    pub validate_credentials: Option<CredentialValidator>,
    pub res: Responder<DescribeRes>,
}

pub type DescribeRes = Result<PathDescription>;

/// What a reader learns about a path before setting up playback.
#[derive(Debug, Clone)]
pub struct PathDescription {
    pub path_name: String,
    pub source_key: String,
    pub source_ready: bool,
}

pub struct SetupPlayReq {
    pub path_name: String,
    pub remote_addr: String,
    pub local_addr: String,
    pub ip: IpAddr,
    pub validate_credentials: Option<CredentialValidator>,
    pub res: Responder<SetupPlayRes>,
}

pub type SetupPlayRes = Result<ReaderHandle>;

pub struct AnnounceReq {
    pub path_name: String,
    pub remote_addr: String,
    pub local_addr: String,
    pub ip: IpAddr,
    pub validate_credentials: Option<CredentialValidator>,
    pub res: Responder<AnnounceRes>,
}

pub type AnnounceRes = Result<PublisherHandle>;

pub(crate) enum PathMessage {
    Describe(DescribeReq),
    SetupPlay(SetupPlayReq),
    Announce(AnnounceReq),
    Packet(Packet),
    SourceReady,
    SourceLost(String),
    ReaderGone(u64),
    PublisherGone,
}

pub(crate) type PathHandle = mpsc::UnboundedSender<PathMessage>;
pub(crate) type PathReceiver = mpsc::UnboundedReceiver<PathMessage>;

pub type Watcher = broadcast::Receiver<Packet>;
pub(crate) type PathBroadcast = broadcast::Sender<Packet>;

/// Live subscription to a path. Dropping it detaches the reader.
pub struct ReaderHandle {
    pub(crate) reader_id: u64,
    pub(crate) path_name: String,
    pub(crate) watcher: Option<Watcher>,
    pub(crate) path: PathHandle,
}

impl ReaderHandle {
    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    /// The packet stream. Yields once per handle.
    pub fn watcher(&mut self) -> Option<Watcher> {
        self.watcher.take()
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        let _ = self.path.send(PathMessage::ReaderGone(self.reader_id));
    }
}

impl fmt::Debug for ReaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderHandle")
            .field("path_name", &self.path_name)
            .field("reader_id", &self.reader_id)
            .finish_non_exhaustive()
    }
}

/// Exclusive right to feed a path. Dropping it detaches the publisher.
pub struct PublisherHandle {
    pub(crate) path_name: String,
    pub(crate) path: PathHandle,
}

impl PublisherHandle {
    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    pub fn send(&self, packet: Packet) -> Result<()> {
        self.path
            .send(PathMessage::Packet(packet))
            .map_err(|_| RelayError::Terminated)
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        let _ = self.path.send(PathMessage::PublisherGone);
    }
}

impl fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("path_name", &self.path_name)
            .finish_non_exhaustive()
    }
}
