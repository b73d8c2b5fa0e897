use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::packet::Packet;
use crate::stats::Stats;
use crate::transport::{PathHandle, PathMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceProto {
    Rtsp,
    Rtmp,
}

impl fmt::Display for SourceProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceProto::Rtsp => write!(f, "rtsp"),
            SourceProto::Rtmp => write!(f, "rtmp"),
        }
    }
}

pub type PacketSender = mpsc::UnboundedSender<Packet>;
pub type PacketReceiver = mpsc::UnboundedReceiver<Packet>;

/// Establishes sessions with upstream servers. The wire-level client
/// lives outside the core; embedders plug theirs in here.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// Connect to the upstream and return its packet stream. The stream
    /// ending means the session was lost.
    async fn connect(&self, url: &str) -> anyhow::Result<PacketReceiver>;
}

/// Task owned by a path that keeps its upstream session alive,
/// reconnecting after a pause until cancelled.
pub(crate) struct SourceTask {
    url: String,
    proto: SourceProto,
    driver: Arc<dyn SourceDriver>,
    path: PathHandle,
    stats: Arc<Stats>,
    retry_pause: Duration,
    cancel: CancellationToken,
}

impl SourceTask {
    pub(crate) fn spawn(
        url: String,
        proto: SourceProto,
        driver: Arc<dyn SourceDriver>,
        path: PathHandle,
        stats: Arc<Stats>,
        retry_pause: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let task = Self {
            url,
            proto,
            driver,
            path,
            stats,
            retry_pause,
            cancel,
        };
        tokio::spawn(task.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = self.driver.connect(&self.url) => match attempt {
                    Ok(packets) => self.forward(packets).await,
                    Err(err) => {
                        log::info!("[source {}] unable to connect: {}", self.url, err);
                        let _ = self.path.send(PathMessage::SourceLost(err.to_string()));
                    }
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_pause) => {}
            }
        }
    }

    async fn forward(&mut self, mut packets: PacketReceiver) {
        log::info!("[source {}] ready", self.url);
        self.stats.source_started(self.proto);
        let _ = self.path.send(PathMessage::SourceReady);

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break None,
                packet = packets.recv() => match packet {
                    Some(packet) => {
                        let _ = self.path.send(PathMessage::Packet(packet));
                    }
                    None => break Some("upstream closed the session".to_string()),
                }
            }
        };

        self.stats.source_stopped(self.proto);
        if let Some(reason) = reason {
            log::info!("[source {}] lost: {}", self.url, reason);
            let _ = self.path.send(PathMessage::SourceLost(reason));
        }
    }
}
