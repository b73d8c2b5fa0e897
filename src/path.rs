use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PathConf;
use crate::errors::RelayError;
use crate::hooks::Hook;
use crate::manager::{ManagerMessage, ManagerTx};
use crate::source::{SourceDriver, SourceTask};
use crate::stats::Stats;
use crate::transport::{
    PathBroadcast, PathDescription, PathHandle, PathMessage, PathReceiver, PublisherHandle,
    ReaderHandle,
};

const BROADCAST_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    Initializing,
    WaitingSource,
    SourceReady,
    Closing,
}

enum SourceSlot {
    /// Push path: the source is whatever publisher attaches.
    Publisher,
    /// Pull path with no session task in flight.
    Stopped,
    /// Pull path with a live session task.
    Running {
        cancel: CancellationToken,
        join: JoinHandle<()>,
    },
}

/// Resources every path borrows from the manager.
pub(crate) struct PathDeps {
    pub stats: Arc<Stats>,
    pub driver: Option<Arc<dyn SourceDriver>>,
    pub manager: ManagerTx,
    pub retry_pause: Duration,
}

/// One live stream: at most one publisher, any number of readers, and
/// an optional managed upstream session. Runs as its own actor; all
/// entry points arrive as messages forwarded by the manager or sent by
/// the handles it gave out.
pub(crate) struct Path {
    id: u64,
    name: String,
    conf: PathConf,
    source_key: String,
    /// Born from a pattern entry; closes itself once empty.
    dynamic: bool,
    deps: PathDeps,
    handle: PathHandle,
    incoming: PathReceiver,
    outgoing: PathBroadcast,
    cancel: CancellationToken,
    state: PathState,
    publisher_connected: bool,
    readers: HashMap<u64, Option<Hook>>,
    next_reader_id: u64,
    source: SourceSlot,
    on_init_hook: Option<Hook>,
    on_demand_hook: Option<Hook>,
    on_publish_hook: Option<Hook>,
}

impl Path {
    pub(crate) fn new(
        id: u64,
        name: String,
        conf: PathConf,
        source_key: String,
        dynamic: bool,
        handle: PathHandle,
        incoming: PathReceiver,
        cancel: CancellationToken,
        deps: PathDeps,
    ) -> Self {
        let (outgoing, _) = tokio::sync::broadcast::channel(BROADCAST_CAPACITY);
        let source = if conf.source_kind.is_publisher() {
            SourceSlot::Publisher
        } else {
            SourceSlot::Stopped
        };

        Self {
            id,
            name,
            conf,
            source_key,
            dynamic,
            deps,
            handle,
            incoming,
            outgoing,
            cancel,
            state: PathState::Initializing,
            publisher_connected: false,
            readers: HashMap::new(),
            next_reader_id: 0,
            source,
            on_init_hook: None,
            on_demand_hook: None,
            on_publish_hook: None,
        }
    }

    pub(crate) async fn run(mut self) {
        log::info!("[path {}] created", self.name);

        if let Some(command) = self.conf.run_on_init.clone() {
            self.on_init_hook = Hook::spawn("on init", &command, &self.name);
        }

        if let Some(proto) = self.conf.source_kind.proto() {
            self.deps.stats.add_idle_source(proto);
            if !self.conf.source_on_demand {
                self.start_source();
            }
        }
        self.state = PathState::WaitingSource;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = self.incoming.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => break,
                }
            }
        }

        self.close().await;
    }

    async fn handle_message(&mut self, message: PathMessage) {
        match message {
            PathMessage::Describe(req) => {
                let _ = req.res.send(Ok(PathDescription {
                    path_name: self.name.clone(),
                    source_key: self.source_key.clone(),
                    source_ready: self.state == PathState::SourceReady,
                }));
            }

            PathMessage::SetupPlay(req) => {
                let reader_id = self.next_reader_id;
                self.next_reader_id += 1;

                let hook = match &self.conf.run_on_read {
                    Some(command) => Hook::spawn("on read", command, &self.name),
                    None => None,
                };
                self.readers.insert(reader_id, hook);
                self.deps.stats.add_reader();
                if self.readers.len() == 1 {
                    self.on_first_reader();
                }

                let _ = req.res.send(Ok(ReaderHandle {
                    reader_id,
                    path_name: self.name.clone(),
                    watcher: Some(self.outgoing.subscribe()),
                    path: self.handle.clone(),
                }));
                log::info!(
                    "[path {}] reader attached ({} total)",
                    self.name,
                    self.readers.len()
                );
            }

            PathMessage::Announce(req) => {
                // a pull path's upstream occupies the publisher slot
                if self.publisher_connected || !self.conf.source_kind.is_publisher() {
                    let _ = req
                        .res
                        .send(Err(RelayError::AlreadyPublishing(self.name.clone())));
                    return;
                }

                self.publisher_connected = true;
                self.deps.stats.add_publisher();
                self.set_source_ready();

                let _ = req.res.send(Ok(PublisherHandle {
                    path_name: self.name.clone(),
                    path: self.handle.clone(),
                }));
                log::info!("[path {}] publisher attached", self.name);
            }

            PathMessage::Packet(packet) => {
                if self.state != PathState::SourceReady {
                    return;
                }
                self.deps.stats.add_bytes_received(packet.len() as u64);
                if self.outgoing.receiver_count() != 0 && self.outgoing.send(packet).is_err() {
                    log::error!("[path {}] failed to broadcast packet", self.name);
                }
            }

            PathMessage::SourceReady => self.set_source_ready(),

            PathMessage::SourceLost(_reason) => {
                self.leave_ready();
                if self.conf.source_on_demand && self.readers.is_empty() {
                    self.request_close();
                }
            }

            PathMessage::ReaderGone(reader_id) => {
                if self.readers.remove(&reader_id).is_some() {
                    self.deps.stats.remove_reader();
                    log::info!(
                        "[path {}] reader detached ({} total)",
                        self.name,
                        self.readers.len()
                    );
                    if self.readers.is_empty() {
                        self.on_last_reader().await;
                    }
                    self.maybe_close_dynamic();
                }
            }

            PathMessage::PublisherGone => {
                if self.publisher_connected {
                    self.publisher_connected = false;
                    self.deps.stats.remove_publisher();
                    self.leave_ready();
                    log::info!("[path {}] publisher detached", self.name);
                    self.maybe_close_dynamic();
                }
            }
        }
    }

    fn set_source_ready(&mut self) {
        if self.state == PathState::SourceReady {
            return;
        }
        self.state = PathState::SourceReady;
        if let Some(command) = self.conf.run_on_publish.clone() {
            self.on_publish_hook = Hook::spawn("on publish", &command, &self.name);
        }
    }

    fn leave_ready(&mut self) {
        if self.state == PathState::SourceReady {
            self.state = PathState::WaitingSource;
            self.on_publish_hook = None;
        }
    }

    fn on_first_reader(&mut self) {
        if self.conf.source_on_demand {
            self.start_source();
        }
        if self.conf.source_kind.is_publisher() {
            if let Some(command) = self.conf.run_on_demand.clone() {
                self.on_demand_hook = Hook::spawn("on demand", &command, &self.name);
            }
        }
    }

    async fn on_last_reader(&mut self) {
        self.on_demand_hook = None;
        if self.conf.source_on_demand {
            self.stop_source().await;
            self.leave_ready();
        }
    }

    fn maybe_close_dynamic(&mut self) {
        if self.dynamic && !self.publisher_connected && self.readers.is_empty() {
            self.request_close();
        }
    }

    /// Asks the manager to take this path out of the live set. The
    /// manager double-checks identity, so a reload that already replaced
    /// us is unaffected.
    fn request_close(&self) {
        let _ = self.deps.manager.send(ManagerMessage::PathClose {
            source_key: self.source_key.clone(),
            path_id: self.id,
        });
    }

    fn start_source(&mut self) {
        if matches!(self.source, SourceSlot::Running { .. } | SourceSlot::Publisher) {
            return;
        }
        let (Some(proto), Some(url)) = (self.conf.source_kind.proto(), self.conf.source_kind.url())
        else {
            return;
        };
        let Some(driver) = self.deps.driver.clone() else {
            log::warn!(
                "[path {}] no source driver available, upstream '{}' stays idle",
                self.name,
                url
            );
            return;
        };

        let cancel = self.cancel.child_token();
        let join = SourceTask::spawn(
            url.to_string(),
            proto,
            driver,
            self.handle.clone(),
            self.deps.stats.clone(),
            self.deps.retry_pause,
            cancel.clone(),
        );
        self.source = SourceSlot::Running { cancel, join };
        log::info!("[path {}] started {} source for '{}'", self.name, proto, url);
    }

    async fn stop_source(&mut self) {
        match std::mem::replace(&mut self.source, SourceSlot::Stopped) {
            SourceSlot::Running { cancel, join } => {
                cancel.cancel();
                if let Err(err) = join.await {
                    log::error!("[path {}] source task panicked: {}", self.name, err);
                }
            }
            other => self.source = other,
        }
    }

    /// Idempotent teardown: stops the source, kills every hook, settles
    /// the gauges and answers anything that raced with the close.
    async fn close(mut self) {
        self.state = PathState::Closing;
        self.stop_source().await;

        if let Some(proto) = self.conf.source_kind.proto() {
            self.deps.stats.remove_idle_source(proto);
        }
        if self.publisher_connected {
            self.deps.stats.remove_publisher();
        }
        for _ in 0..self.readers.len() {
            self.deps.stats.remove_reader();
        }
        self.readers.clear();
        self.on_init_hook = None;
        self.on_demand_hook = None;
        self.on_publish_hook = None;

        self.incoming.close();
        while let Ok(message) = self.incoming.try_recv() {
            match message {
                PathMessage::Describe(req) => {
                    let _ = req.res.send(Err(RelayError::Terminated));
                }
                PathMessage::SetupPlay(req) => {
                    let _ = req.res.send(Err(RelayError::Terminated));
                }
                PathMessage::Announce(req) => {
                    let _ = req.res.send(Err(RelayError::Terminated));
                }
                _ => {}
            }
        }

        log::info!("[path {}] closed", self.name);
    }
}
