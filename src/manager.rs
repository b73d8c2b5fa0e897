use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthDecision, PlayRequestPayload};
use crate::config::{find_path_conf, PathConf, Settings, SourceKind};
use crate::errors::{RelayError, Result};
use crate::path::{Path, PathDeps};
use crate::source::SourceDriver;
use crate::stats::Stats;
use crate::transport::{
    AnnounceReq, CredentialValidator, DescribeReq, PathHandle, PathMessage, SetupPlayReq,
};

pub(crate) enum ManagerMessage {
    ConfReload(HashMap<String, PathConf>),
    PathClose { source_key: String, path_id: u64 },
    Describe(DescribeReq),
    SetupPlay(SetupPlayReq),
    Announce(AnnounceReq),
    /// Follow-up event carrying the outcome of an external authorization
    /// call that ran off the manager.
    AuthDecided {
        req: PlayReq,
        conf_name: String,
        registry_conf: PathConf,
        conf: PathConf,
        decision: Result<AuthDecision>,
    },
}

pub(crate) type ManagerTx = mpsc::UnboundedSender<ManagerMessage>;

/// A Describe or SetupPlay mid-flight; both share the play pipeline.
pub(crate) enum PlayReq {
    Describe(DescribeReq),
    SetupPlay(SetupPlayReq),
}

impl PlayReq {
    fn path_name(&self) -> &str {
        match self {
            PlayReq::Describe(req) => &req.path_name,
            PlayReq::SetupPlay(req) => &req.path_name,
        }
    }

    fn remote_addr(&self) -> &str {
        match self {
            PlayReq::Describe(req) => &req.remote_addr,
            PlayReq::SetupPlay(req) => &req.remote_addr,
        }
    }

    fn local_addr(&self) -> &str {
        match self {
            PlayReq::Describe(req) => &req.local_addr,
            PlayReq::SetupPlay(req) => &req.local_addr,
        }
    }

    fn ip(&self) -> IpAddr {
        match self {
            PlayReq::Describe(req) => req.ip,
            PlayReq::SetupPlay(req) => req.ip,
        }
    }

    fn take_validator(&mut self) -> Option<CredentialValidator> {
        match self {
            PlayReq::Describe(req) => req.validate_credentials.take(),
            PlayReq::SetupPlay(req) => req.validate_credentials.take(),
        }
    }

    fn reply_err(self, err: RelayError) {
        match self {
            PlayReq::Describe(req) => {
                let _ = req.res.send(Err(err));
            }
            PlayReq::SetupPlay(req) => {
                let _ = req.res.send(Err(err));
            }
        }
    }

    fn into_path_message(self) -> PathMessage {
        match self {
            PlayReq::Describe(req) => PathMessage::Describe(req),
            PlayReq::SetupPlay(req) => PathMessage::SetupPlay(req),
        }
    }
}

struct PathEntry {
    id: u64,
    conf_name: String,
    /// Snapshot of the registry entry the path was built from; reload
    /// compares against it to decide whether the path survives.
    registry_conf: PathConf,
    handle: PathHandle,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// The coordinator owning the namespace of live paths. A single actor:
/// every mutation of the path set and the stored configuration happens
/// on its event loop, one message at a time.
pub struct PathManager {
    stats: Arc<Stats>,
    driver: Option<Arc<dyn SourceDriver>>,
    retry_pause: Duration,
    callback_timeout: Duration,
    path_confs: HashMap<String, PathConf>,
    paths: HashMap<String, PathEntry>,
    next_path_id: u64,
    tx: ManagerTx,
    incoming: mpsc::UnboundedReceiver<ManagerMessage>,
    cancel: CancellationToken,
}

/// Cheap clonable front door handed to protocol handlers. Every call is
/// non-blocking; replies arrive on the request's channel. Once the
/// manager is cancelled, requests are answered with `Terminated` right
/// here without touching the queue.
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: ManagerTx,
    cancel: CancellationToken,
}

impl PathManagerHandle {
    pub fn describe(&self, req: DescribeReq) {
        self.send_request(ManagerMessage::Describe(req));
    }

    pub fn setup_play(&self, req: SetupPlayReq) {
        self.send_request(ManagerMessage::SetupPlay(req));
    }

    pub fn announce(&self, req: AnnounceReq) {
        self.send_request(ManagerMessage::Announce(req));
    }

    /// Hands the full new pattern-to-config map to the manager.
    pub fn reload(&self, path_confs: HashMap<String, PathConf>) {
        let _ = self.tx.send(ManagerMessage::ConfReload(path_confs));
    }

    /// Requests shutdown; the manager joins every path before exiting.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn send_request(&self, message: ManagerMessage) {
        if self.cancel.is_cancelled() {
            reply_terminated(message);
            return;
        }
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            reply_terminated(message);
        }
    }
}

fn reply_terminated(message: ManagerMessage) {
    match message {
        ManagerMessage::Describe(req) => {
            let _ = req.res.send(Err(RelayError::Terminated));
        }
        ManagerMessage::SetupPlay(req) => {
            let _ = req.res.send(Err(RelayError::Terminated));
        }
        ManagerMessage::Announce(req) => {
            let _ = req.res.send(Err(RelayError::Terminated));
        }
        ManagerMessage::AuthDecided { req, .. } => req.reply_err(RelayError::Terminated),
        ManagerMessage::ConfReload(_) | ManagerMessage::PathClose { .. } => {}
    }
}

fn reply_terminated_path(message: PathMessage) {
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

impl PathManager {
    pub fn new(
        settings: &Settings,
        stats: Arc<Stats>,
        driver: Option<Arc<dyn SourceDriver>>,
    ) -> Self {
        let (tx, incoming) = mpsc::unbounded_channel();
        Self {
            stats,
            driver,
            retry_pause: settings.source_retry_pause(),
            callback_timeout: settings.http_callback_timeout(),
            path_confs: settings.paths.clone(),
            paths: HashMap::new(),
            next_path_id: 1,
            tx,
            incoming,
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> PathManagerHandle {
        PathManagerHandle {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub async fn run(mut self) {
        self.create_static_paths();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = self.incoming.recv() => match message {
                    Some(message) => self.process_message(message).await,
                    None => break,
                }
            }
        }

        self.shutdown().await;
    }

    async fn process_message(&mut self, message: ManagerMessage) {
        match message {
            ManagerMessage::ConfReload(path_confs) => self.apply_conf(path_confs).await,

            ManagerMessage::PathClose { source_key, path_id } => {
                let still_ours = self
                    .paths
                    .get(&source_key)
                    .map(|entry| entry.id == path_id)
                    .unwrap_or(false);
                if still_ours {
                    if let Some(entry) = self.paths.remove(&source_key) {
                        close_path(entry).await;
                    }
                }
            }

            ManagerMessage::Describe(req) => self.handle_play(PlayReq::Describe(req)),
            ManagerMessage::SetupPlay(req) => self.handle_play(PlayReq::SetupPlay(req)),
            ManagerMessage::Announce(req) => self.handle_announce(req),

            ManagerMessage::AuthDecided {
                req,
                conf_name,
                registry_conf,
                conf,
                decision,
            } => match decision {
                Ok(decision) => self.finish_play(req, conf_name, registry_conf, conf, decision),
                Err(err) => req.reply_err(err),
            },
        }
    }

    /// Applies a full new configuration: prune, update, add, then close
    /// every live path whose originating entry is gone or changed, and
    /// finally create the missing static paths.
    async fn apply_conf(&mut self, new_confs: HashMap<String, PathConf>) {
        log::info!("reloading path configuration ({} entries)", new_confs.len());

        self.path_confs
            .retain(|name, _| new_confs.contains_key(name));
        for (name, conf) in self.path_confs.iter_mut() {
            let incoming = &new_confs[name];
            if conf != incoming {
                *conf = incoming.clone();
            }
        }
        for (name, conf) in new_confs {
            self.path_confs.entry(name).or_insert(conf);
        }

        let stale: Vec<String> = self
            .paths
            .iter()
            .filter(|(_, entry)| match self.path_confs.get(&entry.conf_name) {
                Some(conf) => *conf != entry.registry_conf,
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(entry) = self.paths.remove(&key) {
                log::info!("closing path '{}': configuration removed or changed", key);
                close_path(entry).await;
            }
        }

        self.create_static_paths();
    }

    /// Pattern entries wait for a matching request; everything else gets
    /// a path up front.
    fn create_static_paths(&mut self) {
        let static_entries: Vec<(String, PathConf)> = self
            .path_confs
            .iter()
            .filter(|(_, conf)| conf.regexp.is_none())
            .map(|(name, conf)| (name.clone(), conf.clone()))
            .collect();

        for (name, conf) in static_entries {
            let source_key = conf.source_kind.source_key(&name);
            if !self.paths.contains_key(&source_key) {
                let instance = conf.instantiate();
                self.create_path(name.clone(), conf, instance, name);
            }
        }
    }

    fn create_path(
        &mut self,
        conf_name: String,
        registry_conf: PathConf,
        conf: PathConf,
        name: String,
    ) {
        let id = self.next_path_id;
        self.next_path_id += 1;

        let dynamic = registry_conf.regexp.is_some();
        let source_key = conf.source_kind.source_key(&name);
        let cancel = self.cancel.child_token();
        let (handle, path_incoming) = mpsc::unbounded_channel();

        let path = Path::new(
            id,
            name,
            conf,
            source_key.clone(),
            dynamic,
            handle.clone(),
            path_incoming,
            cancel.clone(),
            PathDeps {
                stats: self.stats.clone(),
                driver: self.driver.clone(),
                manager: self.tx.clone(),
                retry_pause: self.retry_pause,
            },
        );
        let join = tokio::spawn(path.run());

        self.paths.insert(
            source_key,
            PathEntry {
                id,
                conf_name,
                registry_conf,
                handle,
                cancel,
                join,
            },
        );
    }

    /// Phase one of Describe/SetupPlay: resolve the configuration and,
    /// when a callback is set, push the HTTP call off the actor. The
    /// outcome re-enters the queue as `AuthDecided`.
    fn handle_play(&mut self, req: PlayReq) {
        let (conf_name, conf) = match find_path_conf(&self.path_confs, req.path_name()) {
            Ok(found) => found,
            Err(err) => {
                req.reply_err(err);
                return;
            }
        };
        let registry_conf = self
            .path_confs
            .get(&conf_name)
            .cloned()
            .unwrap_or_else(|| conf.clone());

        match conf.http_callback.clone() {
            Some(url) => {
                let payload = PlayRequestPayload {
                    remote_addr: req.remote_addr().to_string(),
                    local_addr: req.local_addr().to_string(),
                    path: req.path_name().to_string(),
                };
                let timeout = self.callback_timeout;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let decision = auth::request_play_decision(&url, &payload, timeout).await;
                    let message = ManagerMessage::AuthDecided {
                        req,
                        conf_name,
                        registry_conf,
                        conf,
                        decision,
                    };
                    if let Err(mpsc::error::SendError(message)) = tx.send(message) {
                        reply_terminated(message);
                    }
                });
            }
            None => self.finish_play(req, conf_name, registry_conf, conf, AuthDecision::Allow),
        }
    }

    /// Phase two: apply the decision, authorize, then locate or create
    /// the path keyed by the resolved source and hand the request over.
    fn finish_play(
        &mut self,
        mut req: PlayReq,
        conf_name: String,
        registry_conf: PathConf,
        mut conf: PathConf,
        decision: AuthDecision,
    ) {
        match decision {
            AuthDecision::Allow => {}
            AuthDecision::Deny => {
                req.reply_err(RelayError::NotAllowed);
                return;
            }
            AuthDecision::Redirect(target) => match SourceKind::parse(&target) {
                Ok(kind) if !kind.is_publisher() => {
                    conf.source = target;
                    conf.source_kind = kind;
                }
                _ => {
                    req.reply_err(RelayError::Upstream(format!(
                        "invalid redirect target '{}'",
                        target
                    )));
                    return;
                }
            },
        }

        let validator = req.take_validator();
        if let Err(err) = auth::authenticate(
            req.ip(),
            validator,
            &conf.authentication_methods,
            &conf.read_ips_parsed,
            &conf.read_user,
            &conf.read_pass,
        ) {
            if err.should_log_error() {
                log::error!("play request for '{}' rejected: {}", req.path_name(), err);
            } else {
                log::info!("play request for '{}' rejected: {}", req.path_name(), err);
            }
            req.reply_err(err);
            return;
        }

        let source_key = conf.source_kind.source_key(req.path_name());
        if !self.paths.contains_key(&source_key) {
            let name = req.path_name().to_string();
            self.create_path(conf_name, registry_conf, conf, name);
        }
        self.forward(&source_key, req.into_path_message());
    }

    fn handle_announce(&mut self, mut req: AnnounceReq) {
        let (conf_name, conf) = match find_path_conf(&self.path_confs, &req.path_name) {
            Ok(found) => found,
            Err(err) => {
                let _ = req.res.send(Err(err));
                return;
            }
        };

        let validator = req.validate_credentials.take();
        if let Err(err) = auth::authenticate(
            req.ip,
            validator,
            &conf.authentication_methods,
            &conf.publish_ips_parsed,
            &conf.publish_user,
            &conf.publish_pass,
        ) {
            log::info!("publish request for '{}' rejected: {}", req.path_name, err);
            let _ = req.res.send(Err(err));
            return;
        }

        let source_key = conf.source_kind.source_key(&req.path_name);
        if !self.paths.contains_key(&source_key) {
            let registry_conf = self
                .path_confs
                .get(&conf_name)
                .cloned()
                .unwrap_or_else(|| conf.clone());
            let name = req.path_name.clone();
            self.create_path(conf_name, registry_conf, conf, name);
        }
        self.forward(&source_key, PathMessage::Announce(req));
    }

    fn forward(&mut self, source_key: &str, message: PathMessage) {
        let Some(entry) = self.paths.get(source_key) else {
            reply_terminated_path(message);
            return;
        };
        if let Err(mpsc::error::SendError(message)) = entry.handle.send(message) {
            reply_terminated_path(message);
        }
    }

    async fn shutdown(mut self) {
        log::info!("path manager shutting down");
        self.cancel.cancel();

        let entries: Vec<PathEntry> = self.paths.drain().map(|(_, entry)| entry).collect();
        let joins =
            futures::future::join_all(entries.into_iter().map(|entry| entry.join)).await;
        for join in joins {
            if let Err(err) = join {
                log::error!("path task panicked: {}", err);
            }
        }

        self.incoming.close();
        while let Ok(message) = self.incoming.try_recv() {
            reply_terminated(message);
        }
    }
}

async fn close_path(entry: PathEntry) {
    entry.cancel.cancel();
    if let Err(err) = entry.join.await {
        log::error!("path task for '{}' panicked: {}", entry.conf_name, err);
    }
}
