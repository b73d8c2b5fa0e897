use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::auth::{AuthMethod, IpRange};
use crate::errors::{RelayError, Result};
use crate::source::SourceProto;

/// Where a path gets its media from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SourceKind {
    /// Wait for a protocol handler to push.
    #[default]
    Publisher,
    Rtsp(String),
    Rtmp(String),
}

impl SourceKind {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        if text == "publisher" {
            Ok(SourceKind::Publisher)
        } else if text.starts_with("rtsp://") {
            Ok(SourceKind::Rtsp(text.to_string()))
        } else if text.starts_with("rtmp://") {
            Ok(SourceKind::Rtmp(text.to_string()))
        } else {
            Err(format!("invalid source '{}'", text))
        }
    }

    pub fn is_publisher(&self) -> bool {
        matches!(self, SourceKind::Publisher)
    }

    pub fn proto(&self) -> Option<SourceProto> {
        match self {
            SourceKind::Publisher => None,
            SourceKind::Rtsp(_) => Some(SourceProto::Rtsp),
            SourceKind::Rtmp(_) => Some(SourceProto::Rtmp),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            SourceKind::Publisher => None,
            SourceKind::Rtsp(url) | SourceKind::Rtmp(url) => Some(url),
        }
    }

    /// Key of the live-path map: push paths are keyed by their resolved
    /// name, pull paths by the upstream URL so aliases share one path.
    pub fn source_key(&self, live_name: &str) -> String {
        match self {
            SourceKind::Publisher => live_name.to_string(),
            SourceKind::Rtsp(url) | SourceKind::Rtmp(url) => url.clone(),
        }
    }
}

/// Validates a live path name before any lookup.
pub fn check_path_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.starts_with('/') || name.ends_with('/') {
        return Err("name must not begin or end with a slash".to_string());
    }
    if name.contains("//") {
        return Err("name must not contain empty segments".to_string());
    }
    if name.chars().any(char::is_control) {
        return Err("name must not contain control characters".to_string());
    }
    Ok(())
}

/// Static description of one named stream or stream pattern.
///
/// A map key starting with `~` declares a pattern entry; its regular
/// expression is matched against live names at request time.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PathConf {
    pub source: String,
    pub source_on_demand: bool,
    pub publish_user: Option<String>,
    pub publish_pass: Option<String>,
    pub publish_ips: Vec<String>,
    pub read_user: Option<String>,
    pub read_pass: Option<String>,
    pub read_ips: Vec<String>,
    pub authentication_methods: Vec<AuthMethod>,
    pub http_callback: Option<String>,
    pub run_on_init: Option<String>,
    pub run_on_demand: Option<String>,
    pub run_on_publish: Option<String>,
    pub run_on_read: Option<String>,

    #[serde(skip)]
    pub source_kind: SourceKind,
    #[serde(skip)]
    pub publish_ips_parsed: Vec<IpRange>,
    #[serde(skip)]
    pub read_ips_parsed: Vec<IpRange>,
    #[serde(skip)]
    pub regexp: Option<Regex>,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: "publisher".to_string(),
            source_on_demand: false,
            publish_user: None,
            publish_pass: None,
            publish_ips: Vec::new(),
            read_user: None,
            read_pass: None,
            read_ips: Vec::new(),
            authentication_methods: vec![AuthMethod::Basic, AuthMethod::Digest],
            http_callback: None,
            run_on_init: None,
            run_on_demand: None,
            run_on_publish: None,
            run_on_read: None,
            source_kind: SourceKind::Publisher,
            publish_ips_parsed: Vec::new(),
            read_ips_parsed: Vec::new(),
            regexp: None,
        }
    }
}

// Structural over every declared field; compiled patterns compare by
// their source text. Reloading an unchanged file must compare equal.
impl PartialEq for PathConf {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.source_on_demand == other.source_on_demand
            && self.publish_user == other.publish_user
            && self.publish_pass == other.publish_pass
            && self.publish_ips == other.publish_ips
            && self.read_user == other.read_user
            && self.read_pass == other.read_pass
            && self.read_ips == other.read_ips
            && self.authentication_methods == other.authentication_methods
            && self.http_callback == other.http_callback
            && self.run_on_init == other.run_on_init
            && self.run_on_demand == other.run_on_demand
            && self.run_on_publish == other.run_on_publish
            && self.run_on_read == other.run_on_read
            && self.regexp.as_ref().map(Regex::as_str) == other.regexp.as_ref().map(Regex::as_str)
    }
}

impl PathConf {
    /// Validates the entry against its map key and fills the parsed
    /// fields. Called once at load time.
    pub(crate) fn finalize(&mut self, key: &str) -> Result<()> {
        if let Some(pattern) = key.strip_prefix('~') {
            let regexp = Regex::new(pattern).map_err(|err| {
                RelayError::config(format!("invalid path pattern '{}': {}", key, err))
            })?;
            self.regexp = Some(regexp);
        } else {
            check_path_name(key).map_err(|reason| {
                RelayError::config(format!("invalid path name '{}': {}", key, reason))
            })?;
        }

        self.source_kind = SourceKind::parse(&self.source)
            .map_err(|reason| RelayError::config(format!("path '{}': {}", key, reason)))?;

        if self.source_on_demand && self.source_kind.is_publisher() {
            return Err(RelayError::config(format!(
                "path '{}': sourceOnDemand is valid only for pull sources",
                key
            )));
        }
        if self.run_on_init.is_some() && self.regexp.is_some() {
            return Err(RelayError::config(format!(
                "path '{}': runOnInit cannot be used with a path pattern",
                key
            )));
        }
        if self.run_on_demand.is_some() && !self.source_kind.is_publisher() {
            return Err(RelayError::config(format!(
                "path '{}': runOnDemand is valid only when source is 'publisher'",
                key
            )));
        }
        if self.publish_user.is_some() != self.publish_pass.is_some() {
            return Err(RelayError::config(format!(
                "path '{}': publishUser and publishPass must be set together",
                key
            )));
        }
        if self.read_user.is_some() != self.read_pass.is_some() {
            return Err(RelayError::config(format!(
                "path '{}': readUser and readPass must be set together",
                key
            )));
        }
        if let Some(url) = &self.http_callback {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(RelayError::config(format!(
                    "path '{}': invalid httpCallback '{}'",
                    key, url
                )));
            }
        }
        if self.authentication_methods.is_empty() {
            return Err(RelayError::config(format!(
                "path '{}': at least one authentication method is required",
                key
            )));
        }

        self.publish_ips_parsed = parse_ip_list(key, &self.publish_ips)?;
        self.read_ips_parsed = parse_ip_list(key, &self.read_ips)?;
        Ok(())
    }

    /// Concrete copy handed to request handling; the registry template
    /// itself is never mutated.
    pub fn instantiate(&self) -> PathConf {
        let mut conf = self.clone();
        conf.regexp = None;
        conf
    }
}

fn parse_ip_list(key: &str, items: &[String]) -> Result<Vec<IpRange>> {
    items
        .iter()
        .map(|item| {
            IpRange::parse(item)
                .map_err(|reason| RelayError::config(format!("path '{}': {}", key, reason)))
        })
        .collect()
}

/// Resolves a live name against the registry: validation, then literal
/// lookup, then the first matching pattern entry.
pub fn find_path_conf(
    path_confs: &HashMap<String, PathConf>,
    name: &str,
) -> Result<(String, PathConf)> {
    check_path_name(name).map_err(|reason| RelayError::InvalidName {
        name: name.to_string(),
        reason,
    })?;

    if let Some(conf) = path_confs.get(name) {
        if conf.regexp.is_none() {
            return Ok((name.to_string(), conf.instantiate()));
        }
    }

    for (conf_name, conf) in path_confs {
        if let Some(regexp) = &conf.regexp {
            if regexp.is_match(name) {
                return Ok((conf_name.clone(), conf.instantiate()));
            }
        }
    }

    Err(RelayError::NotFound(name.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Settings {
    pub log_level: String,
    pub source_retry_pause_secs: u64,
    pub http_callback_timeout_secs: u64,
    pub paths: HashMap<String, PathConf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            source_retry_pause_secs: 5,
            http_callback_timeout_secs: 10,
            paths: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut settings: Settings = serde_yaml::from_str(text)
            .map_err(|err| RelayError::config(err.to_string()))?;
        settings.finalize()?;
        Ok(settings)
    }

    fn finalize(&mut self) -> Result<()> {
        for (key, conf) in &mut self.paths {
            conf.finalize(key)?;
        }
        Ok(())
    }

    pub fn source_retry_pause(&self) -> Duration {
        Duration::from_secs(self.source_retry_pause_secs)
    }

    pub fn http_callback_timeout(&self) -> Duration {
        Duration::from_secs(self.http_callback_timeout_secs)
    }
}

pub struct ConfigManager {
    path: Option<PathBuf>,
    settings: Settings,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let path = Self::find_config_file();
        let settings = Self::load(path.as_deref())?;
        Ok(Self { path, settings })
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Self::load(Some(&path))?;
        Ok(Self {
            path: Some(path),
            settings,
        })
    }

    fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            std::env::var("XRELAY_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("relay.yaml")),
            Some(PathBuf::from("config/relay.yaml")),
            Some(PathBuf::from("/etc/xrelay/relay.yaml")),
        ];

        for candidate in candidates.into_iter().flatten() {
            if candidate.exists() {
                log::info!("using config file: {}", candidate.display());
                return Some(candidate);
            }
        }
        None
    }

    fn load(path: Option<&Path>) -> Result<Settings> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|err| {
                    RelayError::config(format!("unable to read {}: {}", path.display(), err))
                })?;
                Settings::from_yaml(&text)
            }
            None => {
                log::warn!("no config file found, using defaults");
                Ok(Settings::default())
            }
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Re-reads the config file. On failure the previous settings stay
    /// in effect.
    pub fn reload(&mut self) -> Result<()> {
        log::info!("reloading configuration");
        self.settings = Self::load(self.path.as_deref())?;
        Ok(())
    }
}
