pub mod auth;
pub mod config;
pub mod errors;
mod hooks;
pub mod manager;
pub mod packet;
mod path;
pub mod source;
pub mod stats;
pub mod transport;

pub use self::{
    errors::{RelayError, Result},
    manager::{PathManager, PathManagerHandle},
    stats::Stats,
    transport::{
        AnnounceReq, DescribeReq, PathDescription, PublisherHandle, ReaderHandle, SetupPlayReq,
        Watcher,
    },
};
