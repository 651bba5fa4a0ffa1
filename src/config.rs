use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use crate::server::DEFAULT_INDEX_PAGE;

#[derive(Parser, Debug, Clone)]
#[command(name = "filehub")]
#[command(about = "Relay files between two HTTP clients without storing them", long_about = None)]
pub struct Config {
    /// Address to listen on; all interfaces when empty
    #[arg(short, long, default_value = "")]
    pub bind: String,

    #[arg(short, long, default_value_t = 8000)]
    pub port: u16,

    /// Listen backlog of the server socket
    #[arg(long, default_value_t = 128)]
    pub backlog: u32,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Give up on an upload nobody downloads within this many seconds
    #[arg(long, value_name = "SECS")]
    pub wait_timeout: Option<u64>,

    /// Serve this page at `/` instead of the built-in one
    #[arg(long, value_name = "PATH")]
    pub ui: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Critical,
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Critical | LogLevel::Fatal | LogLevel::Error => {
                LevelFilter::Error
            }
            LogLevel::Warning => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
        }
    }
}

impl Config {
    pub fn log_filter(&self) -> LevelFilter {
        self.loglevel.into()
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout.map(Duration::from_secs)
    }

    /// Resolve the bind address, which may be a host name.
    pub async fn socket_addr(&self) -> io::Result<SocketAddr> {
        let host = match self.bind.trim() {
            "" => "0.0.0.0",
            host => host,
        };
        tokio::net::lookup_host((host, self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("cannot resolve bind address {:?}", host),
                )
            })
    }

    pub fn index_page(&self) -> io::Result<Bytes> {
        match &self.ui {
            Some(path) => Ok(Bytes::from(std::fs::read(path)?)),
            None => Ok(Bytes::from_static(DEFAULT_INDEX_PAGE.as_bytes())),
        }
    }
}
