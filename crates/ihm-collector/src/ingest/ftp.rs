//! FTP access to the controller's report directory
//!
//! [`FileSource`] is what the orchestrator talks to. It sits on a
//! [`Transport`], which opens a [`TransportSession`]; the production
//! transport is [`FtpTransport`] over `suppaftp`'s blocking client, driven
//! from `spawn_blocking`. Tests swap in a scripted transport.
//!
//! All sessions use Extended Passive Mode (EPSV) and binary transfers.
//!
//! # Examples
//!
//! ```rust,ignore
//! use ihm_collector::ingest::exclusion::ExclusionFilter;
//! use ihm_collector::ingest::ftp::{Credentials, FileSource, FtpTransport};
//!
//! let mut source = FileSource::new(Arc::new(FtpTransport), ExclusionFilter::default());
//! let mut session = source.connect(&Credentials::default()).await?;
//! let files = source.list(session.as_mut(), "/InternalStorage/data/").await?;
//! source.close(session).await;
//! ```

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::io::ErrorKind;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, info, warn};

use super::exclusion::ExclusionFilter;
use super::models::RemoteFileRef;
use crate::error::{CollectorError, ConnectionError, Result};

/// Connection settings for the controller
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: String::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Credentials {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Kind of a directory listing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Links, devices and anything else that is not a regular file
    Other,
}

/// One parsed line of a LIST response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub modified: Option<NaiveDateTime>,
    pub hash: Option<String>,
}

impl ListingEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size: Some(size),
            modified: None,
            hash: None,
        }
    }

    /// Parse a LIST line in Unix or MS-DOS/IIS format
    ///
    /// `-rw-r--r--   1 ftp ftp  1234 Aug 26 17:40 Relatorio_2025_08.csv`
    /// `08-26-25  05:40PM              1234 Relatorio_2025_08.csv`
    pub fn parse(line: &str) -> Option<Self> {
        Self::parse_at(line, Local::now().naive_local())
    }

    /// Like [`ListingEntry::parse`], resolving year-less Unix dates against `now`
    pub fn parse_at(line: &str, now: NaiveDateTime) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        parse_unix(line, now).or_else(|| parse_dos(line))
    }
}

/// Split off `count` whitespace-separated fields and return the rest verbatim
fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    for _ in 0..count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        None
    } else {
        Some((fields, rest))
    }
}

fn parse_unix(line: &str, now: NaiveDateTime) -> Option<ListingEntry> {
    let (fields, name) = split_fields(line, 8)?;
    let perms = fields[0];
    if perms.len() < 10 {
        return None;
    }

    let kind = match perms.as_bytes()[0] {
        b'-' => EntryKind::File,
        b'd' => EntryKind::Directory,
        b'l' | b'b' | b'c' | b'p' | b's' => EntryKind::Other,
        _ => return None,
    };

    let name = match kind {
        EntryKind::Other => name.split(" -> ").next().unwrap_or(name),
        _ => name,
    };

    Some(ListingEntry {
        name: name.to_string(),
        kind,
        size: fields[4].parse().ok(),
        modified: unix_timestamp(fields[5], fields[6], fields[7], now),
        hash: None,
    })
}

fn unix_timestamp(
    month: &str,
    day: &str,
    year_or_time: &str,
    now: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let day: u32 = day.parse().ok()?;
    let month_day = |year: i32| {
        NaiveDate::parse_from_str(&format!("{year}-{month}-{day}"), "%Y-%b-%d").ok()
    };

    match year_or_time.split_once(':') {
        Some((hour, minute)) => {
            let time = NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
            let this_year = month_day(now.year())?.and_time(time);
            // Year-less entries are never in the future
            if this_year > now + ChronoDuration::days(1) {
                month_day(now.year() - 1).map(|d| d.and_time(time))
            } else {
                Some(this_year)
            }
        },
        None => month_day(year_or_time.parse().ok()?)?.and_hms_opt(0, 0, 0),
    }
}

fn parse_dos(line: &str) -> Option<ListingEntry> {
    let (fields, name) = split_fields(line, 3)?;

    let date = NaiveDate::parse_from_str(fields[0], "%m-%d-%y")
        .or_else(|_| NaiveDate::parse_from_str(fields[0], "%m-%d-%Y"))
        .ok()?;
    let time = NaiveTime::parse_from_str(fields[1], "%I:%M%p")
        .or_else(|_| NaiveTime::parse_from_str(fields[1], "%H:%M"))
        .ok();

    let (kind, size) = if fields[2].eq_ignore_ascii_case("<DIR>") {
        (EntryKind::Directory, None)
    } else {
        (EntryKind::File, Some(fields[2].parse().ok()?))
    };

    Some(ListingEntry {
        name: name.to_string(),
        kind,
        size,
        modified: time.map(|t| date.and_time(t)),
        hash: None,
    })
}

/// Opens sessions against the controller
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn TransportSession>, ConnectionError>;
}

/// An open, authenticated session
#[async_trait]
pub trait TransportSession: Send {
    async fn list(&mut self, remote_dir: &str) -> Result<Vec<ListingEntry>>;

    async fn retrieve(&mut self, remote_path: &str) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Production transport over `suppaftp`
#[derive(Debug, Clone, Copy, Default)]
pub struct FtpTransport;

#[async_trait]
impl Transport for FtpTransport {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn TransportSession>, ConnectionError> {
        let addr = credentials.addr();
        let stream = tokio::task::spawn_blocking({
            let credentials = credentials.clone();
            move || open_stream(&credentials)
        })
        .await
        .map_err(|e| ConnectionError::Other(format!("FTP connect task panicked: {}", e)))??;

        info!(addr = %addr, user = %credentials.username, "Connected to controller");
        Ok(Box::new(FtpSession {
            stream: Some(stream),
            addr,
        }))
    }
}

fn open_stream(credentials: &Credentials) -> std::result::Result<FtpStream, ConnectionError> {
    let addr = credentials.addr();
    let socket = (credentials.host.as_str(), credentials.port)
        .to_socket_addrs()
        .map_err(|e| ConnectionError::Other(format!("Cannot resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| ConnectionError::Other(format!("No address found for {}", addr)))?;

    debug!(addr = %addr, timeout = ?credentials.connect_timeout, "Connecting to FTP server");
    let mut stream = FtpStream::connect_timeout(socket, credentials.connect_timeout)
        .map_err(|e| connect_error(&addr, e))?;

    stream.set_mode(Mode::ExtendedPassive);

    debug!(user = %credentials.username, "Logging in");
    stream
        .login(&credentials.username, &credentials.password)
        .map_err(|e| ConnectionError::Authentication {
            user: credentials.username.clone(),
            reason: e.to_string(),
        })?;

    stream
        .transfer_type(FileType::Binary)
        .map_err(|e| ConnectionError::Other(format!("Failed to set binary mode: {}", e)))?;

    Ok(stream)
}

fn connect_error(addr: &str, err: FtpError) -> ConnectionError {
    match err {
        FtpError::ConnectionError(io) => match io.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectionError::Timeout {
                addr: addr.to_string(),
            },
            ErrorKind::ConnectionRefused => ConnectionError::Refused {
                addr: addr.to_string(),
            },
            _ => ConnectionError::Other(format!("{}: {}", addr, io)),
        },
        other => ConnectionError::Other(format!("{}: {}", addr, other)),
    }
}

/// A live `suppaftp` session; quits on close or drop
pub struct FtpSession {
    stream: Option<FtpStream>,
    addr: String,
}

impl FtpSession {
    /// Run a blocking FTP command off the async runtime
    async fn run<T, F>(&mut self, target: String, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> std::result::Result<T, FtpError> + Send + 'static,
    {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| CollectorError::transfer(&target, "session is closed"))?;

        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await?;

        self.stream = Some(stream);
        result.map_err(|e| CollectorError::transfer(target, e))
    }
}

#[async_trait]
impl TransportSession for FtpSession {
    async fn list(&mut self, remote_dir: &str) -> Result<Vec<ListingEntry>> {
        let dir = remote_dir.to_string();
        let lines = self
            .run(remote_dir.to_string(), move |stream| stream.list(Some(&dir)))
            .await?;

        let mut entries = Vec::with_capacity(lines.len());
        for line in &lines {
            match ListingEntry::parse(line) {
                Some(entry) => entries.push(entry),
                None => debug!(line = %line, "Unrecognised LIST line"),
            }
        }

        debug!(dir = %remote_dir, lines = lines.len(), entries = entries.len(), "Listed directory");
        Ok(entries)
    }

    async fn retrieve(&mut self, remote_path: &str) -> Result<Vec<u8>> {
        let path = remote_path.to_string();
        self.run(remote_path.to_string(), move |stream| {
            stream.retr_as_buffer(&path).map(|cursor| cursor.into_inner())
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || stream.quit())
            .await?
            .map_err(|e| CollectorError::transfer(&self.addr, e))
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        debug!(addr = %self.addr, "Quitting FTP session on drop");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || quit_stream(stream));
            },
            Err(_) => quit_stream(stream),
        }
    }
}

fn quit_stream(mut stream: FtpStream) {
    if let Err(e) = stream.quit() {
        warn!("Failed to quit FTP session gracefully: {}", e);
    }
}

/// Listing and download of report files, with exclusion applied
pub struct FileSource {
    transport: Arc<dyn Transport>,
    filter: ExclusionFilter,
}

impl FileSource {
    pub fn new(transport: Arc<dyn Transport>, filter: ExclusionFilter) -> Self {
        Self { transport, filter }
    }

    pub fn filter_mut(&mut self) -> &mut ExclusionFilter {
        &mut self.filter
    }

    pub async fn connect(
        &self,
        credentials: &Credentials,
    ) -> std::result::Result<Box<dyn TransportSession>, ConnectionError> {
        self.transport.connect(credentials).await
    }

    /// Regular `.csv` files in `remote_dir` that pass the exclusion filter
    pub async fn list(
        &mut self,
        session: &mut dyn TransportSession,
        remote_dir: &str,
    ) -> Result<Vec<RemoteFileRef>> {
        let entries = session.list(remote_dir).await?;
        let mut files = Vec::new();

        for entry in entries {
            if entry.kind != EntryKind::File {
                continue;
            }
            // Some servers answer LIST <dir> with full paths
            let name = entry.name.rsplit('/').next().unwrap_or(&entry.name);
            if !name.to_lowercase().ends_with(".csv") {
                continue;
            }
            if self.filter.is_excluded(name) {
                debug!(file = %name, "Excluded by filename");
                continue;
            }
            files.push(RemoteFileRef {
                name: name.to_string(),
                size: entry.size.unwrap_or(0),
                modified: entry.modified,
                hash: entry.hash,
            });
        }

        Ok(files)
    }

    /// Fetch `name` from `remote_dir` into `local_dir`, returning the local path
    pub async fn download(
        &self,
        session: &mut dyn TransportSession,
        remote_dir: &str,
        name: &str,
        local_dir: &Path,
    ) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(CollectorError::transfer(name, "refusing unsafe file name"));
        }

        let remote_path = join_remote(remote_dir, name);
        let data = session.retrieve(&remote_path).await?;

        tokio::fs::create_dir_all(local_dir).await?;
        let local_path = local_dir.join(name);
        tokio::fs::write(&local_path, &data).await?;

        info!(file = %name, bytes = data.len(), path = %local_path.display(), "Downloaded report");
        Ok(local_path)
    }

    /// Release the session; failures are logged, never raised
    pub async fn close(&self, mut session: Box<dyn TransportSession>) {
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close controller session");
        }
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
