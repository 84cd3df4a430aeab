use std::fmt;
use std::io::{self, SeekFrom};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncSeekExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loggoblin_types::{HealthEvent, RawLine, SourceHealth, SourceId};

use crate::error::ReadError;

/// Where a source reads from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    /// Tail a file, following truncation and rotation
    File(PathBuf),
    /// Read standard input
    Stdin,
    /// Run a shell command and read its stdout
    Command(String),
}

impl SourceSpec {
    /// `-` is stdin, `!cmd` or `cmd:cmd` is a command, anything else a path
    pub fn parse(s: &str) -> Self {
        if s == "-" {
            Self::Stdin
        } else if let Some(cmd) = s.strip_prefix('!').or_else(|| s.strip_prefix("cmd:")) {
            Self::Command(cmd.trim().to_string())
        } else {
            Self::File(PathBuf::from(s))
        }
    }

    /// Label used as the source tag
    pub fn tag(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Stdin => "stdin".to_string(),
            Self::Command(cmd) => cmd.clone(),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(cmd) => write!(f, "!{cmd}"),
            other => f.write_str(&other.tag()),
        }
    }
}

/// Reader tuning
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Reopen attempts before a file source gives up
    pub max_reopen_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fallback poll when no file system event arrives
    pub poll_interval_ms: u64,
    /// Start tailing files at their current end
    pub start_at_end: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_reopen_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            poll_interval_ms: 500,
            start_at_end: false,
        }
    }
}

impl ReaderConfig {
    /// Delay before reopen attempt `attempt` (1-based), doubling up to the max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Publishes health transitions of one source
#[derive(Clone)]
struct Reporter {
    id: SourceId,
    tag: Arc<str>,
    tx: Option<broadcast::Sender<HealthEvent>>,
}

impl Reporter {
    fn send(&self, health: SourceHealth) {
        if let Some(tx) = &self.tx {
            // No subscribers is fine
            let _ = tx.send(HealthEvent {
                source: self.id,
                tag: Arc::clone(&self.tag),
                health,
            });
        }
    }
}

/// Yields the lines of one input in order
///
/// Sequence numbers start at 1 and keep counting across reopen, truncation
/// and rotation of a tailed file.
pub struct SourceReader {
    reporter: Reporter,

    sequence: u64,

    input: Input,

    close: CancellationToken,

    config: ReaderConfig,
}

enum Input {
    File(Box<FileTail>),
    Stream(StreamInput),
    Done,
}

impl SourceReader {
    /// Open a source
    ///
    /// A file that does not exist at startup is an error; files that vanish
    /// later are reopened with backoff.
    pub async fn open(spec: &SourceSpec, config: ReaderConfig) -> Result<Self, ReadError> {
        let input = match spec {
            SourceSpec::File(path) => {
                let tail = FileTail::open(path, config.start_at_end)
                    .await
                    .map_err(|source| ReadError::Open {
                        path: path.clone(),
                        source,
                    })?;
                Input::File(Box::new(tail))
            }
            SourceSpec::Stdin => Input::Stream(StreamInput::new(tokio::io::stdin(), None)),
            SourceSpec::Command(cmd) => Input::Stream(spawn(cmd)?),
        };

        debug!(source = %spec, "opened source");
        Ok(Self::with_input(spec.tag(), input, config))
    }

    /// Wrap any byte stream, e.g. a socket or an in-memory pipe
    pub fn from_reader<R>(tag: impl Into<String>, reader: R, config: ReaderConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::with_input(tag.into(), Input::Stream(StreamInput::new(reader, None)), config)
    }

    fn with_input(tag: String, input: Input, config: ReaderConfig) -> Self {
        Self {
            reporter: Reporter {
                id: SourceId::next(),
                tag: Arc::from(tag),
                tx: None,
            },
            sequence: 0,
            input,
            close: CancellationToken::new(),
            config,
        }
    }

    pub fn id(&self) -> SourceId {
        self.reporter.id
    }

    pub fn tag(&self) -> &str {
        &self.reporter.tag
    }

    pub(crate) fn shared_tag(&self) -> Arc<str> {
        Arc::clone(&self.reporter.tag)
    }

    /// Route health transitions (reconnecting, connected) to a channel
    pub(crate) fn attach_health(&mut self, tx: broadcast::Sender<HealthEvent>) {
        self.reporter.tx = Some(tx);
    }

    /// Token that ends the source when cancelled
    pub fn close_handle(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Stop reading. The next `next_line` returns `Ok(None)`.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Next complete line, `Ok(None)` at end of stream or after close
    ///
    /// Cancel-safe: a partially read line stays buffered.
    pub async fn next_line(&mut self) -> Result<Option<RawLine>, ReadError> {
        if self.close.is_cancelled() {
            self.input = Input::Done;
            return Ok(None);
        }

        let close = self.close.clone();
        let next = tokio::select! {
            biased;
            _ = close.cancelled() => None,
            result = self.read_next() => result?,
        };

        let Some((byte_offset, bytes)) = next else {
            self.input = Input::Done;
            return Ok(None);
        };

        self.sequence += 1;
        Ok(Some(RawLine {
            source_id: self.reporter.id,
            source_tag: Arc::clone(&self.reporter.tag),
            sequence: self.sequence,
            byte_offset,
            text: line_text(&bytes),
            arrival_time: Utc::now(),
        }))
    }

    async fn read_next(&mut self) -> Result<Option<(u64, Vec<u8>)>, ReadError> {
        let Self {
            input,
            reporter,
            config,
            ..
        } = self;

        match input {
            Input::File(tail) => tail.next_line(config, reporter).await.map(Some),
            Input::Stream(stream) => stream.next_line(&reporter.tag).await,
            Input::Done => Ok(None),
        }
    }
}

impl fmt::Debug for SourceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceReader")
            .field("id", &self.reporter.id)
            .field("tag", &self.reporter.tag)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Strip the line terminator and decode, replacing invalid UTF-8
fn line_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

fn spawn(cmd: &str) -> Result<StreamInput, ReadError> {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c");
        c
    };

    let mut child = command
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ReadError::Spawn {
            command: cmd.to_string(),
            source,
        })?;

    let stdout = child.stdout.take().ok_or_else(|| ReadError::Spawn {
        command: cmd.to_string(),
        source: io::Error::other("stdout was not captured"),
    })?;

    Ok(StreamInput::new(stdout, Some(child)))
}

// ============================================================================
// Streams (stdin, commands, arbitrary readers)
// ============================================================================

struct StreamInput {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    pending: Vec<u8>,
    offset: u64,
    /// Killed on drop
    child: Option<Child>,
}

impl StreamInput {
    fn new<R>(reader: R, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(reader)),
            pending: Vec::new(),
            offset: 0,
            child,
        }
    }

    async fn next_line(&mut self, tag: &str) -> Result<Option<(u64, Vec<u8>)>, ReadError> {
        let n = self
            .reader
            .read_until(b'\n', &mut self.pending)
            .await
            .map_err(|source| ReadError::Io {
                tag: tag.to_string(),
                source,
            })?;

        if n == 0 && self.pending.is_empty() {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    debug!(source = tag, %status, "command exited");
                }
            }
            return Ok(None);
        }

        // A final line without a newline is still a line at end of stream
        let bytes = mem::take(&mut self.pending);
        let start = self.offset;
        self.offset += bytes.len() as u64;
        Ok(Some((start, bytes)))
    }
}

// ============================================================================
// File tailing
// ============================================================================

/// Identifies the file behind a path, so rotation can be told apart from
/// appends
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity(meta: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn identity(_meta: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

enum FileState {
    Unchanged,
    Truncated,
    Rotated,
    Missing(io::Error),
}

async fn file_state(path: &Path, known: Option<FileIdentity>, offset: u64) -> FileState {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) => return FileState::Missing(e),
    };

    if identity(&meta) != known {
        FileState::Rotated
    } else if meta.len() < offset {
        FileState::Truncated
    } else {
        FileState::Unchanged
    }
}

struct FileTail {
    path: PathBuf,

    reader: BufReader<File>,

    identity: Option<FileIdentity>,

    /// Bytes of the current line read so far (no newline yet)
    pending: Vec<u8>,

    /// Offset of the first byte of `pending`
    line_start: u64,

    events: mpsc::UnboundedReceiver<()>,

    /// Keeps the event channel open even without a watcher
    _events_tx: mpsc::UnboundedSender<()>,

    _watcher: Option<RecommendedWatcher>,
}

impl FileTail {
    async fn open(path: &Path, start_at_end: bool) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let meta = file.metadata().await?;
        let line_start = if start_at_end {
            file.seek(SeekFrom::End(0)).await?
        } else {
            0
        };

        let (tx, events) = mpsc::unbounded_channel();
        let watcher = watch(path, tx.clone());

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            identity: identity(&meta),
            pending: Vec::new(),
            line_start,
            events,
            _events_tx: tx,
            _watcher: watcher,
        })
    }

    /// Offset just past the last byte read
    fn offset(&self) -> u64 {
        self.line_start + self.pending.len() as u64
    }

    fn take_line(&mut self) -> (u64, Vec<u8>) {
        let bytes = mem::take(&mut self.pending);
        let start = self.line_start;
        self.line_start += bytes.len() as u64;
        (start, bytes)
    }

    async fn next_line(
        &mut self,
        config: &ReaderConfig,
        reporter: &Reporter,
    ) -> Result<(u64, Vec<u8>), ReadError> {
        loop {
            match self.reader.read_until(b'\n', &mut self.pending).await {
                Ok(_) if self.pending.ends_with(b"\n") => return Ok(self.take_line()),
                // Partial line; the next read reports EOF
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(source = %reporter.tag, error = %e, "read failed, reopening");
                    if let Some(line) = self.reopen(e, config, reporter).await? {
                        return Ok(line);
                    }
                    continue;
                }
            }

            match file_state(&self.path, self.identity, self.offset()).await {
                FileState::Unchanged => self.wait(config).await,
                FileState::Truncated => {
                    info!(source = %reporter.tag, "file truncated, reading from start");
                    self.pending.clear();
                    self.line_start = 0;
                    if let Err(e) = self.reader.seek(SeekFrom::Start(0)).await {
                        if let Some(line) = self.reopen(e, config, reporter).await? {
                            return Ok(line);
                        }
                    }
                }
                FileState::Rotated => {
                    // Lines written to the old file after the last read come first
                    if let Some(line) = self.drain_old().await {
                        return Ok(line);
                    }

                    info!(source = %reporter.tag, "file rotated, following new file");
                    let flushed = (!self.pending.is_empty()).then(|| self.take_line());
                    if let Err(e) = self.switch(None).await {
                        if let Some(line) = self.reopen(e, config, reporter).await? {
                            return Ok(line);
                        }
                    }
                    if let Some(line) = flushed {
                        return Ok(line);
                    }
                }
                FileState::Missing(e) => {
                    if let Some(line) = self.drain_old().await {
                        return Ok(line);
                    }
                    if let Some(line) = self.reopen(e, config, reporter).await? {
                        return Ok(line);
                    }
                }
            }
        }
    }

    /// Next complete line still readable from the current handle
    ///
    /// Returns `None` at end of file, leaving any partial line in `pending`.
    async fn drain_old(&mut self) -> Option<(u64, Vec<u8>)> {
        loop {
            match self.reader.read_until(b'\n', &mut self.pending).await {
                Ok(_) if self.pending.ends_with(b"\n") => return Some(self.take_line()),
                Ok(n) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    /// Wait for a file system event or the poll interval
    async fn wait(&mut self, config: &ReaderConfig) {
        tokio::select! {
            _ = self.events.recv() => {}
            _ = tokio::time::sleep(config.poll_interval()) => {}
        }
        // Coalesce bursts
        while self.events.try_recv().is_ok() {}
    }

    /// Open the path again
    ///
    /// The same file resumes at the start of the pending line; a different
    /// file is read from the beginning. `resume_identity` of `None` means the
    /// current identity.
    async fn switch(&mut self, resume_identity: Option<FileIdentity>) -> io::Result<()> {
        let mut file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        let new_identity = identity(&meta);
        let same_file = new_identity == resume_identity.or(self.identity);

        if same_file && meta.len() >= self.line_start {
            file.seek(SeekFrom::Start(self.line_start)).await?;
        } else {
            self.line_start = 0;
        }
        self.pending.clear();
        self.reader = BufReader::new(file);
        self.identity = new_identity;
        Ok(())
    }

    /// Reopen with bounded exponential backoff
    ///
    /// Returns a flushed partial line when the path now names a different file.
    async fn reopen(
        &mut self,
        cause: io::Error,
        config: &ReaderConfig,
        reporter: &Reporter,
    ) -> Result<Option<(u64, Vec<u8>)>, ReadError> {
        let old_identity = self.identity;
        let mut last_error = cause;

        for attempt in 1..=config.max_reopen_attempts {
            reporter.send(SourceHealth::Reconnecting { attempt });
            tokio::time::sleep(config.backoff(attempt)).await;

            let exists = tokio::fs::metadata(&self.path).await;
            let rotated = matches!(&exists, Ok(meta) if identity(meta) != old_identity);
            let flushed = (rotated && !self.pending.is_empty()).then(|| self.take_line());

            match self.switch(old_identity).await {
                Ok(()) => {
                    info!(source = %reporter.tag, attempt, "reopened");
                    reporter.send(SourceHealth::Connected);
                    return Ok(flushed);
                }
                Err(e) => {
                    debug!(source = %reporter.tag, attempt, error = %e, "reopen failed");
                    if let Some((start, bytes)) = flushed {
                        // Not switched after all, keep the partial line
                        self.line_start = start;
                        self.pending = bytes;
                    }
                    last_error = e;
                }
            }
        }

        Err(ReadError::Exhausted {
            tag: reporter.tag.to_string(),
            attempts: config.max_reopen_attempts,
            source: last_error,
        })
    }
}

/// Watch the directory holding `path` so renames and re-creation are seen
fn watch(path: &Path, tx: mpsc::UnboundedSender<()>) -> Option<RecommendedWatcher> {
    let name = path.file_name()?.to_os_string();
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let handler = move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str())) {
                let _ = tx.send(());
            }
        }
    };

    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(watcher) => watcher,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "file watcher unavailable, polling");
            return None;
        }
    };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        debug!(path = %dir.display(), error = %e, "cannot watch directory, polling");
        return None;
    }
    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    fn fast() -> ReaderConfig {
        ReaderConfig {
            max_reopen_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            poll_interval_ms: 20,
            start_at_end: false,
        }
    }

    async fn next_text(reader: &mut SourceReader) -> String {
        timeout(Duration::from_secs(5), reader.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("source ended")
            .text
    }

    fn append(path: &Path, data: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_parse_spec() {
        assert_eq!(SourceSpec::parse("-"), SourceSpec::Stdin);
        assert_eq!(
            SourceSpec::parse("!kubectl logs -f x"),
            SourceSpec::Command("kubectl logs -f x".to_string())
        );
        assert_eq!(
            SourceSpec::parse("cmd:journalctl -f"),
            SourceSpec::Command("journalctl -f".to_string())
        );
        assert_eq!(
            SourceSpec::parse("/var/log/app.log"),
            SourceSpec::File(PathBuf::from("/var/log/app.log"))
        );
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = ReaderConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(5), Duration::from_millis(1_600));
        assert_eq!(config.backoff(6), Duration::from_millis(2_000));
        assert_eq!(config.backoff(60), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_reads_lines_with_sequence_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "first\r\nsecond\n");

        let mut reader = SourceReader::open(&SourceSpec::File(path.clone()), fast())
            .await
            .unwrap();

        let a = reader.next_line().await.unwrap().unwrap();
        let b = reader.next_line().await.unwrap().unwrap();
        assert_eq!((a.text.as_str(), a.sequence, a.byte_offset), ("first", 1, 0));
        assert_eq!((b.text.as_str(), b.sequence, b.byte_offset), ("second", 2, 7));
        assert_eq!(&*a.source_tag, path.display().to_string());
    }

    #[tokio::test]
    async fn test_partial_line_is_held_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "hel");

        let mut reader = SourceReader::open(&SourceSpec::File(path.clone()), fast())
            .await
            .unwrap();

        let early = timeout(Duration::from_millis(100), reader.next_line()).await;
        assert!(early.is_err(), "partial line must not be delivered");

        append(&path, "lo world\n");
        assert_eq!(next_text(&mut reader).await, "hello world");
    }

    #[tokio::test]
    async fn test_truncation_restarts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "one long line\ntwo long line\n");

        let mut reader = SourceReader::open(&SourceSpec::File(path.clone()), fast())
            .await
            .unwrap();
        assert_eq!(next_text(&mut reader).await, "one long line");
        assert_eq!(next_text(&mut reader).await, "two long line");

        std::fs::write(&path, "").unwrap();
        append(&path, "three\n");

        let line = timeout(Duration::from_secs(5), reader.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line.text, "three");
        assert_eq!(line.byte_offset, 0);
        assert_eq!(line.sequence, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_has_no_duplicates_or_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a1\na2\n");

        let mut reader = SourceReader::open(&SourceSpec::File(path.clone()), fast())
            .await
            .unwrap();
        assert_eq!(next_text(&mut reader).await, "a1");

        // Written to the old file, then rotated away
        append(&path, "a3\npartial");
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "b1\nb2\n");

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(next_text(&mut reader).await);
        }
        assert_eq!(seen, vec!["a2", "a3", "partial", "b1", "b2"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotated_file_drains_one_line_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a1\n");

        let reporter = Reporter {
            id: SourceId::next(),
            tag: Arc::from("app.log"),
            tx: None,
        };
        let mut tail = FileTail::open(&path, false).await.unwrap();
        let (_, first) = tail.next_line(&fast(), &reporter).await.unwrap();
        assert_eq!(first, b"a1\n");

        // Appended after the reader hit end of file, then rotated away
        append(&path, "x1a\nx1b\ntail");
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "b1\n");

        assert_eq!(tail.drain_old().await, Some((3, b"x1a\n".to_vec())));
        assert_eq!(tail.drain_old().await, Some((7, b"x1b\n".to_vec())));
        assert_eq!(tail.drain_old().await, None);
        assert_eq!(tail.pending, b"tail");

        let mut rest = Vec::new();
        for _ in 0..2 {
            let (_, bytes) = timeout(Duration::from_secs(5), tail.next_line(&fast(), &reporter))
                .await
                .unwrap()
                .unwrap();
            rest.push(line_text(&bytes));
        }
        assert_eq!(rest, vec!["tail", "b1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rotation_burst_keeps_lines_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = SourceReader::open(&SourceSpec::File(path.clone()), fast())
            .await
            .unwrap();

        for round in 0..20 {
            append(&path, &format!("x{round}a\nx{round}b\n"));
            std::fs::rename(&path, dir.path().join(format!("app.log.{round}"))).unwrap();
            append(&path, "");

            assert_eq!(next_text(&mut reader).await, format!("x{round}a"));
            assert_eq!(next_text(&mut reader).await, format!("x{round}b"));
        }
    }

    #[tokio::test]
    async fn test_start_at_end_skips_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "old\n");

        let config = ReaderConfig {
            start_at_end: true,
            ..fast()
        };
        let mut reader = SourceReader::open(&SourceSpec::File(path.clone()), config)
            .await
            .unwrap();

        append(&path, "new\n");
        let line = reader.next_line().await.unwrap().unwrap();
        assert_eq!(line.text, "new");
        assert_eq!(line.byte_offset, 4);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SourceReader::open(&SourceSpec::File(dir.path().join("nope.log")), fast()).await;
        assert!(matches!(result, Err(ReadError::Open { .. })));
    }

    #[tokio::test]
    async fn test_vanished_file_exhausts_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "only\n");

        let (tx, mut rx) = broadcast::channel(16);
        let mut reader = SourceReader::open(&SourceSpec::File(path.clone()), fast())
            .await
            .unwrap();
        reader.attach_health(tx);
        assert_eq!(next_text(&mut reader).await, "only");

        std::fs::remove_file(&path).unwrap();
        let err = timeout(Duration::from_secs(5), reader.next_line())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ReadError::Exhausted { attempts: 3, .. }));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.health, SourceHealth::Reconnecting { attempt: 1 });
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");

        let mut reader = SourceReader::open(&SourceSpec::File(path), fast())
            .await
            .unwrap();
        let close = reader.close_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            close.cancel();
        });

        let result = timeout(Duration::from_secs(5), reader.next_line()).await.unwrap();
        assert!(result.unwrap().is_none());
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_reader_flushes_final_line() {
        let data: &[u8] = b"x\ny\nlast";
        let mut reader = SourceReader::from_reader("mem", data, fast());

        assert_eq!(next_text(&mut reader).await, "x");
        assert_eq!(next_text(&mut reader).await, "y");
        let last = reader.next_line().await.unwrap().unwrap();
        assert_eq!((last.text.as_str(), last.byte_offset), ("last", 4));
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let data: &[u8] = b"ok \xff\n";
        let mut reader = SourceReader::from_reader("mem", data, fast());
        assert_eq!(next_text(&mut reader).await, "ok \u{fffd}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_source() {
        let spec = SourceSpec::parse("!printf 'one\\ntwo\\n'");
        let mut reader = SourceReader::open(&spec, fast()).await.unwrap();

        assert_eq!(next_text(&mut reader).await, "one");
        assert_eq!(next_text(&mut reader).await, "two");
        let end = timeout(Duration::from_secs(5), reader.next_line()).await.unwrap();
        assert!(end.unwrap().is_none());
    }
}
