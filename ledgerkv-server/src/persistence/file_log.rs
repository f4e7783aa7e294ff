use super::log::ReplayStream;
use super::types::{Event, EventType, FileLogConfig, FsyncMode, PersistenceError, Result};
use super::writer::{AsyncWriter, EventSink};
use parking_lot::Mutex;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transaction log stored as one tab-separated line per event:
/// `sequence \t event_type \t key \t value \n`
pub struct FileTransactionLog {
    path: PathBuf,
    last_sequence: Arc<AtomicU64>,
    sink: Mutex<Option<FileSink>>,
    writer: AsyncWriter,
}

impl FileTransactionLog {
    /// Open or create the log file. Failing to create or open it is fatal.
    pub async fn open(config: &FileLogConfig, queue_capacity: usize) -> Result<Self> {
        let path = config.path.clone();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PersistenceError::Schema(format!("cannot create directory {:?}: {}", parent, e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await
            .map_err(|e| PersistenceError::Schema(format!("cannot open {:?}: {}", path, e)))?;

        let needs_terminator = Self::ends_mid_record(&path).await?;
        let last_sequence = Self::scan_for_last_sequence(&path).await?;
        let last_sequence = Arc::new(AtomicU64::new(last_sequence));

        info!(
            "Transaction log file opened at {:?}, last sequence: {} (fsync={:?})",
            path,
            last_sequence.load(Ordering::SeqCst),
            config.fsync_mode
        );

        let len = file.metadata().await?.len();
        let sink = FileSink::new(
            file,
            len,
            Arc::clone(&last_sequence),
            needs_terminator,
            config,
        );

        Ok(Self {
            path,
            last_sequence,
            sink: Mutex::new(Some(sink)),
            writer: AsyncWriter::new(queue_capacity),
        })
    }

    /// A non-empty file whose last byte is not a terminator was cut mid-append
    async fn ends_mid_record(path: &Path) -> Result<bool> {
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(len - 1)).await?;
        Ok(file.read_u8().await? != b'\n')
    }

    /// Highest leading sequence number in the file. Stops quietly at the first
    /// unreadable line; replay is what reports corruption.
    async fn scan_for_last_sequence(path: &Path) -> Result<u64> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut max_sequence = 0u64;

        while let Ok(Some(line)) = lines.next_line().await {
            match line.split('\t').next().map(str::parse::<u64>) {
                Some(Ok(sequence)) => max_sequence = max_sequence.max(sequence),
                _ => break,
            }
        }

        Ok(max_sequence)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub(crate) fn writer(&self) -> &AsyncWriter {
        &self.writer
    }

    /// Spawn the writer; sequences continue from the highest one replayed
    pub fn start(&self) -> Result<()> {
        let sink = self
            .sink
            .lock()
            .take()
            .ok_or(PersistenceError::AlreadyStarted)?;

        info!(
            "Starting file log writer at sequence {}",
            self.last_sequence() + 1
        );
        self.writer.start(sink)
    }

    /// Stream every record in file order. Reading stops at the first
    /// malformed record, which is reported as the only error.
    pub fn replay_events(&self) -> ReplayStream {
        let (events_tx, events_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);

        let path = self.path.clone();
        let last_sequence = Arc::clone(&self.last_sequence);

        tokio::spawn(async move {
            if let Err(e) = Self::read_records(&path, &last_sequence, &events_tx).await {
                drop(events_tx);
                let _ = errors_tx.send(e).await;
            }
        });

        ReplayStream::new(events_rx, errors_rx)
    }

    async fn read_records(
        path: &Path,
        last_sequence: &AtomicU64,
        events: &mpsc::Sender<Event>,
    ) -> Result<()> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut line_no = 0u64;
        let mut previous = 0u64;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let event = decode_record(&line, line_no)?;

            if event.sequence() <= previous {
                return Err(PersistenceError::OutOfSequence {
                    previous,
                    found: event.sequence(),
                });
            }
            previous = event.sequence();
            last_sequence.fetch_max(previous, Ordering::SeqCst);

            if events.send(event).await.is_err() {
                debug!("Replay consumer went away at line {}", line_no);
                return Ok(());
            }
        }

        debug!("Read {} records from {:?}", line_no, path);
        Ok(())
    }
}

/// Append target of the file sink; failed appends are undone by truncation
pub(crate) trait RecordFile: AsyncWrite + Unpin + Send + 'static {
    fn truncate_to(&mut self, len: u64) -> impl Future<Output = io::Result<()>> + Send;

    fn current_len(&mut self) -> impl Future<Output = io::Result<u64>> + Send;

    fn sync(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl RecordFile for File {
    async fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }

    async fn current_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.sync_data().await
    }
}

/// Exclusive append handle owned by the writer task.
///
/// Each record goes out in a single write followed by a flush, so nothing
/// from a failed append is left buffered for the next one.
struct FileSink<F: RecordFile = File> {
    file: F,
    /// File length after the last complete record; `None` once a rollback failed
    len: Option<u64>,
    last_sequence: Arc<AtomicU64>,
    needs_terminator: bool,
    fsync_mode: FsyncMode,
    fsync_interval: Duration,
    last_fsync: Instant,
    unsynced: bool,
}

impl<F: RecordFile> FileSink<F> {
    fn new(
        file: F,
        len: u64,
        last_sequence: Arc<AtomicU64>,
        needs_terminator: bool,
        config: &FileLogConfig,
    ) -> Self {
        Self {
            file,
            len: Some(len),
            last_sequence,
            needs_terminator,
            fsync_mode: config.fsync_mode,
            fsync_interval: Duration::from_millis(config.fsync_interval_ms),
            last_fsync: Instant::now(),
            unsynced: false,
        }
    }

    async fn write_record(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await?;

        let should_fsync = match self.fsync_mode {
            FsyncMode::Always => true,
            FsyncMode::Periodic => self.last_fsync.elapsed() >= self.fsync_interval,
            FsyncMode::Never => false,
        };
        if should_fsync {
            self.sync_now().await?;
        } else {
            self.unsynced = self.fsync_mode == FsyncMode::Periodic;
        }

        Ok(())
    }

    async fn sync_now(&mut self) -> io::Result<()> {
        self.file.sync().await?;
        self.last_fsync = Instant::now();
        self.unsynced = false;
        Ok(())
    }

    /// Cut the file back to where the failed record started
    async fn roll_back(&mut self, start: u64) {
        match self.file.truncate_to(start).await {
            Ok(()) => {
                debug!("Truncated transaction log back to {} bytes", start);
                self.len = Some(start);
            }
            Err(e) => {
                warn!("Cannot truncate partial record at byte {}: {}", start, e);
                self.len = None;
                self.needs_terminator = true;
            }
        }
    }
}

impl<F: RecordFile> EventSink for FileSink<F> {
    async fn append(&mut self, event: &Event) -> Result<u64> {
        let start = match self.len {
            Some(len) => len,
            None => self.file.current_len().await?,
        };

        let sequence = self.last_sequence.load(Ordering::SeqCst) + 1;
        let mut record = String::new();
        if self.needs_terminator {
            record.push('\n');
        }
        record.push_str(&encode_record(sequence, event));

        if let Err(e) = self.write_record(record.as_bytes()).await {
            self.roll_back(start).await;
            return Err(e.into());
        }

        self.len = Some(start + record.len() as u64);
        self.needs_terminator = false;
        self.last_sequence.store(sequence, Ordering::SeqCst);
        Ok(sequence)
    }

    async fn finish(&mut self) -> Result<()> {
        self.file.flush().await?;
        if self.fsync_mode != FsyncMode::Never {
            self.sync_now().await?;
        }
        Ok(())
    }

    fn idle_sync_due(&self) -> Option<Duration> {
        self.unsynced
            .then(|| self.fsync_interval.saturating_sub(self.last_fsync.elapsed()))
    }

    async fn sync_idle(&mut self) -> Result<()> {
        if let Err(e) = self.sync_now().await {
            // next attempt one interval from now
            self.last_fsync = Instant::now();
            return Err(e.into());
        }
        debug!("Periodic fsync of idle transaction log");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

pub(crate) fn encode_record(sequence: u64, event: &Event) -> String {
    format!(
        "{}\t{}\t{}\t{}\n",
        sequence,
        event.event_type().code(),
        escape(event.key()),
        escape(event.value())
    )
}

pub(crate) fn decode_record(line: &str, line_no: u64) -> Result<Event> {
    let malformed = |reason: String| PersistenceError::Decode {
        position: line_no,
        reason,
    };

    let fields: Vec<&str> = line.split('\t').collect();
    let &[sequence, event_type, key, value] = fields.as_slice() else {
        return Err(malformed(format!("expected 4 fields, found {}", fields.len())));
    };

    let sequence: u64 = sequence
        .parse()
        .map_err(|_| malformed(format!("invalid sequence {:?}", sequence)))?;
    let code: i64 = event_type
        .parse()
        .map_err(|_| malformed(format!("invalid event type {:?}", event_type)))?;
    let event_type = EventType::try_from(code)?;

    let key = unescape(key).map_err(|r| malformed(r.to_string()))?;
    if key.is_empty() {
        return Err(malformed("empty key".to_string()));
    }
    let value = unescape(value).map_err(|r| malformed(r.to_string()))?;

    Ok(Event::persisted(sequence, event_type, key, value))
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(field: &str) -> std::result::Result<String, &'static str> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            _ => return Err("invalid escape sequence"),
        }
    }
    Ok(out)
}
