//! Tails the notes file: reads records appended since the last consumed byte
//! and fans the parsed notes out to subscribers of each note's user.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use livefeed_protocol::{NOTE_QUEUE_CAPACITY, Note, ServiceStatus, UserId};

use crate::broker::{FeedBroker, Subscription};
use crate::error::LiveFeedError;

const FIELDS_PER_RECORD: usize = 4;
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TailConfig {
    pub path: PathBuf,
    pub tick: Duration,
    /// Extra sleep after a failed tick, on top of the tick interval.
    pub error_backoff: Duration,
}

impl TailConfig {
    pub fn new(path: impl Into<PathBuf>, tick: Duration) -> Self {
        Self {
            path: path.into(),
            tick,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

/// Notes read in one pass plus the offset just past the last consumed record.
#[derive(Debug)]
struct TailRead {
    notes: Vec<Note>,
    offset: u64,
    error: Option<LiveFeedError>,
}

pub struct FileTailSource {
    config: TailConfig,
    offset: Mutex<u64>,
    broker: Arc<FeedBroker<Note>>,
    status_tx: watch::Sender<ServiceStatus>,
}

impl FileTailSource {
    pub fn new(config: TailConfig) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ServiceStatus::default());
        Arc::new(Self {
            config,
            offset: Mutex::new(0),
            broker: FeedBroker::new("notes", NOTE_QUEUE_CAPACITY),
            status_tx,
        })
    }

    pub fn subscribe(&self, user_id: UserId) -> Subscription<Note> {
        self.broker.subscribe(user_id)
    }

    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        self.broker.subscriber_count(user_id)
    }

    pub fn status(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }

    pub fn current_status(&self) -> ServiceStatus {
        self.status_tx.borrow().clone()
    }

    pub async fn offset(&self) -> u64 {
        *self.offset.lock().await
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Run one tick: read, publish, and advance the offset past every
    /// consumed record. Returns the number of notes parsed.
    pub async fn poll_once(&self) -> Result<usize, LiveFeedError> {
        let mut offset = self.offset.lock().await;
        let path = self.config.path.clone();
        let start = *offset;
        let read = tokio::task::spawn_blocking(move || read_records(&path, start))
            .await
            .map_err(|e| LiveFeedError::Io(std::io::Error::other(e)))?;

        *offset = read.offset;
        let count = read.notes.len();
        for note in read.notes {
            let user_id = note.user_id;
            self.broker.publish(user_id, note);
        }
        match read.error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Tick until `cancel` fires, reporting each tick's outcome on the status
    /// channel. A failed tick backs off before the next one. On exit every
    /// subscriber sees the end of the feed.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(path = %self.config.path.display(), tick_ms = self.config.tick.as_millis() as u64, "file tail started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(count) => {
                    if count > 0 {
                        debug!(count, "file tail read notes");
                    }
                    self.status_tx.send_replace(ServiceStatus::healthy());
                }
                Err(err) => {
                    warn!(path = %self.config.path.display(), error = %err, "file tail tick failed");
                    self.status_tx.send_replace(ServiceStatus::unhealthy(&err));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        self.broker.close();
        info!(path = %self.config.path.display(), "file tail stopped");
    }
}

fn read_records(path: &Path, start: u64) -> TailRead {
    let mut read = TailRead {
        notes: Vec::new(),
        offset: start,
        error: None,
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            read.error = Some(err.into());
            return read;
        }
    };
    let len = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(err) => {
            read.error = Some(err.into());
            return read;
        }
    };
    if len < start {
        warn!(path = %path.display(), offset = start, len, "file shrank, reading from the start");
        read.offset = 0;
    }

    let mut reader = BufReader::with_capacity(32 * 1024, file);
    if let Err(err) = reader.seek(SeekFrom::Start(read.offset)) {
        read.error = Some(err.into());
        return read;
    }

    let mut record = Vec::new();
    loop {
        record.clear();
        // A newline inside a quoted field does not end the record.
        let mut complete = false;
        loop {
            let n = match reader.read_until(b'\n', &mut record) {
                Ok(n) => n,
                Err(err) => {
                    read.error = Some(err.into());
                    return read;
                }
            };
            // EOF, or a torn record still being written.
            if n == 0 || record.last() != Some(&b'\n') {
                break;
            }
            if !quote_open(&record) {
                complete = true;
                break;
            }
        }
        if !complete {
            break;
        }

        let consumed = record.len() as u64;
        let text = String::from_utf8_lossy(&record);
        let text = text.trim_end_matches(['\n', '\r']);
        if text.is_empty() {
            read.offset += consumed;
            continue;
        }

        let fields = split_record(text);
        if fields.len() != FIELDS_PER_RECORD {
            read.error = Some(LiveFeedError::MalformedRecord {
                offset: read.offset,
                fields: fields.len(),
            });
            break;
        }

        if let Some(note) = parse_note(&fields) {
            read.notes.push(note);
        } else {
            debug!(offset = read.offset, "skipping record with non-numeric fields");
        }
        read.offset += consumed;
    }

    read
}

/// Whether `record` ends inside a quoted field. Uses the same quoting rules
/// as [`split_record`].
fn quote_open(record: &[u8]) -> bool {
    let mut in_quotes = false;
    let mut field_empty = true;
    let mut bytes = record.iter().peekable();
    while let Some(&b) = bytes.next() {
        match b {
            b'"' if in_quotes => {
                if bytes.peek() == Some(&&b'"') {
                    bytes.next();
                    field_empty = false;
                } else {
                    in_quotes = false;
                }
            }
            b'"' if field_empty => in_quotes = true,
            b',' | b'\n' if !in_quotes => field_empty = true,
            _ => field_empty = false,
        }
    }
    in_quotes
}

fn parse_note(fields: &[String]) -> Option<Note> {
    let timestamp = fields[0].parse::<i64>().ok()?;
    let user_id = fields[1].parse::<UserId>().ok()?;
    Some(Note {
        timestamp,
        user_id,
        note: fields[2].clone(),
    })
}

/// Split one CSV record. Quoted fields may contain commas and newlines, and
/// `""` inside quotes is a literal quote.
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::with_capacity(FIELDS_PER_RECORD);
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn source_for(path: &Path) -> Arc<FileTailSource> {
        FileTailSource::new(TailConfig::new(path, Duration::from_millis(10)))
    }

    fn append(path: &Path, data: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn drain(sub: &mut Subscription<Note>) -> Vec<Note> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[tokio::test]
    async fn torn_line_is_left_for_the_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        let complete = "1,5,first,\n2,5,second,\n3,5,third,\n";
        append(&path, complete);
        append(&path, "4,5,fou");

        let source = source_for(&path);
        let mut sub = source.subscribe(5);

        assert_eq!(source.poll_once().await.unwrap(), 3);
        assert_eq!(drain(&mut sub).len(), 3);
        assert_eq!(source.offset().await, complete.len() as u64);

        append(&path, "rth,\n5,5,fifth,\n");
        assert_eq!(source.poll_once().await.unwrap(), 2);
        let notes = drain(&mut sub);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].note, "fourth");
        assert_eq!(notes[1].note, "fifth");
    }

    #[tokio::test]
    async fn malformed_record_halts_tick_without_advancing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        let good = "1,5,ok,\n";
        append(&path, good);
        append(&path, "2,5,too,many,fields\n3,5,after,\n");

        let source = source_for(&path);
        let mut sub = source.subscribe(5);

        let err = source.poll_once().await.unwrap_err();
        assert!(matches!(
            err,
            LiveFeedError::MalformedRecord { offset, fields: 5 } if offset == good.len() as u64
        ));
        assert_eq!(drain(&mut sub).len(), 1);
        assert_eq!(source.offset().await, good.len() as u64);

        assert!(source.poll_once().await.is_err());
        assert_eq!(source.offset().await, good.len() as u64);
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn non_numeric_records_are_skipped_and_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        let data = "timestamp,user_id,note,\nabc,5,bad ts,\n1000,5,did laundry,x\n";
        append(&path, data);

        let source = source_for(&path);
        let mut sub = source.subscribe(5);

        assert_eq!(source.poll_once().await.unwrap(), 1);
        assert_eq!(source.offset().await, data.len() as u64);
        let notes = drain(&mut sub);
        assert_eq!(
            notes,
            vec![Note {
                timestamp: 1000,
                user_id: 5,
                note: "did laundry".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn notes_only_reach_their_users_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        append(&path, "1,5,for five,\n2,6,for six,\n3,7,for nobody,\n");

        let source = source_for(&path);
        let mut five = source.subscribe(5);
        let mut six = source.subscribe(6);

        assert_eq!(source.poll_once().await.unwrap(), 3);
        assert_eq!(drain(&mut five)[0].note, "for five");
        assert_eq!(drain(&mut six)[0].note, "for six");
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_for(&dir.path().join("absent.csv"));
        assert!(matches!(
            source.poll_once().await,
            Err(LiveFeedError::Io(_))
        ));
        assert_eq!(source.offset().await, 0);
    }

    #[tokio::test]
    async fn run_reports_unhealthy_then_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_for(&dir.path().join("absent.csv"));
        let mut status = source.status();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&source).run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(2), status.changed())
            .await
            .expect("status within timeout")
            .expect("sender alive");
        let latest = status.borrow().clone();
        assert!(!latest.is_healthy);
        assert!(latest.error.is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run exits after cancel")
            .expect("join");
    }

    #[test]
    fn split_record_handles_quotes() {
        assert_eq!(split_record("1,2,plain,"), ["1", "2", "plain", ""]);
        assert_eq!(
            split_record(r#"1,2,"has, comma","x""y""#),
            ["1", "2", "has, comma", "x\"y"]
        );
    }

    #[tokio::test]
    async fn crlf_line_endings_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        append(&path, "1,5,windows,\r\n");

        let source = source_for(&path);
        let mut sub = source.subscribe(5);
        assert_eq!(source.poll_once().await.unwrap(), 1);
        assert_eq!(drain(&mut sub)[0].note, "windows");
    }

    #[tokio::test]
    async fn quoted_field_may_span_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        let data = "1,5,\"line one\nline two\",\n2,5,after,\n";
        append(&path, data);

        let source = source_for(&path);
        let mut sub = source.subscribe(5);
        assert_eq!(source.poll_once().await.unwrap(), 2);
        assert_eq!(source.offset().await, data.len() as u64);
        let notes = drain(&mut sub);
        assert_eq!(notes[0].note, "line one\nline two");
        assert_eq!(notes[1].note, "after");
    }

    #[tokio::test]
    async fn open_quote_at_eof_waits_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        append(&path, "1,5,\"still\n");

        let source = source_for(&path);
        let mut sub = source.subscribe(5);
        assert_eq!(source.poll_once().await.unwrap(), 0);
        assert_eq!(source.offset().await, 0);

        append(&path, "writing\",x\n");
        assert_eq!(source.poll_once().await.unwrap(), 1);
        assert_eq!(drain(&mut sub)[0].note, "still\nwriting");
    }

    #[tokio::test]
    async fn shrunk_file_is_read_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        append(&path, "1,5,old one,\n2,5,old two,\n");

        let source = source_for(&path);
        let mut sub = source.subscribe(5);
        assert_eq!(source.poll_once().await.unwrap(), 2);
        drain(&mut sub);

        let replacement = "3,5,new,\n";
        std::fs::write(&path, replacement).unwrap();
        assert_eq!(source.poll_once().await.unwrap(), 1);
        assert_eq!(source.offset().await, replacement.len() as u64);
        assert_eq!(drain(&mut sub)[0].note, "new");
    }

    #[tokio::test]
    async fn stopping_the_tail_ends_subscriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.csv");
        append(&path, "");

        let source = source_for(&path);
        let mut sub = source.subscribe(5);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&source).run(cancel.clone()));

        cancel.cancel();
        handle.await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("feed ends within timeout");
        assert!(end.is_none());
        assert_eq!(source.subscriber_count(5), 0);
    }

    #[test]
    fn quote_open_tracks_quoted_newlines() {
        assert!(!quote_open(b"1,5,plain,\n"));
        assert!(quote_open(b"1,5,\"open\n"));
        assert!(!quote_open(b"1,5,\"open\nclosed\",\n"));
        assert!(!quote_open(b"1,5,\"a \"\"quoted\"\" word\",\n"));
        assert!(!quote_open(b"1,5,mid\"field,\n"));
    }
}
