use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;

const WRITER_QUEUE_DEPTH: usize = 4096;
/// Larger length prefixes can only come from a corrupt tail.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event as `[u32 len][bincode payload][u32 crc32]`.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one record. `Ok(None)` means end of log, a torn tail, an oversized
/// length prefix, or a record that fails its checksum; replay stops there.
fn decode_record(reader: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    if !read_full(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload).ok())
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only write-ahead log of ledger events.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    unsynced: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            unsynced: 0,
            appends_since_compact: 0,
        })
    }

    /// Buffer an event without syncing. Follow with `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.unsynced += 1;
        encode_record(&mut self.writer, event)
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.sync_all()?;
        self.synced_len = file.metadata()?.len();
        self.appends_since_compact += self.unsynced;
        self.unsynced = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful `flush_sync`,
    /// both the bytes still buffered and any that already reached the file.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let failed = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop
        drop(failed.into_parts());
        self.unsynced = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events`: write a temp file, fsync, rename over.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_record(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.unsynced = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// All intact events in the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = decode_record(&mut reader)? {
            events.push(event);
        }
        Ok(events)
    }
}

// ── Group-commit writer ──────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        done: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        done: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        done: oneshot::Sender<u64>,
    },
}

/// Cloneable handle to the background task that owns the `Wal`.
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

impl WalHandle {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Durably append one event. Resolves after the batch it joined is fsynced.
    pub async fn append(&self, event: Event) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(WalCommand::Append { event, done }).await?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn rewrite(&self, events: Vec<Event>) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(WalCommand::Rewrite { events, done }).await?;
        rx.await.map_err(|_| writer_gone())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (done, rx) = oneshot::channel();
        if self.send(WalCommand::AppendsSinceCompact { done }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn send(&self, cmd: WalCommand) -> io::Result<()> {
        self.tx.send(cmd).await.map_err(|_| writer_gone())
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down")
}

/// Block for the first command; if it is an append, drain every append that
/// is already queued and commit them with a single fsync.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, done) = match cmd {
            WalCommand::Append { event, done } => (event, done),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, done)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, done } => batch.push((event, done)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch must leave nothing behind for the next one to persist.
    let result = match written {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(undo) = wal.discard_unsynced() {
                tracing::error!("WAL rollback after failed batch failed: {undo}");
            }
            Err((e.kind(), e.to_string()))
        }
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, done) in batch {
        let _ = done.send(
            result
                .clone()
                .map_err(|(kind, msg)| io::Error::new(kind, msg)),
        );
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, done } => {
            let _ = done.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { done } => {
            let _ = done.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, done } => commit_batch(wal, vec![(event, done)]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("evshare_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn admitted(vehicle_id: Ulid) -> Event {
        Event::BookingAdmitted {
            booking: Booking {
                id: Ulid::new(),
                vehicle_id,
                user_id: "alice".into(),
                span: Span::new(1_000, 2_000),
                status: BookingStatus::Approved,
                priority_score: 0.5,
                estimated_usage_km: Some(42.0),
                created_at: 500,
            },
            displaced: vec![],
        }
    }

    fn write_all(path: &Path, events: &[Event]) {
        let mut wal = Wal::open(path).unwrap();
        for e in events {
            wal.append_buffered(e).unwrap();
        }
        wal.flush_sync().unwrap();
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let vid = Ulid::new();
        let events = vec![
            Event::VehicleRegistered { id: vid, name: Some("Leaf".into()) },
            admitted(vid),
        ];
        write_all(&path, &events);

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = Event::VehicleRegistered { id: Ulid::new(), name: None };
        write_all(&path, std::slice::from_ref(&event));

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7u8; 6]).unwrap();
        drop(f);

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let path = tmp_path("bad_crc.wal");
        let payload = bincode::serialize(&Event::VehicleRemoved { id: Ulid::new() }).unwrap();
        let mut f = File::create(&path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&payload).unwrap();
        f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        drop(f);

        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn rewrite_shrinks_and_accepts_appends() {
        let path = tmp_path("rewrite.wal");
        let vid = Ulid::new();
        let registered = Event::VehicleRegistered { id: vid, name: None };
        let mut churn = vec![registered.clone()];
        for _ in 0..10 {
            churn.push(admitted(vid));
        }
        write_all(&path, &churn);
        let before = fs::metadata(&path).unwrap().len();

        let mut wal = Wal::open(&path).unwrap();
        wal.rewrite(std::slice::from_ref(&registered)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        let after_event = admitted(vid);
        wal.append_buffered(&after_event).unwrap();
        wal.flush_sync().unwrap();
        drop(wal);

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "rewritten WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![registered, after_event]);
    }

    #[test]
    fn replay_rejects_oversized_length_prefix() {
        let path = tmp_path("oversized.wal");
        let event = Event::VehicleRegistered { id: Ulid::new(), name: None };
        write_all(&path, std::slice::from_ref(&event));

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        drop(f);

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn discard_unsynced_drops_buffered_and_written_bytes() {
        let path = tmp_path("discard_unsynced.wal");
        let vid = Ulid::new();
        let kept = Event::VehicleRegistered { id: vid, name: None };
        let mut wal = Wal::open(&path).unwrap();
        wal.append_buffered(&kept).unwrap();
        wal.flush_sync().unwrap();

        // Reached the file but was never acknowledged
        wal.append_buffered(&admitted(vid)).unwrap();
        wal.writer.flush().unwrap();
        wal.discard_unsynced().unwrap();

        // Still sitting in the buffer
        wal.append_buffered(&admitted(vid)).unwrap();
        wal.discard_unsynced().unwrap();

        let next = admitted(vid);
        wal.append_buffered(&next).unwrap();
        wal.flush_sync().unwrap();
        assert_eq!(wal.appends_since_compact(), 2);
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);
    }

    #[tokio::test]
    async fn handle_batches_concurrent_appends() {
        let path = tmp_path("handle_batches.wal");
        let handle = WalHandle::spawn(Wal::open(&path).unwrap());
        let vid = Ulid::new();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let h = handle.clone();
            let event = admitted(vid);
            tasks.push(tokio::spawn(async move { h.append(event).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(handle.appends_since_compact().await, 32);
        assert_eq!(Wal::replay(&path).unwrap().len(), 32);
    }
}
