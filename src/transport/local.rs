//! Directory-backed transport
//!
//! Layout under the group root:
//!
//! ```text
//! <root>/<topic>/topic.yaml      manifest (name + policy), created atomically
//! <root>/<topic>/partition-0.log framed records, append-only
//! ```
//!
//! A frame is `[meta_len: u32 LE][data_len: u32 LE][metadata][data]`. An event
//! id is the byte offset of its frame. Producers append whole batches with a
//! single write on an `O_APPEND` handle; consumers poll the file and stop at
//! the first incomplete frame.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use super::batch::{BatchingProducer, PartitionLog, Record};
use super::{
    materialize, Consumer, ConsumerOptions, DataBroker, DataSelector, EventId, Producer,
    ProducerOptions, PullFuture, ReceivedEvent, StartPosition, Topic, TopicPolicy, Transport,
};
use crate::error::{Result, TelemetryError};
use crate::topic::validate_name;

const MANIFEST: &str = "topic.yaml";
const PARTITION: &str = "partition-0.log";
const HEADER_LEN: u64 = 8;
/// Frames larger than this are treated as corruption
const MAX_FRAME_PART: u32 = 64 * 1024 * 1024;

// ============================================================================
// GROUP DESCRIPTOR
// ============================================================================

/// Membership descriptor shared by every process of one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub group: String,
    /// Directory holding the topics; relative paths resolve against the
    /// descriptor file's directory
    pub root: PathBuf,
}

impl GroupDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path).map_err(|e| TelemetryError::GroupDescriptor {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
        let mut descriptor: GroupDescriptor =
            serde_yaml::from_str(&yaml).map_err(|e| TelemetryError::GroupDescriptor {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;

        if descriptor.root.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            descriptor.root = base.join(&descriptor.root);
        }
        Ok(descriptor)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    name: String,
    policy: TopicPolicy,
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct LocalTransport {
    group: String,
    root: PathBuf,
    poll: Duration,
}

impl LocalTransport {
    pub fn open(group: &GroupDescriptor, poll: Duration) -> Result<Self> {
        fs::create_dir_all(&group.root)?;
        Ok(Self {
            group: group.group.clone(),
            root: group.root.clone(),
            poll,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    fn topic_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl Transport for LocalTransport {
    fn protocol(&self) -> &str {
        "local"
    }

    fn create_topic(&self, name: &str, policy: &TopicPolicy) -> Result<()> {
        let dir = self.topic_dir(name)?;
        fs::create_dir_all(&dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(PARTITION))?;

        // Write the manifest aside, then link it into place: the link either
        // publishes a complete manifest or fails because one exists.
        let manifest = serde_yaml::to_string(&Manifest {
            name: name.to_string(),
            policy: *policy,
        })?;
        // Staging file is unique per call; it is removed when dropped
        let mut staging = NamedTempFile::new_in(&dir)?;
        staging.write_all(manifest.as_bytes())?;
        staging.as_file().sync_all()?;
        let linked = fs::hard_link(staging.path(), dir.join(MANIFEST));

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(TelemetryError::TopicAlreadyExists {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open_topic(&self, name: &str) -> Result<Arc<dyn Topic>> {
        let dir = self.topic_dir(name)?;
        let yaml = match fs::read_to_string(dir.join(MANIFEST)) {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TelemetryError::TopicNotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let manifest: Manifest = serde_yaml::from_str(&yaml)?;

        Ok(Arc::new(LocalTopic {
            name: manifest.name,
            policy: manifest.policy,
            partition: dir.join(PARTITION),
            poll: self.poll,
        }))
    }
}

// ============================================================================
// TOPIC
// ============================================================================

struct LocalTopic {
    name: String,
    policy: TopicPolicy,
    partition: PathBuf,
    poll: Duration,
}

impl Topic for LocalTopic {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &TopicPolicy {
        &self.policy
    }

    fn producer(&self, options: ProducerOptions) -> Result<Box<dyn Producer>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.partition)?;
        let log = Arc::new(FileLog {
            file: Mutex::new(file),
        });
        Ok(Box::new(BatchingProducer::new(
            &self.name,
            self.policy,
            options,
            log,
        )))
    }

    fn consumer(
        &self,
        options: ConsumerOptions,
        selector: Box<dyn DataSelector>,
        broker: Box<dyn DataBroker>,
    ) -> Result<Box<dyn Consumer>> {
        let file = File::open(&self.partition)?;
        let start = options.start;
        let mut consumer = LocalConsumer {
            options,
            file,
            cursor: 0,
            prefetched: VecDeque::new(),
            selector,
            broker,
            poll: self.poll,
        };
        if start == StartPosition::End {
            consumer.skip_complete_frames()?;
            debug!(consumer = %consumer.options.name, offset = consumer.cursor, "starting at end of partition");
        }
        Ok(Box::new(consumer))
    }
}

struct FileLog {
    file: Mutex<File>,
}

fn frame_len(record: &Record) -> Result<(u32, u32)> {
    let meta = u32::try_from(record.metadata.len()).ok();
    let data = u32::try_from(record.data.len()).ok();
    match (meta, data) {
        (Some(m), Some(d)) if m <= MAX_FRAME_PART && d <= MAX_FRAME_PART => Ok((m, d)),
        _ => Err(TelemetryError::transport("record exceeds frame size limit")),
    }
}

impl PartitionLog for FileLog {
    fn append(&self, records: &[Record]) -> Result<Vec<EventId>> {
        let mut buffer = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            let (meta_len, data_len) = frame_len(record)?;
            offsets.push(buffer.len() as u64);
            buffer.extend_from_slice(&meta_len.to_le_bytes());
            buffer.extend_from_slice(&data_len.to_le_bytes());
            buffer.extend_from_slice(&record.metadata);
            buffer.extend_from_slice(&record.data);
        }

        let mut file = self.file.lock();
        file.write_all(&buffer)?;
        file.flush()?;
        let end = file.stream_position()?;
        let start = end.saturating_sub(buffer.len() as u64);
        Ok(offsets.into_iter().map(|o| start + o).collect())
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

struct LocalConsumer {
    options: ConsumerOptions,
    file: File,
    /// Byte offset of the next unread frame
    cursor: u64,
    prefetched: VecDeque<(EventId, Record)>,
    selector: Box<dyn DataSelector>,
    broker: Box<dyn DataBroker>,
    poll: Duration,
}

/// `Ok(None)` when the file ends before the buffer is full
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<Option<()>> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(Some(())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

impl LocalConsumer {
    /// Read up to `batch_size` complete frames starting at the cursor
    fn read_frames(&mut self) -> Result<Vec<(EventId, Record)>> {
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(self.cursor))?;

        let mut frames = Vec::new();
        let mut offset = self.cursor;
        while frames.len() < self.options.batch_size {
            let mut header = [0u8; HEADER_LEN as usize];
            if read_or_eof(&mut reader, &mut header)?.is_none() {
                break;
            }
            let meta_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let data_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if meta_len > MAX_FRAME_PART || data_len > MAX_FRAME_PART {
                return Err(TelemetryError::transport(format!(
                    "corrupt frame header at offset {}",
                    offset
                )));
            }

            let mut metadata = vec![0u8; meta_len as usize];
            let mut data = vec![0u8; data_len as usize];
            if read_or_eof(&mut reader, &mut metadata)?.is_none()
                || read_or_eof(&mut reader, &mut data)?.is_none()
            {
                break;
            }

            frames.push((
                offset,
                Record {
                    partition: 0,
                    metadata,
                    data,
                },
            ));
            offset += HEADER_LEN + u64::from(meta_len) + u64::from(data_len);
        }

        self.cursor = offset;
        Ok(frames)
    }

    /// Move the cursor past every complete frame currently in the file
    fn skip_complete_frames(&mut self) -> Result<()> {
        while !self.read_frames()?.is_empty() {}
        Ok(())
    }

    fn next(&mut self) -> Result<ReceivedEvent> {
        while self.prefetched.is_empty() {
            let frames = self.read_frames()?;
            if frames.is_empty() {
                thread::sleep(self.poll);
            } else {
                debug!(consumer = %self.options.name, count = frames.len(), "fetched frames");
                self.prefetched.extend(frames);
            }
        }

        let (id, record) = self
            .prefetched
            .pop_front()
            .ok_or_else(|| TelemetryError::transport("empty fetch"))?;
        let data = materialize(
            self.selector.as_ref(),
            self.broker.as_ref(),
            &record.metadata,
            &record.data,
        );
        Ok(ReceivedEvent {
            id,
            partition: record.partition,
            metadata: record.metadata,
            data,
        })
    }
}

impl Consumer for LocalConsumer {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn pull(&mut self) -> PullFuture<'_> {
        PullFuture::new(move || self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{VecBroker, WholePayload};
    use tempfile::TempDir;

    const META: &[u8] = br#"{"category":"log_event"}"#;

    fn transport(dir: &TempDir) -> LocalTransport {
        let group = GroupDescriptor {
            group: "test".into(),
            root: dir.path().join("topics"),
        };
        LocalTransport::open(&group, Duration::from_millis(5)).unwrap()
    }

    #[test]
    fn descriptor_root_resolves_relative_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("group.yaml");
        fs::write(&path, "group: g\nroot: logs\n").unwrap();

        let descriptor = GroupDescriptor::load(&path).unwrap();
        assert_eq!(descriptor.root, dir.path().join("logs"));
    }

    #[test]
    fn missing_descriptor_is_descriptor_error() {
        let err = GroupDescriptor::load(Path::new("/nonexistent/group.yaml")).unwrap_err();
        assert!(matches!(err, TelemetryError::GroupDescriptor { .. }));
    }

    #[test]
    fn create_is_exclusive_across_connections() {
        let dir = TempDir::new().unwrap();
        let a = transport(&dir);
        let b = transport(&dir);

        a.create_topic("Dask", &TopicPolicy::default()).unwrap();
        assert!(b.create_topic("Dask", &TopicPolicy::default()).unwrap_err().is_already_exists());
        assert_eq!(b.open_topic("Dask").unwrap().policy(), &TopicPolicy::default());
    }

    #[test]
    fn concurrent_open_or_create_all_succeed() {
        use crate::logging::LogContext;
        use crate::topic::open_or_create;
        use std::sync::Barrier;

        const THREADS: usize = 8;
        for _ in 0..50 {
            let dir = TempDir::new().unwrap();
            let barrier = Arc::new(Barrier::new(THREADS));
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let service = transport(&dir);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        open_or_create(
                            &service,
                            "Dask",
                            &TopicPolicy::default(),
                            &LogContext::new("test"),
                        )
                        .map(|topic| topic.name().to_string())
                    })
                })
                .collect();

            for handle in handles {
                assert_eq!(handle.join().unwrap().unwrap(), "Dask");
            }
            let leftovers: Vec<_> = fs::read_dir(dir.path().join("topics").join("Dask"))
                .unwrap()
                .map(|e| e.unwrap().file_name())
                .collect();
            assert_eq!(leftovers.len(), 2, "staging files left behind: {leftovers:?}");
        }
    }

    #[test]
    fn topic_names_cannot_escape_root() {
        let dir = TempDir::new().unwrap();
        let err = transport(&dir)
            .create_topic("../evil", &TopicPolicy::default())
            .unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidTopicName { .. }));
    }

    #[test]
    fn frames_round_trip_with_offsets_as_ids() {
        let dir = TempDir::new().unwrap();
        let t = transport(&dir);
        t.create_topic("T", &TopicPolicy::default()).unwrap();
        let topic = t.open_topic("T").unwrap();

        let p = topic.producer(ProducerOptions::strict("p")).unwrap();
        let first = p.push(META.to_vec(), b"one".to_vec()).wait().unwrap();
        let second = p.push(META.to_vec(), b"two".to_vec()).wait().unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, HEADER_LEN + META.len() as u64 + 3);

        let mut c = topic
            .consumer(ConsumerOptions::new("c", 1), Box::new(WholePayload), Box::new(VecBroker))
            .unwrap();
        let e1 = c.pull().wait().unwrap();
        let e2 = c.pull().wait().unwrap();
        assert_eq!((e1.id, e1.data.as_slice()), (first, b"one".as_slice()));
        assert_eq!((e2.id, e2.data.as_slice()), (second, b"two".as_slice()));
        assert_eq!(e2.metadata, META);
    }

    #[test]
    fn consumer_from_end_ignores_earlier_sessions() {
        let dir = TempDir::new().unwrap();
        let t = transport(&dir);
        t.create_topic("T", &TopicPolicy::default()).unwrap();
        let topic = t.open_topic("T").unwrap();
        let p = topic.producer(ProducerOptions::strict("p")).unwrap();
        p.push(META.to_vec(), b"one".to_vec()).wait().unwrap();
        p.push(META.to_vec(), b"two".to_vec()).wait().unwrap();

        let mut c = topic
            .consumer(
                ConsumerOptions::new("c", 1).starting_at(StartPosition::End),
                Box::new(WholePayload),
                Box::new(VecBroker),
            )
            .unwrap();
        let third = p.push(META.to_vec(), b"three".to_vec()).wait().unwrap();

        let event = c.pull().wait().unwrap();
        assert_eq!((event.id, event.data.as_slice()), (third, b"three".as_slice()));
    }

    #[test]
    fn consumer_skips_incomplete_tail_until_written() {
        let dir = TempDir::new().unwrap();
        let t = transport(&dir);
        t.create_topic("T", &TopicPolicy::accept_all()).unwrap();
        let topic = t.open_topic("T").unwrap();
        let path = dir.path().join("topics").join("T").join(PARTITION);

        // Header promising 2 + 4 bytes, only metadata written so far
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&2u32.to_le_bytes()).unwrap();
        f.write_all(&4u32.to_le_bytes()).unwrap();
        f.write_all(b"{}").unwrap();

        let mut c = topic
            .consumer(ConsumerOptions::new("c", 4), Box::new(WholePayload), Box::new(VecBroker))
            .unwrap();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            f.write_all(b"data").unwrap();
        });

        let event = c.pull().wait().unwrap();
        assert_eq!(event.data, b"data");
        writer.join().unwrap();
    }
}
