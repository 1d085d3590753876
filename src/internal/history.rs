use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{CallError, CallResult};
use crate::internal::data_types::*;

/// most recent entries kept in the log
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    #[display(fmt = "answered")]
    Answered,
    #[display(fmt = "missed")]
    Missed,
    #[display(fmt = "declined")]
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryRecord {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: ParticipantId,
    pub caller_name: String,
    pub call_type: CallType,
    /// seconds
    pub duration: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: HistoryStatus,
}

/// layout of the persisted document
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDocument {
    call_history: Vec<CallHistoryRecord>,
}

/// durable storage for the history log. newest record first
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self) -> Result<Vec<CallHistoryRecord>>;
    async fn persist(&self, records: &[CallHistoryRecord]) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<CallHistoryRecord>>,
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn load(&self) -> Result<Vec<CallHistoryRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn persist(&self, records: &[CallHistoryRecord]) -> Result<()> {
        *self.records.lock().await = records.to_vec();
        Ok(())
    }
}

/// a single JSON document, replaced atomically (write to a sibling file, then rename)
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<CallHistoryRecord>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let doc: HistoryDocument = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(doc.call_history)
    }

    async fn persist(&self, records: &[CallHistoryRecord]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let doc = HistoryDocument {
            call_history: records.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

type Responder<T> = oneshot::Sender<CallResult<T>>;

enum HistoryCmd {
    Save {
        record: CallHistoryRecord,
        response: Option<Responder<()>>,
    },
    UpdateStatus {
        call_id: CallId,
        status: HistoryStatus,
        duration: Option<u64>,
        response: Responder<bool>,
    },
    Clear {
        response: Responder<()>,
    },
    List {
        response: Responder<Vec<CallHistoryRecord>>,
    },
}

/// handle to the single writer task. every read-modify-write runs on that task,
/// so saves and updates never interleave
#[derive(Clone)]
pub struct CallHistoryRecorder {
    tx: mpsc::UnboundedSender<HistoryCmd>,
}

impl CallHistoryRecorder {
    /// must be called from within a tokio runtime
    pub fn spawn(store: Arc<dyn HistoryStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = HistoryWriter {
            store,
            capacity: capacity.max(1),
        };
        tokio::spawn(writer.run(rx));
        Self { tx }
    }

    pub fn in_memory() -> Self {
        Self::spawn(Arc::new(MemoryStore::default()), DEFAULT_HISTORY_CAPACITY)
    }

    pub async fn save(&self, record: CallHistoryRecord) -> CallResult<()> {
        let (response, rx) = oneshot::channel();
        self.send(HistoryCmd::Save {
            record,
            response: Some(response),
        })?;
        Self::wait(rx).await
    }

    /// queues the save and returns immediately. failures are only logged
    pub fn save_detached(&self, record: CallHistoryRecord) {
        let call_id = record.call_id.clone();
        if self
            .send(HistoryCmd::Save {
                record,
                response: None,
            })
            .is_err()
        {
            log::error!("history writer is gone, call {} was not recorded", call_id);
        }
    }

    /// updates the newest record for `call_id`. returns false (not an error) when
    /// there is none, e.g. the app was killed before the call was recorded
    pub async fn update_status(
        &self,
        call_id: &CallId,
        status: HistoryStatus,
        duration: Option<u64>,
    ) -> CallResult<bool> {
        let (response, rx) = oneshot::channel();
        self.send(HistoryCmd::UpdateStatus {
            call_id: call_id.clone(),
            status,
            duration,
            response,
        })?;
        Self::wait(rx).await
    }

    pub async fn clear(&self) -> CallResult<()> {
        let (response, rx) = oneshot::channel();
        self.send(HistoryCmd::Clear { response })?;
        Self::wait(rx).await
    }

    /// newest first
    pub async fn list(&self) -> CallResult<Vec<CallHistoryRecord>> {
        let (response, rx) = oneshot::channel();
        self.send(HistoryCmd::List { response })?;
        Self::wait(rx).await
    }

    fn send(&self, cmd: HistoryCmd) -> CallResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| CallError::PersistenceFailure("history writer stopped".into()))
    }

    async fn wait<T>(rx: oneshot::Receiver<CallResult<T>>) -> CallResult<T> {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CallError::PersistenceFailure(
                "history writer dropped the request".into(),
            )),
        }
    }
}

struct HistoryWriter {
    store: Arc<dyn HistoryStore>,
    capacity: usize,
}

fn reply<T>(response: Responder<T>, result: CallResult<T>) {
    if response.send(result).is_err() {
        log::debug!("history caller went away before the reply");
    }
}

impl HistoryWriter {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<HistoryCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HistoryCmd::Save { record, response } => {
                    let call_id = record.call_id.clone();
                    let result = self.save(record).await;
                    if let Err(e) = &result {
                        log::error!("failed to record call {}: {}", call_id, e);
                    }
                    if let Some(response) = response {
                        reply(response, result);
                    }
                }
                HistoryCmd::UpdateStatus {
                    call_id,
                    status,
                    duration,
                    response,
                } => {
                    let result = self.update_status(&call_id, status, duration).await;
                    reply(response, result);
                }
                HistoryCmd::Clear { response } => {
                    let result = self.persist(&[]).await;
                    reply(response, result);
                }
                HistoryCmd::List { response } => {
                    let result = self.load().await;
                    reply(response, result);
                }
            }
        }
        log::debug!("history writer exiting");
    }

    async fn save(&self, record: CallHistoryRecord) -> CallResult<()> {
        let mut records = self.load().await?;
        records.insert(0, record);
        // oldest entries sit at the back
        records.truncate(self.capacity);
        self.persist(&records).await
    }

    async fn update_status(
        &self,
        call_id: &CallId,
        status: HistoryStatus,
        duration: Option<u64>,
    ) -> CallResult<bool> {
        let mut records = self.load().await?;
        let record = match records.iter_mut().find(|r| &r.call_id == call_id) {
            Some(r) => r,
            None => {
                log::debug!("no history record for {}", call_id);
                return Ok(false);
            }
        };
        record.status = status;
        if let Some(duration) = duration {
            record.duration = duration;
        }
        record.end_time = Utc::now();
        self.persist(&records).await?;
        Ok(true)
    }

    async fn load(&self) -> CallResult<Vec<CallHistoryRecord>> {
        self.store
            .load()
            .await
            .map_err(|e| CallError::PersistenceFailure(format!("{:#}", e)))
    }

    async fn persist(&self, records: &[CallHistoryRecord]) -> CallResult<()> {
        self.store
            .persist(records)
            .await
            .map_err(|e| CallError::PersistenceFailure(format!("{:#}", e)))
    }
}
