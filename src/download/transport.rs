// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background transfer transports.
//!
//! A transport owns the actual byte movement. It reports what happens through
//! an event channel instead of callbacks, so the coordinator can apply every
//! event from a single update loop. Transports are expected to outlive the
//! process that submitted the work: after a restart, `live_transfers` lists
//! what is still pending and the matching events are replayed.
//!
//! [`HttpTransport`] keeps that promise with a journal in its staging
//! directory. Every submitted transfer is journaled; on open, running entries
//! are relaunched (from the start, no range requests) and finished entries
//! that the coordinator never acknowledged replay their `Finished` event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{TransferEvent, TransferHandle, TransferRequest};
use crate::error::OfflineError;
use crate::locks::{resilient_read, resilient_write};
use crate::persist;

/// Minimum spacing between progress events for one transfer.
const PROGRESS_EVENT_INTERVAL: Duration = Duration::from_millis(250);

/// Connection timeout for media requests. Stalled bodies are left to the
/// server and OS; large files legitimately take hours.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Out-of-process transfer service consumed by the coordinator.
pub trait Transport: Send + Sync {
    /// Start a background transfer tagged with the request's asset id.
    fn submit(&self, request: TransferRequest) -> Result<TransferHandle, OfflineError>;

    /// Stop a transfer and discard anything it wrote. Unknown handles are ignored.
    fn cancel(&self, handle: &TransferHandle);

    /// The coordinator has consumed a `Finished` or `Failed` event; forget it.
    fn acknowledge(&self, handle: &TransferHandle);

    /// Transfers the transport still considers live, including finished ones
    /// awaiting acknowledgement.
    fn live_transfers(&self) -> Vec<TransferHandle>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum JournalState {
    Running,
    Finished { temp_path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    handle: TransferHandle,
    url: String,
    title: String,
    submitted_at: DateTime<Utc>,
    state: JournalState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransferJournal {
    version: u32,
    transfers: Vec<JournalEntry>,
}

impl Default for TransferJournal {
    fn default() -> Self {
        Self {
            version: 1,
            transfers: Vec::new(),
        }
    }
}

struct Shared {
    client: reqwest::Client,
    api_token: String,
    staging_dir: PathBuf,
    journal_path: PathBuf,
    events: mpsc::UnboundedSender<TransferEvent>,
    journal: RwLock<Vec<JournalEntry>>,
    tasks: RwLock<HashMap<u64, JoinHandle<()>>>,
}

fn part_path(staging_dir: &Path, handle: &TransferHandle) -> PathBuf {
    staging_dir.join(format!("{}.part", handle.task_id))
}

fn done_path(staging_dir: &Path, handle: &TransferHandle) -> PathBuf {
    staging_dir.join(format!("{}.download", handle.task_id))
}

fn remove_staging_files(staging_dir: &Path, handle: &TransferHandle) {
    for path in [part_path(staging_dir, handle), done_path(staging_dir, handle)] {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove staging file {:?}: {}", path, e);
            }
        }
    }
}

impl Shared {
    fn part_path(&self, handle: &TransferHandle) -> PathBuf {
        part_path(&self.staging_dir, handle)
    }

    fn done_path(&self, handle: &TransferHandle) -> PathBuf {
        done_path(&self.staging_dir, handle)
    }

    fn emit(&self, event: TransferEvent) {
        if self.events.send(event).is_err() {
            debug!("Transfer event dropped, no coordinator listening");
        }
    }

    fn save_journal(&self, entries: &[JournalEntry]) {
        let journal = TransferJournal {
            version: 1,
            transfers: entries.to_vec(),
        };
        if let Err(e) = persist::save_json(&self.journal_path, &journal) {
            warn!("Failed to persist transfer journal {:?}: {:#}", self.journal_path, e);
        }
    }

    fn mark_finished(&self, handle: &TransferHandle, temp_path: &Path) {
        let mut journal = resilient_write(&self.journal);
        if let Some(entry) = journal.iter_mut().find(|e| e.handle == *handle) {
            entry.state = JournalState::Finished {
                temp_path: temp_path.to_path_buf(),
            };
        }
        self.save_journal(&journal);
    }

    /// Drop the journal entry and any staging files for `handle`.
    fn forget(&self, handle: &TransferHandle) {
        let mut journal = resilient_write(&self.journal);
        let before = journal.len();
        journal.retain(|e| e.handle != *handle);
        if journal.len() != before {
            self.save_journal(&journal);
        }
        drop(journal);

        remove_staging_files(&self.staging_dir, handle);
    }
}

/// Streaming HTTP transport with a restart journal.
pub struct HttpTransport {
    shared: Arc<Shared>,
}

impl HttpTransport {
    /// Open the transport, relaunching or replaying journaled transfers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        staging_dir: impl Into<PathBuf>,
        api_token: impl Into<String>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Self> {
        let staging_dir = staging_dir.into();
        std::fs::create_dir_all(&staging_dir)
            .with_context(|| format!("Failed to create staging dir {:?}", staging_dir))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;

        let journal_path = staging_dir.join("journal.json");
        let journal: TransferJournal = persist::load_json(&journal_path).unwrap_or_else(|e| {
            warn!("Transfer journal unreadable, starting empty: {:#}", e);
            TransferJournal::default()
        });

        let transport = Self {
            shared: Arc::new(Shared {
                client,
                api_token: api_token.into().trim().to_string(),
                staging_dir,
                journal_path,
                events,
                journal: RwLock::new(journal.transfers),
                tasks: RwLock::new(HashMap::new()),
            }),
        };
        transport.resume_journal();
        Ok(transport)
    }

    fn resume_journal(&self) {
        let entries = resilient_read(&self.shared.journal).clone();
        for entry in entries {
            match entry.state {
                JournalState::Finished { temp_path } if temp_path.is_file() => {
                    info!(asset_id = %entry.handle.asset_id, "Replaying finished transfer");
                    self.shared.emit(TransferEvent::Finished {
                        handle: entry.handle,
                        temp_path,
                    });
                }
                _ => match Url::parse(&entry.url) {
                    Ok(url) => {
                        info!(asset_id = %entry.handle.asset_id, "Relaunching journaled transfer");
                        self.launch(entry.handle, url);
                    }
                    Err(e) => {
                        warn!(asset_id = %entry.handle.asset_id, "Journaled URL invalid: {}", e);
                        self.shared.forget(&entry.handle);
                        self.shared.emit(TransferEvent::Failed {
                            handle: entry.handle,
                            error: format!("invalid journaled URL: {}", e),
                        });
                    }
                },
            }
        }
    }

    fn launch(&self, handle: TransferHandle, url: Url) {
        {
            let mut journal = resilient_write(&self.shared.journal);
            if let Some(entry) = journal.iter_mut().find(|e| e.handle == handle) {
                entry.state = JournalState::Running;
            }
        }

        let shared = Arc::clone(&self.shared);
        let task_id = handle.task_id;
        let mut tasks = resilient_write(&self.shared.tasks);
        let join = tokio::spawn(async move {
            run_transfer(Arc::clone(&shared), handle, url).await;
            resilient_write(&shared.tasks).remove(&task_id);
        });
        tasks.insert(task_id, join);
    }

    /// Read the journal in `staging_dir` without opening the transport.
    ///
    /// Returns `(handle, title)` for every transfer that would be relaunched
    /// or replayed by [`HttpTransport::open`].
    pub fn journaled(staging_dir: &Path) -> Result<Vec<(TransferHandle, String)>> {
        let journal: TransferJournal = persist::load_json(&staging_dir.join("journal.json"))?;
        Ok(journal
            .transfers
            .into_iter()
            .map(|entry| (entry.handle, entry.title))
            .collect())
    }

    /// Drop every journaled transfer for `asset_id`, with its staging files,
    /// without opening the transport. Returns the discarded handles.
    pub fn discard_journaled(staging_dir: &Path, asset_id: &str) -> Result<Vec<TransferHandle>> {
        let journal_path = staging_dir.join("journal.json");
        let mut journal: TransferJournal = persist::load_json(&journal_path)?;

        let (discarded, kept): (Vec<_>, Vec<_>) = journal
            .transfers
            .into_iter()
            .partition(|entry| entry.handle.asset_id == asset_id);
        if discarded.is_empty() {
            return Ok(Vec::new());
        }

        journal.transfers = kept;
        persist::save_json(&journal_path, &journal)?;

        let handles: Vec<TransferHandle> = discarded.into_iter().map(|entry| entry.handle).collect();
        for handle in &handles {
            remove_staging_files(staging_dir, handle);
        }
        info!(asset_id, discarded = handles.len(), "Discarded journaled transfers");
        Ok(handles)
    }
}

impl Transport for HttpTransport {
    fn submit(&self, request: TransferRequest) -> Result<TransferHandle, OfflineError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(OfflineError::TransportFailure(
                "transfers need a running async runtime".to_string(),
            ));
        }

        let handle = TransferHandle::new(&request.asset_id);
        {
            let mut journal = resilient_write(&self.shared.journal);
            journal.push(JournalEntry {
                handle: handle.clone(),
                url: request.url.to_string(),
                title: request.title.clone(),
                submitted_at: Utc::now(),
                state: JournalState::Running,
            });
            self.shared.save_journal(&journal);
        }

        info!(asset_id = %request.asset_id, task = handle.task_id, url = %request.url, "Submitting transfer");
        self.launch(handle.clone(), request.url);
        Ok(handle)
    }

    fn cancel(&self, handle: &TransferHandle) {
        if let Some(join) = resilient_write(&self.shared.tasks).remove(&handle.task_id) {
            join.abort();
        }
        self.shared.forget(handle);
        debug!(asset_id = %handle.asset_id, task = handle.task_id, "Transfer cancelled");
    }

    fn acknowledge(&self, handle: &TransferHandle) {
        self.shared.forget(handle);
    }

    fn live_transfers(&self) -> Vec<TransferHandle> {
        resilient_read(&self.shared.journal)
            .iter()
            .map(|e| e.handle.clone())
            .collect()
    }
}

async fn run_transfer(shared: Arc<Shared>, handle: TransferHandle, url: Url) {
    match fetch(&shared, &handle, &url).await {
        Ok(done_path) => {
            shared.mark_finished(&handle, &done_path);
            shared.emit(TransferEvent::Finished {
                handle,
                temp_path: done_path,
            });
        }
        Err(e) => {
            warn!(asset_id = %handle.asset_id, task = handle.task_id, "Transfer failed: {:#}", e);
            shared.forget(&handle);
            shared.emit(TransferEvent::Failed {
                handle,
                error: format!("{:#}", e),
            });
        }
    }
}

/// Stream `url` into the part file, then rename it to the done file.
async fn fetch(shared: &Shared, handle: &TransferHandle, url: &Url) -> Result<PathBuf> {
    let mut request = shared.client.get(url.clone());
    if !shared.api_token.is_empty() {
        request = request.header(AUTHORIZATION, format!("Token {}", shared.api_token));
    }

    let response = request.send().await.context("Request failed")?;
    let status = response.status();
    if !status.is_success() {
        bail!("Server returned HTTP {}", status);
    }

    let bytes_expected = response.content_length();
    let part_path = shared.part_path(handle);
    let mut file = tokio::fs::File::create(&part_path)
        .await
        .with_context(|| format!("Failed to create {:?}", part_path))?;

    let mut bytes_written = 0u64;
    let mut last_event = Instant::now();
    let mut stream = response.bytes_stream();

    shared.emit(TransferEvent::Progress {
        handle: handle.clone(),
        bytes_written,
        bytes_expected,
    });

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Connection interrupted")?;
        file.write_all(&chunk).await.context("Failed to write partial file")?;
        bytes_written += chunk.len() as u64;

        if last_event.elapsed() >= PROGRESS_EVENT_INTERVAL {
            last_event = Instant::now();
            shared.emit(TransferEvent::Progress {
                handle: handle.clone(),
                bytes_written,
                bytes_expected,
            });
        }
    }

    file.flush().await.context("Failed to flush partial file")?;
    file.sync_all().await.context("Failed to sync partial file")?;
    drop(file);

    if let Some(expected) = bytes_expected {
        if bytes_written < expected {
            bail!("Body ended after {} of {} bytes", bytes_written, expected);
        }
    }

    shared.emit(TransferEvent::Progress {
        handle: handle.clone(),
        bytes_written,
        bytes_expected,
    });

    let done_path = shared.done_path(handle);
    tokio::fs::rename(&part_path, &done_path)
        .await
        .with_context(|| format!("Failed to finalize {:?}", part_path))?;

    Ok(done_path)
}
