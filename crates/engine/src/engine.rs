//! Transfer engine facade.
//!
//! One engine per invocation: it owns the injected transport, the per-job
//! configuration, the event channel and the cancellation token.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chanvault_protocol::Manifest;
use chanvault_transfer::{ChunkCipher, Direction, KeyStore, TransferError, TransferJob};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::discovery::find_manifest;
use crate::error::EngineError;
use crate::retry::with_retry;
use crate::transport::ChannelTransport;
use crate::types::{DownloadReport, TransferConfig, TransferEvent};
use crate::{download, upload};

/// Capacity of the event channel. Events are dropped, not awaited, when the
/// receiver falls this far behind.
const EVENT_CAPACITY: usize = 256;

/// Everything a running job needs, borrowed from the engine.
pub(crate) struct JobContext {
    pub transport: Arc<dyn ChannelTransport>,
    pub config: TransferConfig,
    pub cancel: CancellationToken,
    pub job: Arc<TransferJob>,
    events: mpsc::Sender<TransferEvent>,
}

impl JobContext {
    fn emit(&self, event: TransferEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(error = %e, "transfer event dropped");
        }
    }

    pub fn emit_started(&self) {
        let p = self.job.progress();
        self.emit(TransferEvent::Started {
            job_id: p.job_id,
            direction: p.direction,
            file_name: p.file_name,
            total: p.total,
        });
    }

    pub fn emit_progress(&self, completed: u32, total: u32) {
        self.emit(TransferEvent::Progress {
            job_id: self.job.id(),
            completed,
            total,
        });
    }

    pub fn emit_chunk_failed(&self, index: Option<u32>, err: &EngineError) {
        self.emit(TransferEvent::ChunkFailed {
            job_id: self.job.id(),
            index,
            error: err.to_string(),
        });
    }
}

/// Runs uploads and downloads against one channel.
pub struct TransferEngine {
    transport: Arc<dyn ChannelTransport>,
    config: TransferConfig,
    cipher: Option<Arc<ChunkCipher>>,
    keys: Option<Arc<KeyStore>>,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    cancel: CancellationToken,
    current: Mutex<Option<Arc<TransferJob>>>,
}

impl TransferEngine {
    /// Creates an engine. Fails if `config` is unusable.
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        config: TransferConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Ok(Self {
            transport,
            config,
            cipher: None,
            keys: None,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
            current: Mutex::new(None),
        })
    }

    /// Encrypts uploads with `cipher`; also used to decrypt matching downloads.
    pub fn with_cipher(mut self, cipher: ChunkCipher) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Looks up download keys in `keys` by the manifest's key id.
    pub fn with_key_store(mut self, keys: Arc<KeyStore>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Returns the cancellation token for this engine.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The job currently or most recently run by this engine.
    pub fn current_job(&self) -> Option<Arc<TransferJob>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Uploads `source` and posts its manifest. Returns the manifest sent.
    pub async fn send(&self, source: &Path) -> Result<Manifest, EngineError> {
        let provisional = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ctx = self.begin_job(Direction::Upload, provisional);
        let result = upload::upload(&ctx, source.to_path_buf(), self.cipher.clone()).await;
        self.finish_job(&ctx, result)
    }

    /// Downloads the file described by `manifest` into `dest_dir`.
    pub async fn receive(
        &self,
        manifest: &Manifest,
        dest_dir: &Path,
    ) -> Result<DownloadReport, EngineError> {
        let ctx = self.begin_job(Direction::Download, manifest.file_name.clone());
        let result = match self.download_cipher(manifest) {
            Ok(cipher) => download::download(&ctx, manifest, dest_dir, cipher).await,
            Err(e) => Err(e),
        };
        self.finish_job(&ctx, result)
    }

    /// Finds the newest manifest in the configured search window.
    pub async fn locate(&self) -> Result<Manifest, EngineError> {
        let window = self.config.manifest_search_window;
        let items = with_retry(&self.config.retry, &self.cancel, "list recent", || {
            self.transport.recent_items(window)
        })
        .await?;
        find_manifest(&items, window)
    }

    /// Locates the newest manifest and downloads its file into `dest_dir`.
    pub async fn combine_from_channel(
        &self,
        dest_dir: &Path,
    ) -> Result<(Manifest, DownloadReport), EngineError> {
        let manifest = self.locate().await?;
        info!(
            file = %manifest.file_name,
            first = %manifest.first_position,
            last = %manifest.last_position,
            "manifest located"
        );
        let report = self.receive(&manifest, dest_dir).await?;
        Ok((manifest, report))
    }

    fn download_cipher(
        &self,
        manifest: &Manifest,
    ) -> Result<Option<Arc<ChunkCipher>>, EngineError> {
        if !manifest.encrypted {
            return Ok(None);
        }
        let key_id = manifest.key_id.clone().unwrap_or_default();
        if let Some(cipher) = &self.cipher
            && cipher.key_id() == key_id
        {
            return Ok(Some(Arc::clone(cipher)));
        }
        match &self.keys {
            Some(keys) => Ok(Some(Arc::new(keys.cipher(&key_id)?))),
            None => Err(TransferError::KeyNotFound(key_id).into()),
        }
    }

    fn begin_job(&self, direction: Direction, file_name: String) -> JobContext {
        let job = Arc::new(TransferJob::new(direction, file_name, 0));
        job.start();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&job));
        JobContext {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            job,
            events: self.events_tx.clone(),
        }
    }

    /// Moves the job to its terminal state and reports the outcome.
    fn finish_job<T>(
        &self,
        ctx: &JobContext,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let job_id = ctx.job.id();
        match &result {
            Ok(_) => {
                ctx.job.finish();
                ctx.emit(TransferEvent::Completed { job_id });
            }
            Err(e) => {
                match e {
                    EngineError::Aborted => ctx.job.abort(),
                    EngineError::PartiallyFailed { .. } => {
                        ctx.job.finish();
                    }
                    other => ctx.job.fail(&other.to_string()),
                }
                error!(job = %job_id, error = %e, "transfer failed");
                ctx.emit(TransferEvent::Failed {
                    job_id,
                    error: e.to_string(),
                });
            }
        }
        result
    }
}
