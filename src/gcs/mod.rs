//! The GCS source: streams bucket objects into chunks, deduplicated by a
//! cache that checkpoints into the progress token.

mod error;
mod manager;
mod object;

pub use error::GcsError;
pub use manager::{
    DEFAULT_MAX_OBJECT_SIZE, GcsCredential, GcsManager, Listing, MAX_OBJECT_SIZE_LIMIT,
    clamp_object_size,
};
pub use object::{Bucket, Object};

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::cache::{DEFAULT_PERSIST_INCREMENT, PersistableCache};
use crate::chunk::{Chunk, GcsMetadata, SourceKind, SourceMetadata};
use crate::handler::{BufferedReader, FileHandler, NoopHandler};
use crate::progress::Progress;
use crate::source::{CancelToken, ChunkReporter, ChunkingTarget, Source};

/// GCS source configuration, filled from the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct GcsConfig {
    pub project_id: String,
    pub include_buckets: Vec<String>,
    pub exclude_buckets: Vec<String>,
    pub include_objects: Vec<String>,
    pub exclude_objects: Vec<String>,
    /// Bytes; 0 or out-of-range values fall back to the default cap.
    pub max_object_size: u64,
}

pub struct GcsSource {
    name: String,
    source_id: i64,
    job_id: i64,
    verify: bool,
    config: GcsConfig,
    credential: GcsCredential,
    manager: Option<Arc<GcsManager>>,
    handler: Arc<dyn FileHandler>,
    progress: Arc<Mutex<Progress>>,
}

impl GcsSource {
    pub fn new(config: GcsConfig, credential: GcsCredential) -> Self {
        Self {
            name: String::new(),
            source_id: 0,
            job_id: 0,
            verify: false,
            config,
            credential,
            manager: None,
            handler: Arc::new(NoopHandler),
            progress: Arc::new(Mutex::new(Progress::default())),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn FileHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Seed resume state from a previous run's progress token.
    pub fn with_resume_info(self, encoded: &str) -> Self {
        self.progress.lock().expect("progress lock poisoned").encoded_resume_info =
            encoded.to_string();
        self
    }

    fn build_chunk(&self, object: &Object, data: Vec<u8>) -> Chunk {
        Chunk {
            source_name: self.name.clone(),
            source_kind: SourceKind::Gcs,
            source_id: self.source_id,
            job_id: self.job_id,
            secret_id: None,
            data,
            verify: self.verify,
            metadata: SourceMetadata::Gcs(GcsMetadata {
                bucket: object.bucket.clone(),
                filename: object.name.clone(),
                link: object.link.clone(),
                email: object.owner.clone(),
                content_type: object.content_type.clone(),
                acls: object.acl.clone(),
                created_at: object.created_at.to_string(),
                updated_at: object.updated_at.to_string(),
            }),
        }
    }

    /// Spool, offer to the handler, and otherwise chunk the raw bytes.
    fn process_object(
        &self,
        manager: &GcsManager,
        object: &Object,
        reporter: &dyn ChunkReporter,
        cancel: &CancelToken,
    ) -> Result<(), GcsError> {
        let bytes = manager.download(object)?;
        let mut reader = BufferedReader::spool(&mut bytes.as_slice())?;

        let skeleton = self.build_chunk(object, Vec::new());
        if self.handler.handle(&object.name, &mut reader, &skeleton, reporter, false) {
            return Ok(());
        }

        reader.rewind()?;
        let data = reader.slurp()?;
        if cancel.is_cancelled() {
            return Err(GcsError::Cancelled);
        }
        reporter
            .chunk_ok(Chunk { data, ..skeleton })
            .map_err(|e| GcsError::ChunkSend(e.to_string()))
    }
}

impl Source for GcsSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Gcs
    }

    fn source_id(&self) -> i64 {
        self.source_id
    }

    fn job_id(&self) -> i64 {
        self.job_id
    }

    fn init(
        &mut self,
        name: &str,
        source_id: i64,
        job_id: i64,
        verify: bool,
        concurrency: usize,
    ) -> anyhow::Result<()> {
        self.name = name.to_string();
        self.source_id = source_id;
        self.job_id = job_id;
        self.verify = verify;
        self.manager = Some(Arc::new(GcsManager::new(
            &self.config.project_id,
            &self.config.include_buckets,
            &self.config.exclude_buckets,
            &self.config.include_objects,
            &self.config.exclude_objects,
            self.config.max_object_size,
            concurrency as i64,
            self.credential.clone(),
        )));
        Ok(())
    }

    fn chunks(
        &mut self,
        reporter: &dyn ChunkReporter,
        targets: &[ChunkingTarget],
        cancel: &CancelToken,
    ) -> anyhow::Result<()> {
        if !targets.is_empty() {
            anyhow::bail!("gcs source does not support targeted scans");
        }
        let manager =
            self.manager.clone().ok_or_else(|| anyhow::anyhow!("gcs source used before init"))?;

        // Fingerprints from a previous interrupted run skip re-processing.
        let cache = PersistableCache::new(self.progress.clone(), DEFAULT_PERSIST_INCREMENT);
        {
            let resume =
                self.progress.lock().expect("progress lock poisoned").encoded_resume_info.clone();
            cache.load(&resume);
        }

        let listing = manager.enumerate(cancel)?;
        let fatal: Mutex<Option<GcsError>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..manager.concurrency() {
                let listing_objects = listing.objects.clone();
                let discovered = listing.discovered.clone();
                let cache = &cache;
                let fatal = &fatal;
                let source: &GcsSource = self;
                let manager = manager.clone();
                let progress = self.progress.clone();
                let cancel = cancel.clone();
                scope.spawn(move || {
                    for object in listing_objects.iter() {
                        if cancel.is_cancelled()
                            || fatal.lock().expect("fatal lock poisoned").is_some()
                        {
                            break;
                        }

                        let duplicate = !object.md5.is_empty() && cache.exists(&object.md5);
                        let mut processed = false;
                        if duplicate {
                            log::debug!("skipping already-seen object {}", object.name);
                        } else {
                            match source.process_object(&manager, &object, reporter, &cancel) {
                                Ok(()) => processed = true,
                                Err(err @ (GcsError::ChunkSend(_) | GcsError::Cancelled)) => {
                                    *fatal.lock().expect("fatal lock poisoned") = Some(err);
                                    break;
                                }
                                Err(err) => {
                                    log::error!("object {} failed: {err}", object.name)
                                }
                            }
                        }

                        // Duplicates and failures still advance progress so
                        // the percent converges on resumed scans.
                        {
                            let mut progress =
                                progress.lock().expect("progress lock poisoned");
                            let completed = progress.sections_completed as usize + 1;
                            let total =
                                (discovered.load(Ordering::Relaxed) as usize).max(completed);
                            let resume = progress.encoded_resume_info.clone();
                            progress.set_progress_complete(
                                completed,
                                total,
                                format!("processed {}/{}", object.bucket, object.name),
                                resume,
                            );
                        }
                        if processed && !object.md5.is_empty() {
                            cache.set(&object.md5, &object.md5);
                        }
                    }
                });
            }
        });

        if let Some(err) = fatal.into_inner().expect("fatal lock poisoned") {
            return Err(err.into());
        }
        if cancel.is_cancelled() {
            log::info!("gcs scan cancelled; resume info covers {} objects", cache.count());
            return Ok(());
        }
        self.progress
            .lock()
            .expect("progress lock poisoned")
            .finish(format!("gcs scan complete: {} objects", cache.count()));
        Ok(())
    }

    fn progress(&self) -> Progress {
        self.progress.lock().expect("progress lock poisoned").clone()
    }
}
