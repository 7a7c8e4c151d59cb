// =============================================================================
// DataDownload orchestrator — async dataset preparation on runners
// =============================================================================
//
// A download runs as a spawned task bounded by the configured timeout and
// moves through three phases with bounded progress updates: fetch per
// enabled exchange (0–50 %), package the dataset into one archive (~60 %),
// and upload it to the object store (~80 %). Success and failure both leave
// the runner row in a settled state and publish a status event on the runner
// and owner topics.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::{IoContext, MonitorError, Result};
use crate::events::{runner_owner_topic, runner_topic, EventBus, RunnerEvent};
use crate::monitor::archive;
use crate::store::models::{BotRunner, DataDownloadConfig, DownloadProgress};
use crate::store::Store;
use crate::types::DownloadStatus;

/// Progress percentages at the phase boundaries.
const PHASE_FETCH_MAX: f64 = 50.0;
const PHASE_PACKAGE: f64 = 60.0;
const PHASE_UPLOAD: f64 = 80.0;

/// Fetches one exchange's candles for one pair into the staging directory.
/// Implementations live with the control plane (the monitor does not speak
/// exchange protocols itself).
#[async_trait]
pub trait DatasetFetcher: Send + Sync {
    async fn fetch_pair(
        &self,
        runner: &BotRunner,
        exchange: &str,
        pair: &str,
        timeframes: &[String],
        days: u32,
        dest: &Path,
    ) -> Result<()>;
}

/// A presigned upload slot in the object store.
#[derive(Debug, Clone)]
pub struct PresignedUpload {
    pub bucket: String,
    pub key: String,
    pub url: String,
}

/// Presigned-URL interface to the object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn presign_upload(&self, key: &str) -> Result<PresignedUpload>;
}

pub struct DownloadOrchestrator {
    store: Store,
    fetcher: Arc<dyn DatasetFetcher>,
    object_store: Arc<dyn ObjectStore>,
    bus: Arc<dyn EventBus>,
    timeout: Duration,
    http: reqwest::Client,
}

impl DownloadOrchestrator {
    pub fn new(
        store: Store,
        fetcher: Arc<dyn DatasetFetcher>,
        object_store: Arc<dyn ObjectStore>,
        bus: Arc<dyn EventBus>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            object_store,
            bus,
            timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Transition the runner to `downloading` and spawn the bounded task.
    pub async fn launch(self: &Arc<Self>, runner: BotRunner) {
        let config = match DataDownloadConfig::parse(runner.data_download_config.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                // Nothing to run; fail the row right here.
                self.mark_failed(&runner, &e.to_string()).await;
                return;
            }
        };

        let total_units =
            (config.enabled_exchanges().len() * config.pairs.len().max(1)).max(1) as u32;
        let initial = DownloadProgress {
            pairs_completed: 0,
            pairs_total: total_units,
            current_pair: String::new(),
            percent_complete: 0.0,
        };

        if let Err(e) = self
            .store
            .begin_runner_download(runner.id, Utc::now(), &initial.to_value())
            .await
        {
            warn!(runner_id = %runner.id, error = %e, "could not start download");
            return;
        }
        self.publish_event(&runner, DownloadStatus::Downloading, None).await;
        info!(runner_id = %runner.id, units = total_units, "data download started");

        let orchestrator = Arc::clone(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(timeout, orchestrator.run(&runner, &config)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    orchestrator.mark_failed(&runner, &e.to_string()).await;
                }
                Err(_) => {
                    orchestrator
                        .mark_failed(
                            &runner,
                            &format!("data download timed out after {timeout:?}"),
                        )
                        .await;
                }
            }
        });
    }

    /// Fail the runner's download and publish the status change.
    pub async fn mark_failed(&self, runner: &BotRunner, reason: &str) {
        warn!(runner_id = %runner.id, reason = %reason, "data download failed");
        if let Err(e) = self.store.fail_runner_download(runner.id, reason).await {
            warn!(runner_id = %runner.id, error = %e, "could not persist download failure");
        }
        self.publish_event(runner, DownloadStatus::Failed, Some(reason)).await;
    }

    async fn run(&self, runner: &BotRunner, config: &DataDownloadConfig) -> Result<()> {
        let staging = staging_dir(runner);
        tokio::fs::create_dir_all(&staging)
            .await
            .transient("creating staging directory")?;

        let result = self.run_phases(runner, config, &staging).await;

        // Best-effort cleanup of the staging area either way.
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            debug!(runner_id = %runner.id, error = %e, "staging cleanup failed");
        }

        result
    }

    async fn run_phases(
        &self,
        runner: &BotRunner,
        config: &DataDownloadConfig,
        staging: &Path,
    ) -> Result<()> {
        // Phase 1: per-exchange fetch, 0–50 %.
        let exchanges = config.enabled_exchanges();
        let pairs: Vec<String> = if config.pairs.is_empty() {
            vec![String::new()]
        } else {
            config.pairs.clone()
        };
        let total_units = (exchanges.len() * pairs.len()).max(1) as u32;
        let mut completed: u32 = 0;

        for exchange in &exchanges {
            let exchange_dir = staging.join(&exchange.name);
            tokio::fs::create_dir_all(&exchange_dir)
                .await
                .transient("creating exchange directory")?;

            for pair in &pairs {
                self.fetcher
                    .fetch_pair(
                        runner,
                        &exchange.name,
                        pair,
                        &config.timeframes,
                        config.days,
                        &exchange_dir,
                    )
                    .await?;

                completed += 1;
                let progress = DownloadProgress {
                    pairs_completed: completed,
                    pairs_total: total_units,
                    current_pair: format!("{}:{}", exchange.name, pair),
                    percent_complete: PHASE_FETCH_MAX * completed as f64
                        / total_units as f64,
                };
                self.write_progress(runner, &progress).await;
            }
        }

        // Phase 2: package everything into one archive.
        self.write_progress(
            runner,
            &DownloadProgress {
                pairs_completed: completed,
                pairs_total: total_units,
                current_pair: "packaging".to_string(),
                percent_complete: PHASE_PACKAGE,
            },
        )
        .await;

        let archive_path = staging.with_extension("tar.gz");
        let pack_src = staging.to_path_buf();
        let pack_dst = archive_path.clone();
        tokio::task::spawn_blocking(move || archive::pack_dir(&pack_src, &pack_dst))
            .await
            .transient("archive task join")??;

        // Phase 3: upload through a presigned URL.
        self.write_progress(
            runner,
            &DownloadProgress {
                pairs_completed: completed,
                pairs_total: total_units,
                current_pair: "uploading".to_string(),
                percent_complete: PHASE_UPLOAD,
            },
        )
        .await;

        let upload = self
            .object_store
            .presign_upload(&format!("runners/{}/dataset.tar.gz", runner.id))
            .await?;
        self.upload_archive(&archive_path, &upload).await?;

        if let Err(e) = tokio::fs::remove_file(&archive_path).await {
            debug!(runner_id = %runner.id, error = %e, "archive cleanup failed");
        }

        self.store
            .complete_runner_download(runner.id, Utc::now(), &upload.bucket, &upload.key)
            .await?;
        self.publish_event(runner, DownloadStatus::Completed, None).await;
        info!(runner_id = %runner.id, key = %upload.key, "data download completed");
        Ok(())
    }

    async fn upload_archive(&self, archive: &Path, upload: &PresignedUpload) -> Result<()> {
        let file = tokio::fs::File::open(archive)
            .await
            .transient("opening archive for upload")?;
        let size = file
            .metadata()
            .await
            .transient("reading archive metadata")?
            .len();

        let response = self
            .http
            .put(&upload.url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .transient("uploading archive")?;

        if !response.status().is_success() {
            return Err(MonitorError::ResourceExhausted(format!(
                "object store refused the archive upload: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn write_progress(&self, runner: &BotRunner, progress: &DownloadProgress) {
        if let Err(e) = self
            .store
            .update_runner_progress(runner.id, &progress.to_value())
            .await
        {
            warn!(runner_id = %runner.id, error = %e, "progress write failed");
        }
    }

    async fn publish_event(
        &self,
        runner: &BotRunner,
        status: DownloadStatus,
        error: Option<&str>,
    ) {
        let event = RunnerEvent {
            kind: "data_download".to_string(),
            runner_id: runner.id,
            status,
            error: error.map(|e| e.to_string()),
            timestamp: Utc::now(),
        };
        let Ok(payload) = serde_json::to_value(&event) else {
            return;
        };
        for topic in [runner_topic(runner.id), runner_owner_topic(runner.owner_id)] {
            if let Err(e) = self.bus.publish(&topic, payload.clone()).await {
                warn!(runner_id = %runner.id, topic, error = %e, "runner event publish failed");
            }
        }
    }
}

fn staging_dir(runner: &BotRunner) -> PathBuf {
    std::env::temp_dir().join(format!("fleet-dataset-{}", runner.id))
}
