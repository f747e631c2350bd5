use anyhow::Result;
use common::db::AsyncDb;
use std::time::Instant;

/// Job-level bookkeeping. Every pass writes its lifecycle into the
/// job_status table (running → idle/failed, with duration and metadata) and
/// mirrors the outcome into the `tracker_job_*` Prometheus series, so a
/// stuck or silently failing stage is visible from both the DB and the
/// dashboards.
pub struct JobTracker {
    db: AsyncDb,
    name: &'static str,
    started: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, name: &'static str) -> Result<Self> {
        db.call_named("job_status.mark_running", move |conn| {
            conn.execute(
                "INSERT INTO job_status (job_name, status, last_run_at, updated_at)
                 VALUES (?1, 'running', datetime('now'), datetime('now'))
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = 'running',
                    last_run_at = datetime('now'),
                    updated_at = datetime('now'),
                    duration_ms = NULL,
                    last_error = NULL",
                rusqlite::params![name],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            name,
            started: Instant::now(),
        })
    }

    pub async fn success(self, metadata: Option<serde_json::Value>) -> Result<()> {
        self.finish("idle", None, metadata).await
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        self.finish("failed", Some(format!("{error:#}")), None).await
    }

    async fn finish(
        self,
        status: &'static str,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let elapsed_ms = self.started.elapsed().as_millis() as i64;
        metrics::histogram!("tracker_job_duration_ms", "job" => self.name)
            .record(elapsed_ms as f64);
        metrics::counter!("tracker_job_runs_total", "job" => self.name, "status" => status)
            .increment(1);

        let name = self.name;
        let meta = metadata.map(|v| v.to_string());
        self.db
            .call_named("job_status.finish", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = ?2,
                        duration_ms = ?3,
                        last_error = ?4,
                        metadata = COALESCE(?5, metadata),
                        updated_at = datetime('now')
                     WHERE job_name = ?1",
                    rusqlite::params![name, status, elapsed_ms, error, meta],
                )?;
                Ok(())
            })
            .await
    }

    /// Bracket a whole job body: mark it running, then idle or failed from
    /// the outcome. The body returns its result together with the metadata
    /// JSON to store alongside it. An error from the body always wins over
    /// an error from the status write.
    pub async fn observe<T, Fut>(db: &AsyncDb, name: &'static str, body: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<(T, serde_json::Value)>>,
    {
        let tracker = Self::start(db, name).await?;
        match body.await {
            Ok((value, metadata)) => {
                tracker.success(Some(metadata)).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(status_err) = tracker.fail(&e).await {
                    tracing::warn!(job = name, error = %status_err, "could not record job failure");
                }
                Err(e)
            }
        }
    }
}
