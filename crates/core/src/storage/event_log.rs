use crate::events::{EventLog, TimelineEvent};
use crate::types::ExecutionId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Timeline store backed by gzip-compressed JSON Lines files, one per
/// execution per day.
pub struct JsonlEventLog {
    base_path: PathBuf,
    buffer: RwLock<Vec<TimelineEvent>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: RwLock::new(Vec::new()),
        })
    }

    /// `events/YYYY/MM/DD/<execution_id>.jsonl.gz`
    fn event_log_path(&self, execution_id: &ExecutionId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", execution_id))
    }

    /// Flushes every buffered event, regardless of which execution it
    /// belongs to — the buffer is shared across the whole log so a write
    /// triggered by one execution crossing the flush threshold must not
    /// leave another execution's events sitting unflushed in memory.
    async fn flush_all(&self) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        if buffer.is_empty() {
            return Ok(());
        }

        let mut events_by_bucket: std::collections::HashMap<(ExecutionId, DateTime<Utc>), Vec<TimelineEvent>> =
            std::collections::HashMap::new();

        for event in buffer.drain(..) {
            let date = event.timestamp.date_naive().and_hms_opt(0, 0, 0).unwrap();
            let date_utc = DateTime::<Utc>::from_naive_utc_and_offset(date, Utc);
            events_by_bucket.entry((event.execution_id, date_utc)).or_default().push(event);
        }

        for ((execution_id, date), events) in events_by_bucket {
            let path = self.event_log_path(&execution_id, &date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                self.read_jsonl_gz(&path).await?
            } else {
                Vec::new()
            };

            all_events.extend(events);
            self.write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    async fn read_jsonl_gz(&self, path: &PathBuf) -> Result<Vec<TimelineEvent>> {
        use flate2::read::GzDecoder;
        use std::io::BufRead;

        let file = std::fs::File::open(path).context("failed to open event log")?;
        let decoder = GzDecoder::new(file);
        let reader = std::io::BufReader::new(decoder);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.context("failed to read line from event log")?;
            let event: TimelineEvent =
                serde_json::from_str(&line).context("failed to parse timeline event")?;
            events.push(event);
        }

        Ok(events)
    }

    async fn write_jsonl_gz(&self, path: &PathBuf, events: &[TimelineEvent]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

        for event in events {
            let json = serde_json::to_string(event).context("failed to serialize event")?;
            encoder
                .write_all(json.as_bytes())
                .context("failed to write event")?;
            encoder.write_all(b"\n").context("failed to write newline")?;
        }

        let compressed = encoder.finish().context("failed to finish compression")?;
        tokio::fs::write(path, compressed)
            .await
            .context("failed to write event log file")?;

        Ok(())
    }

    async fn get_log_files(&self, execution_id: &ExecutionId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let filename = format!("{}.jsonl.gz", execution_id);

        for year_entry in std::fs::read_dir(&events_dir).context("failed to read events dir")? {
            let year_entry = year_entry.context("failed to read year entry")?;
            if !year_entry.path().is_dir() {
                continue;
            }

            for month_entry in
                std::fs::read_dir(year_entry.path()).context("failed to read month dir")?
            {
                let month_entry = month_entry.context("failed to read month entry")?;
                if !month_entry.path().is_dir() {
                    continue;
                }

                for day_entry in
                    std::fs::read_dir(month_entry.path()).context("failed to read day dir")?
                {
                    let day_entry = day_entry.context("failed to read day entry")?;
                    if !day_entry.path().is_dir() {
                        continue;
                    }

                    let log_file = day_entry.path().join(&filename);
                    if log_file.exists() {
                        files.push(log_file);
                    }
                }
            }
        }

        Ok(files)
    }
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: TimelineEvent) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        buffer.push(event);

        if buffer.len() > 100 {
            drop(buffer);
            self.flush_all().await?;
        }

        Ok(())
    }

    async fn get_execution_events(&self, execution_id: ExecutionId) -> Result<Vec<TimelineEvent>> {
        self.flush_all().await?;

        let log_files = self.get_log_files(&execution_id).await?;
        let mut all_events = Vec::new();

        for file in log_files {
            all_events.extend(self.read_jsonl_gz(&file).await?);
        }

        all_events.sort_by_key(|e| e.timestamp);
        Ok(all_events)
    }

    async fn get_execution_events_range(
        &self,
        execution_id: ExecutionId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimelineEvent>> {
        let all_events = self.get_execution_events(execution_id).await?;
        Ok(all_events
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TimelineEventType;
    use crate::types::WorkflowId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_and_reads_back_events_for_an_execution() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let execution_id = ExecutionId::new();
        let event = TimelineEvent::new(
            execution_id,
            TimelineEventType::WorkflowStarted {
                workflow_id: WorkflowId::new("etl-pipeline"),
                workflow_version: 1,
            },
        );

        log.append(event.clone()).await.unwrap();
        log.flush_all().await.unwrap();

        let events = log.get_execution_events(execution_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
    }

    #[tokio::test]
    async fn filters_events_by_time_range() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        let execution_id = ExecutionId::new();

        log.append(TimelineEvent::new(
            execution_id,
            TimelineEventType::WorkflowStarted {
                workflow_id: WorkflowId::new("etl-pipeline"),
                workflow_version: 1,
            },
        ))
        .await
        .unwrap();
        log.flush_all().await.unwrap();

        let future = Utc::now() + chrono::Duration::days(1);
        let events = log
            .get_execution_events_range(execution_id, future, future)
            .await
            .unwrap();
        assert!(events.is_empty());
    }
}
