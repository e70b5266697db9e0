use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::metrics::{IPS_APPENDED, LINES_TOTAL, SESSIONS_CREATED, SIGHTINGS_TOTAL, STORE_ERRORS};
use crate::models::UpsertOutcome;
use crate::parser::parse_line;
use crate::store::SessionStore;

/// Why an ingestion run returned.
#[derive(Debug)]
pub enum StreamEnd {
    /// The source ran out of lines (connection closed).
    Closed,
    /// Reading from the source failed.
    Failed(Error),
    Cancelled,
}

// Applies parsed log lines to the session store, one line at a time
pub struct Ingestor {
    sessions: Arc<dyn SessionStore>,
    // From static config, never from the message
    limit: i64,
}

impl Ingestor {
    pub fn new(sessions: Arc<dyn SessionStore>, limit: i64) -> Self {
        Self { sessions, limit }
    }

    /// Parse one line and upsert the sighting. Lines without an address and
    /// an identity are dropped and yield `Ok(None)`.
    pub async fn handle_line(&self, line: &str) -> Result<Option<UpsertOutcome>> {
        LINES_TOTAL.inc();

        let Some(sighting) = parse_line(line) else {
            trace!(line, "No sighting in line");
            return Ok(None);
        };
        SIGHTINGS_TOTAL.inc();

        let outcome = self
            .sessions
            .upsert(&sighting.identity, &sighting.ip, self.limit)
            .await?;

        match outcome {
            UpsertOutcome::Created => SESSIONS_CREATED.inc(),
            UpsertOutcome::Appended => IPS_APPENDED.inc(),
            UpsertOutcome::Unchanged => {}
        }
        debug!(
            identity = %sighting.identity,
            ip = %sighting.ip,
            outcome = ?outcome,
            "Applied sighting"
        );
        Ok(Some(outcome))
    }

    /// Consume `lines` in order until the source ends, fails or `cancel` fires.
    ///
    /// Store failures are logged and skipped; each line is fully applied
    /// before the next one is read.
    pub async fn run<S>(&self, mut lines: S, cancel: &CancellationToken) -> StreamEnd
    where
        S: Stream<Item = Result<String>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                next = lines.next() => next,
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
            };

            match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(line)) => {
                    if let Err(e) = self.handle_line(&line).await {
                        STORE_ERRORS.inc();
                        warn!(error = %e, "Failed to store sighting");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::store::kv::{KvSessionStore, MemoryKv};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use futures::stream;

    fn ingestor(limit: i64) -> (Ingestor, Arc<dyn SessionStore>) {
        let sessions: Arc<dyn SessionStore> =
            Arc::new(KvSessionStore::new(Arc::new(MemoryKv::new())));
        (Ingestor::new(sessions.clone(), limit), sessions)
    }

    fn lines(items: &[&str]) -> impl Stream<Item = Result<String>> + Unpin {
        stream::iter(items.iter().map(|l| Ok(l.to_string())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_matching_line_upserts_with_configured_limit() {
        let (ingestor, sessions) = ingestor(3);

        let outcome = ingestor
            .handle_line("162.1.1.1 connected email: a@b.com")
            .await
            .unwrap();
        assert_eq!(outcome, Some(UpsertOutcome::Created));

        let user = sessions.get("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.active_ips, vec!["162.1.1.1"]);
        assert_eq!(user.limit, 3);
    }

    #[tokio::test]
    async fn test_unparseable_line_has_no_side_effect() {
        let (ingestor, sessions) = ingestor(3);
        assert_eq!(ingestor.handle_line("heartbeat ok").await.unwrap(), None);
        assert!(sessions.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_applies_lines_in_arrival_order() {
        let (ingestor, sessions) = ingestor(2);
        let cancel = CancellationToken::new();

        let end = ingestor
            .run(
                lines(&[
                    "1.1.1.1 accepted email: a@b.com",
                    "noise without marker 5.5.5.5",
                    "2.2.2.2 accepted email: a@b.com",
                    "1.1.1.1 accepted email: a@b.com",
                    "3.3.3.3 accepted email: a@b.com",
                ]),
                &cancel,
            )
            .await;
        assert!(matches!(end, StreamEnd::Closed));

        let user = sessions.get("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.active_ips, vec!["3.3.3.3", "2.2.2.2", "1.1.1.1"]);
    }

    #[tokio::test]
    async fn test_read_error_ends_run() {
        let (ingestor, sessions) = ingestor(1);
        let cancel = CancellationToken::new();
        let items: Vec<Result<String>> = vec![
            Ok("1.1.1.1 email: a@b.com".to_string()),
            Err(Error::Auth("stream dropped".into())),
            Ok("2.2.2.2 email: a@b.com".to_string()),
        ];

        let end = ingestor.run(stream::iter(items), &cancel).await;
        assert!(matches!(end, StreamEnd::Failed(_)));
        let user = sessions.get("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.active_ips, vec!["1.1.1.1"]);
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_run() {
        let (ingestor, _) = ingestor(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let end = ingestor.run(stream::pending::<Result<String>>(), &cancel).await;
        assert!(matches!(end, StreamEnd::Cancelled));
    }

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn get(&self, _: &str) -> Result<Option<User>> {
            Ok(None)
        }
        async fn record_at(
            &self,
            _: &str,
            _: &str,
            _: i64,
            _: DateTime<Utc>,
        ) -> Result<(User, UpsertOutcome)> {
            Err(Error::Io(std::io::Error::other("disk gone")))
        }
        async fn list(&self) -> Result<Vec<User>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn evict_if_idle(&self, _: &str, _: DateTime<Utc>) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_skipped() {
        let ingestor = Ingestor::new(Arc::new(FailingStore), 1);
        let cancel = CancellationToken::new();

        assert!(ingestor.handle_line("1.1.1.1 email: a@b.com").await.is_err());
        let end = ingestor
            .run(
                lines(&["1.1.1.1 email: a@b.com", "2.2.2.2 email: c@d.com"]),
                &cancel,
            )
            .await;
        assert!(matches!(end, StreamEnd::Closed));
    }
}
