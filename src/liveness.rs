//! Liveness prober.
//!
//! Commits a self-conflicting no-op transaction on a fixed period to
//! assert the database is still accepting writes. The probe loop never
//! completes normally; it resolves only with the error that ended it, so
//! callers race it against the work it guards.

use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::{debug, error};
use uuid::Uuid;

use crate::db::{Db, DbError, KvTransaction};
use crate::error::HarnessError;

/// Commit one self-conflicting probe transaction, retrying transient
/// errors indefinitely through the client's `on_error` backoff.
pub async fn ping_database(db: &Db) -> Result<(), HarnessError> {
    let mut tr = db.begin().await.map_err(HarnessError::from)?;
    loop {
        match ping_once(tr.as_mut()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!(%err, "database ping transaction error");
                tr.on_error(err).await.map_err(HarnessError::from)?;
            }
        }
    }
}

async fn ping_once(tr: &mut dyn KvTransaction) -> Result<(), DbError> {
    tr.set_priority_system_immediate();
    tr.set_lock_aware();
    let key = format!("/Liveness/{}", Uuid::new_v4());
    let _ = tr.get(key.as_bytes()).await?;
    tr.make_self_conflicting();
    tr.commit().await
}

/// Probe the database every `ping_delay` until a ping fails or times out.
///
/// Resolves to the terminating error; a ping slower than the period is a
/// liveness failure in itself and resolves `TimedOut`.
pub async fn database_liveness(
    db: Db,
    ping_delay: Duration,
    context: &'static str,
    start_delay: Duration,
) -> HarnessError {
    sleep(start_delay).await;
    loop {
        let started = Instant::now();
        debug!(context, "pinging database liveness");
        match timeout(ping_delay, ping_database(&db)).await {
            Ok(Ok(())) => {
                let ping_time = started.elapsed();
                debug!(context, ping_secs = ping_time.as_secs_f64(), "database ping complete");
                sleep(ping_delay.saturating_sub(ping_time)).await;
            }
            Ok(Err(err)) => {
                error!(
                    context,
                    %err,
                    ping_delay_secs = ping_delay.as_secs_f64(),
                    "database liveness ping failed"
                );
                return err;
            }
            Err(_elapsed) => {
                error!(
                    context,
                    ping_delay_secs = ping_delay.as_secs_f64(),
                    "database liveness ping timed out"
                );
                return HarnessError::TimedOut;
            }
        }
    }
}
