use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Polls `probe` every `interval`, starting right away, until it yields a value or `timeout`
/// expires. Returns `Ok(None)` on timeout; a probe error ends the wait.
pub(crate) async fn poll_with_deadline<T, E, F>(
    interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Result<Option<T>, E>,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => return Ok(None),
            _ = ticker.tick() => {
                if let Some(value) = probe()? {
                    return Ok(Some(value));
                }
            }
        }
    }
}
