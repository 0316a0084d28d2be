//! Bounded polling for asynchronous conditions.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
#[error("condition not met after {waited:?}")]
pub struct WaitTimeout {
    pub waited: Duration,
}

/// Poll `condition` every `poll` until it holds or `deadline` has passed.
pub async fn wait_until<F>(
    deadline: Duration,
    poll: Duration,
    mut condition: F,
) -> Result<(), WaitTimeout>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= deadline {
            return Err(WaitTimeout { waited });
        }
        tokio::time::sleep(poll).await;
    }
}
