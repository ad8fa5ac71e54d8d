//! Forwards coordinator transitions into a [`HandlerRuntime`].

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;

use chainsync_core::coordinator::SyncTransition;

use crate::error::RuntimeError;
use crate::runtime::HandlerRuntime;

/// Drive `runtime` from `transitions` until the channel closes.
///
/// Checkpoints and reorgs are handled on spawned tasks, so the receiver
/// keeps up while a drain or a replay is in flight and a later reorg
/// cancels the older work. Returns the first error of any task.
pub async fn run_driver(
    runtime: HandlerRuntime,
    mut transitions: broadcast::Receiver<SyncTransition>,
) -> Result<(), RuntimeError> {
    let mut drains: JoinSet<Result<(), RuntimeError>> = JoinSet::new();

    loop {
        tokio::select! {
            Some(joined) = drains.join_next(), if !drains.is_empty() => {
                settle(joined)?;
            }
            received = transitions.recv() => match received {
                Ok(SyncTransition::NewCheckpoint(checkpoint)) => {
                    let runtime = runtime.clone();
                    drains.spawn(async move {
                        runtime.process_events(checkpoint.block_timestamp).await
                    });
                }
                Ok(SyncTransition::Reorg(checkpoint)) => {
                    let runtime = runtime.clone();
                    drains.spawn(async move {
                        runtime.handle_reorg(checkpoint.block_timestamp).await
                    });
                }
                Ok(transition) => {
                    tracing::trace!(service = "handlers", ?transition, "Ignored transition");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(service = "handlers", skipped, "Transition receiver lagged");
                    let to_timestamp = runtime.coordinator().checkpoint().block_timestamp;
                    let runtime = runtime.clone();
                    drains.spawn(async move { runtime.process_events(to_timestamp).await });
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    while let Some(joined) = drains.join_next().await {
        settle(joined)?;
    }
    Ok(())
}

fn settle(
    joined: Result<Result<(), RuntimeError>, tokio::task::JoinError>,
) -> Result<(), RuntimeError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Ok(()),
    }
}
