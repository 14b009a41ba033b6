//! Background loops for interactions, posting, and timeline actions.
//!
//! All loops share one [`CancellationToken`]. Cancelling it interrupts waits
//! immediately. Work in progress is never dropped mid-flight: a pass stops
//! between posts, and a post that is being published finishes, so nothing is
//! left posted without its record. [`Scheduler::run`] returns once every
//! loop has exited.

use crate::actions::ActionProcessor;
use crate::interactions::InteractionClient;
use crate::posting::PostPublisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait after a failed action cycle.
const ACTION_RETRY_DELAY: Duration = Duration::from_secs(30);

pub struct Scheduler {
    interactions: Arc<InteractionClient>,
    poll_interval: Duration,
    publisher: Option<(Arc<PostPublisher>, bool)>,
    actions: Option<(Arc<ActionProcessor>, Duration)>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        interactions: Arc<InteractionClient>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interactions,
            poll_interval,
            publisher: None,
            actions: None,
            cancel,
        }
    }

    /// Also run the posting loop. With `post_immediately`, the first post is
    /// attempted at startup regardless of the last-post marker.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<PostPublisher>, post_immediately: bool) -> Self {
        self.publisher = Some((publisher, post_immediately));
        self
    }

    #[must_use]
    pub fn with_actions(mut self, processor: Arc<ActionProcessor>, interval: Duration) -> Self {
        self.actions = Some((processor, interval));
        self
    }

    /// Token that stops every loop when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();

        tasks.spawn(interaction_loop(
            self.interactions,
            self.poll_interval,
            self.cancel.clone(),
        ));
        if let Some((publisher, immediately)) = self.publisher {
            tasks.spawn(posting_loop(publisher, immediately, self.cancel.clone()));
        }
        if let Some((processor, interval)) = self.actions {
            tasks.spawn(action_loop(processor, interval, self.cancel.clone()));
        }

        info!(loops = tasks.len(), "scheduler started");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "scheduler loop panicked");
                self.cancel.cancel();
            }
        }
        info!("scheduler stopped");
    }
}

async fn interaction_loop(client: Arc<InteractionClient>, interval: Duration, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        if let Err(e) = client.handle_interactions_until(&cancel).await {
            warn!(error = %e, transient = e.is_transient(), "interaction pass failed");
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    debug!("interaction loop exited");
}

async fn posting_loop(publisher: Arc<PostPublisher>, immediately: bool, cancel: CancellationToken) {
    if immediately && !cancel.is_cancelled() {
        if let Err(e) = publisher.publish().await {
            warn!(error = %e, "startup post failed");
        }
    }
    while !cancel.is_cancelled() {
        let delay = publisher.tick().await;
        info!(minutes = delay.as_secs() / 60, "next post check scheduled");
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    debug!("posting loop exited");
}

async fn action_loop(processor: Arc<ActionProcessor>, interval: Duration, cancel: CancellationToken) {
    while !processor.is_stopped() && !cancel.is_cancelled() {
        let wait = match processor.process_timeline_until(&cancel).await {
            Ok(_) => interval,
            Err(e) => {
                warn!(error = %e, "timeline action cycle failed");
                ACTION_RETRY_DELAY
            }
        };
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }
    }
    debug!("action loop exited");
}
