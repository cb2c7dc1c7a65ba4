use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::Stream;
use relay_kernel::Event;
use tokio::sync::mpsc;

use crate::error::RunnerError;
use crate::graph::RunOutput;

/// A run and its event feed as one stream. The run is polled in place rather
/// than spawned, so dropping the stream abandons the run at its current await
/// point and releases whatever the run future owns (thread guard included).
pub struct EngineStream {
    run: Option<BoxFuture<'static, Result<RunOutput, RunnerError>>>,
    events: mpsc::UnboundedReceiver<Event>,
    outcome: Option<Result<RunOutput, RunnerError>>,
    output: Option<RunOutput>,
}

impl EngineStream {
    pub fn new<F>(run: F, events: mpsc::UnboundedReceiver<Event>) -> Self
    where
        F: Future<Output = Result<RunOutput, RunnerError>> + Send + 'static,
    {
        Self {
            run: Some(Box::pin(run)),
            events,
            outcome: None,
            output: None,
        }
    }

    /// Final state, available once the stream has ended without error.
    pub fn output(&self) -> Option<&RunOutput> {
        self.output.as_ref()
    }
}

impl Stream for EngineStream {
    type Item = Result<Event, RunnerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(run) = this.run.as_mut() {
            if let Poll::Ready(outcome) = run.as_mut().poll(cx) {
                // Dropping the future drops the sink, which closes the channel.
                this.run = None;
                this.outcome = Some(outcome);
            }
        }

        match this.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => return Poll::Ready(Some(Ok(event))),
            Poll::Pending if this.run.is_some() => return Poll::Pending,
            Poll::Ready(None) if this.run.is_some() => return Poll::Pending,
            _ => {}
        }

        match this.outcome.take() {
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            Some(Ok(output)) => {
                this.output = Some(output);
                Poll::Ready(None)
            }
            None => Poll::Ready(None),
        }
    }
}
