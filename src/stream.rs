//! Bridges callback-style token delivery into a pull-based [`Stream`].
//!
//! The producer side ([`TokenSink`]) appends tokens to an unbounded FIFO queue
//! and finally marks the queue completed, optionally recording an error. The
//! consumer side ([`TokenStream`]) drains the queue in order, parks while it is
//! empty and not completed, and ends with the recorded error, if any, once the
//! queue is drained.
//!
//! The queue is unbounded: a slow consumer never blocks the producer. An
//! answer is capped by the configured maximum generation length, which bounds
//! memory in practice.

use futures::{FutureExt, Stream};
use log::error;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RagError;

/// Where a token stream is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// More tokens may still arrive
    Streaming,
    /// Every token was delivered and the producer finished cleanly
    Completed,
    /// The producer failed; the error ends the sequence
    Failed,
    /// The consumer gave up before the producer finished
    Cancelled,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    completed: bool,
    error: Option<RagError>,
    waker: Option<Waker>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is always left consistent, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(state: &mut QueueState) {
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

/// Producer half: hand tokens over as the generator emits them
#[derive(Clone)]
pub struct TokenSink {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl TokenSink {
    /// Enqueue a token. Ignored once the stream is completed or cancelled.
    pub fn push(&self, token: String) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut state = self.shared.lock();
        if state.completed {
            return;
        }
        state.queue.push_back(token);
        Shared::wake(&mut state);
    }

    /// Mark the sequence finished. Later calls have no effect.
    pub fn complete(&self) {
        let mut state = self.shared.lock();
        state.completed = true;
        Shared::wake(&mut state);
    }

    /// Record a failure and finish the sequence. Only the first outcome counts.
    pub fn fail(&self, error: RagError) {
        let mut state = self.shared.lock();
        if !state.completed {
            state.error = Some(error);
            state.completed = true;
        }
        Shared::wake(&mut state);
    }

    /// Raised when the consumer has stopped listening
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Consumer half: yields tokens in the exact order they were pushed.
///
/// Single subscriber and not restartable. Dropping it cancels the producer.
pub struct TokenStream {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    status: StreamStatus,
}

impl TokenStream {
    /// A connected sink and stream with no producer task attached
    pub fn pair() -> (TokenSink, TokenStream) {
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();

        let sink = TokenSink {
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        let stream = TokenStream {
            shared,
            cancel,
            producer: None,
            status: StreamStatus::Streaming,
        };
        (sink, stream)
    }

    /// Run `producer` on the runtime, completing the stream when it returns
    /// `Ok` and failing it with the error otherwise. A panicking producer
    /// fails the stream too.
    pub fn spawn<F, Fut>(producer: F) -> TokenStream
    where
        F: FnOnce(TokenSink) -> Fut,
        Fut: Future<Output = Result<(), RagError>> + Send + 'static,
    {
        let (sink, mut stream) = TokenStream::pair();
        let work = producer(sink.clone());

        stream.producer = Some(tokio::spawn(async move {
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(())) => sink.complete(),
                Ok(Err(e)) => sink.fail(e),
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!("Token producer panicked: {}", reason);
                    sink.fail(RagError::Generation(format!("producer panicked: {}", reason)));
                }
            }
        }));
        stream
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    /// Stop delivering tokens and ask the producer to stop.
    ///
    /// The stream then ends as [`StreamStatus::Cancelled`], even if the
    /// producer keeps running for a while.
    pub fn cancel(&mut self) {
        if self.status != StreamStatus::Streaming {
            return;
        }
        self.cancel.cancel();
        self.status = StreamStatus::Cancelled;

        let mut state = self.shared.lock();
        state.queue.clear();
        Shared::wake(&mut state);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

impl Stream for TokenStream {
    type Item = Result<String, RagError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.status != StreamStatus::Streaming {
            return Poll::Ready(None);
        }

        let mut state = this.shared.lock();
        if let Some(token) = state.queue.pop_front() {
            return Poll::Ready(Some(Ok(token)));
        }

        if state.completed {
            return match state.error.take() {
                Some(error) => {
                    this.status = StreamStatus::Failed;
                    Poll::Ready(Some(Err(error)))
                }
                None => {
                    this.status = StreamStatus::Completed;
                    Poll::Ready(None)
                }
            };
        }

        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_tokens_arrive_in_push_order() {
        let (sink, stream) = TokenStream::pair();
        for token in ["The", " capital", " is", " Paris"] {
            sink.push(token.to_string());
        }
        sink.complete();

        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["The", " capital", " is", " Paris"]);
    }

    #[tokio::test]
    async fn test_consumer_waits_for_late_tokens() {
        let mut stream = TokenStream::spawn(|sink| async move {
            for i in 0..5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink.push(i.to_string());
            }
            Ok(())
        });

        let mut seen = String::new();
        while let Some(token) = stream.next().await {
            seen.push_str(&token.unwrap());
        }

        assert_eq!(seen, "01234");
        assert_eq!(stream.status(), StreamStatus::Completed);
    }

    #[tokio::test]
    async fn test_error_follows_delivered_tokens() {
        let mut stream = TokenStream::spawn(|sink| async move {
            sink.push("partial".to_string());
            Err(RagError::Generation("model crashed".to_string()))
        });

        assert_eq!(stream.next().await, Some(Ok("partial".to_string())));
        assert_eq!(
            stream.next().await,
            Some(Err(RagError::Generation("model crashed".to_string())))
        );
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.status(), StreamStatus::Failed);
    }

    #[tokio::test]
    async fn test_producer_panic_fails_stream() {
        let mut stream = TokenStream::spawn(|sink| async move {
            sink.push("a".to_string());
            if sink.cancellation().is_cancelled() {
                return Ok(());
            }
            panic!("tokenizer exploded");
        });

        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        let last = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream must end after the producer panics");
        assert_eq!(
            last,
            Some(Err(RagError::Generation(
                "producer panicked: tokenizer exploded".to_string()
            )))
        );
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.status(), StreamStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_generation_completes() {
        let mut stream = TokenStream::spawn(|_sink| async move { Ok(()) });

        assert_eq!(stream.next().await, None);
        assert_eq!(stream.status(), StreamStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_and_signals_producer() {
        let stopped = Arc::new(AtomicBool::new(false));
        let observed = stopped.clone();

        let mut stream = TokenStream::spawn(|sink| async move {
            sink.push("first".to_string());
            sink.cancellation().cancelled().await;
            observed.store(true, Ordering::SeqCst);
            sink.push("ignored".to_string());
            Ok(())
        });

        assert_eq!(stream.next().await, Some(Ok("first".to_string())));
        stream.cancel();

        assert_eq!(stream.next().await, None);
        assert_eq!(stream.status(), StreamStatus::Cancelled);

        for _ in 0..50 {
            if stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_cancels_producer() {
        let (sink, stream) = TokenStream::pair();
        drop(stream);

        assert!(sink.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_only_first_outcome_counts() {
        let (sink, mut stream) = TokenStream::pair();
        sink.complete();
        sink.fail(RagError::Generation("too late".to_string()));
        sink.push("too late".to_string());

        assert_eq!(stream.next().await, None);
        assert_eq!(stream.status(), StreamStatus::Completed);
    }
}
