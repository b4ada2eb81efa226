use std::{
    error::Error,
    fmt,
    sync::{
        Arc, LazyLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

static NEVER_CANCELS_SOURCE: LazyLock<CancellationTokenSource> =
    LazyLock::new(CancellationTokenSource::new);

pub struct CancelledError;

impl fmt::Debug for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

/// Turns any error type `E` into a cancellable error type.
///
/// A function that returns `Result<T, Cancellable<E>>` can return
/// `Err(Cancellable::Cancelled)` to indicate that the operation was
/// cancelled.
///
/// If `E` can represent the cancellation state, the user can provide
/// an implementation of `From<CancelledError>` for `E` to convert
/// `Cancellable::Cancelled` into `E` automatically.
#[derive(Debug)]
pub enum Cancellable<E> {
    Cancelled,
    Error(E),
}

impl<E: From<CancelledError>> Cancellable<E> {
    /// Flatten `Cancellable<E>` into `E`.
    ///
    /// This relies on the `From<CancelledError>` implementation for `E`.
    pub fn flatten(self) -> E {
        match self {
            Cancellable::Cancelled => E::from(CancelledError),
            Cancellable::Error(e) => e,
        }
    }
}

impl<E> From<CancelledError> for Cancellable<E> {
    fn from(_: CancelledError) -> Self {
        Cancellable::Cancelled
    }
}

impl<E: Error> From<E> for Cancellable<E> {
    fn from(err: E) -> Self {
        Cancellable::Error(err)
    }
}

/// Inner structure for [CancellationTokenSource].
#[derive(Default, Debug)]
struct InnerSource {
    request_id: AtomicU64,
}

/// A source of cancellation tokens that can be used to signal cancellation
/// requests to in-flight migration work.
///
/// [CancellationToken]s are issued with `.token()`. `.cancel()` cancels all
/// tokens issued so far. If the [CancellationTokenSource] is dropped, all
/// tokens issued from it are considered cancelled.
///
/// The CLI owns one source per run and cancels it on Ctrl-C; the orchestrator,
/// pool and executor only ever see tokens. Tasks check the token at their
/// suspension points: before dispatching a batch, while waiting on a pool
/// permit, between retry attempts.
#[derive(Clone, Default, Debug)]
pub struct CancellationTokenSource {
    inner: Arc<InnerSource>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        let inner = Arc::new(InnerSource {
            request_id: AtomicU64::new(0),
        });
        CancellationTokenSource { inner }
    }

    /// Issues a fresh cancellation token from this source.
    pub fn token(&self) -> CancellationToken {
        let request_id = self.inner.request_id.load(Ordering::Acquire);
        CancellationToken::new(Arc::downgrade(&self.inner), request_id)
    }

    /// Cancels all tokens created from this source so far.
    #[inline]
    pub fn cancel(&self) {
        self.inner.request_id.fetch_add(1, Ordering::AcqRel);
    }
}

/// Internal trait for cancellation token implementations.
trait CancellationTokenLike: fmt::Debug + Send + Sync + 'static {
    fn is_cancelled(&self) -> bool;
    fn clone_box(&self) -> Box<dyn CancellationTokenLike>;
}

#[derive(Clone, Debug)]
struct CancellationTokenImpl {
    source: Weak<InnerSource>,
    request_id: u64,
}

impl CancellationTokenLike for CancellationTokenImpl {
    fn is_cancelled(&self) -> bool {
        if let Some(source) = self.source.upgrade() {
            return source.request_id.load(Ordering::Acquire) > self.request_id;
        }
        true // CancellationTokenSource has been dropped
    }

    fn clone_box(&self) -> Box<dyn CancellationTokenLike> {
        Box::new(self.clone())
    }
}

/// Implementation used by [CancellationToken::combine_with_flag()].
#[derive(Debug)]
struct CancellationTokenWithFlagImpl {
    inner: Box<dyn CancellationTokenLike>,
    should_cancel_flag: Arc<AtomicBool>,
}

impl Clone for CancellationTokenWithFlagImpl {
    fn clone(&self) -> Self {
        CancellationTokenWithFlagImpl {
            inner: self.inner.clone_box(),
            should_cancel_flag: Arc::clone(&self.should_cancel_flag),
        }
    }
}

impl CancellationTokenLike for CancellationTokenWithFlagImpl {
    fn is_cancelled(&self) -> bool {
        if self.should_cancel_flag.load(Ordering::Acquire) {
            return true;
        }
        self.inner.is_cancelled()
    }

    fn clone_box(&self) -> Box<dyn CancellationTokenLike> {
        Box::new(self.clone())
    }
}

/// A cancellation token that can be used to check for cancellation requests.
///
/// A token is created from a [CancellationTokenSource]. Once the source
/// cancels, `is_cancelled()` returns `true` on every token issued before the
/// cancel. Tasks check the state periodically with `check_cancellation()` or
/// `is_cancelled()`; already-issued network requests are allowed to finish so
/// their pool permits release cleanly.
#[derive(Debug)]
pub struct CancellationToken {
    inner: Box<dyn CancellationTokenLike>,
}

impl Clone for CancellationToken {
    fn clone(&self) -> Self {
        CancellationToken {
            inner: self.inner.clone_box(),
        }
    }
}

impl CancellationToken {
    /// Private constructor for [CancellationToken].
    ///
    /// Use [CancellationTokenSource::token()] or, for tests,
    /// [CancellationToken::never_cancels()], to create instances.
    fn new(source: Weak<InnerSource>, request_id: u64) -> Self {
        let inner = Box::new(CancellationTokenImpl { source, request_id });
        Self { inner }
    }

    /// Creates a cancellation token that never cancels.
    ///
    /// Useful in tests and as an escape hatch when cancellation tokens
    /// haven't been passed through call chains yet.
    pub fn never_cancels() -> Self {
        NEVER_CANCELS_SOURCE.token()
    }

    /// Checks if the token has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Checks if the token has been cancelled and returns a `Result`.
    ///
    /// `token.check_cancellation()?;` can be used in functions that return:
    ///
    /// - `Result<T, E>` for any `E` that implements `From<CancelledError>`
    /// - `Result<T, Cancellable<E>>` for any `E`
    /// - `Result<T, CancelledError>`
    #[inline]
    pub fn check_cancellation(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Combines this cancellation token with a flag that can be set to cancel.
    ///
    /// The combined token is cancelled if either the original token is
    /// cancelled or the shared `should_cancel_flag` is set to `true`. The
    /// bulk executor uses this to fan a "first batch failed" signal out to
    /// the remaining in-flight batches without cancelling the whole run.
    pub fn combine_with_flag(self, should_cancel_flag: Arc<AtomicBool>) -> CancellationToken {
        let inner = Box::new(CancellationTokenWithFlagImpl {
            inner: self.inner,
            should_cancel_flag,
        });
        CancellationToken { inner }
    }
}

/// Creates a cancellation token that never cancels.
pub fn never_cancels() -> CancellationToken {
    CancellationToken::never_cancels()
}
