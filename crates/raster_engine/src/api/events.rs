//! Draw-completion observer contract

/// External observer notified around a draw's lifetime.
///
/// `start` is called when the draw is accepted, `finish` after its last batch
/// retires. A draw that fails to build its routines still calls both, so
/// fences waiting on the observer never deadlock.
pub trait TaskEvents: Send + Sync {
    /// The draw has been accepted and work is outstanding
    fn start(&self);
    /// All work for the draw has retired
    fn finish(&self);
}
