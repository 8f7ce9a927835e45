//! Per-session run state: running/paused flags, the abort signal and the moderator
//! interjection queue.
//!
//! Flags live in a [`tokio::sync::watch`] channel so that a waiter always observes the latest
//! value. A resume that happens before [`RunControl::wait_until_resumed`] is called is therefore
//! never missed, and no waiter polls.
//!
//! Invariant: `paused` implies `running`. Every transition below preserves it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;

/// Snapshot of the run flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub running: bool,
    pub paused: bool,
    /// Set by an explicit stop. In-flight streams watch this to cut their transport.
    pub aborted: bool,
}

/// Shared handle to a session's run state.
pub struct RunControl {
    flags: watch::Sender<RunFlags>,
    interjections: Mutex<VecDeque<String>>,
    current_round: AtomicU32,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (flags, _) = watch::channel(RunFlags::default());
        Self {
            flags,
            interjections: Mutex::new(VecDeque::new()),
            current_round: AtomicU32::new(0),
        }
    }

    pub fn flags(&self) -> RunFlags {
        *self.flags.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.flags().running
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    pub fn is_aborted(&self) -> bool {
        self.flags().aborted
    }

    /// Mark the run as started. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        self.flags.send_if_modified(|f| {
            if f.running {
                return false;
            }
            *f = RunFlags {
                running: true,
                paused: false,
                aborted: false,
            };
            true
        })
    }

    /// Returns `false` unless the run was running and not yet paused.
    pub fn pause(&self) -> bool {
        self.flags.send_if_modified(|f| {
            if !f.running || f.paused {
                return false;
            }
            f.paused = true;
            true
        })
    }

    /// Returns `false` if the run was not paused.
    pub fn resume(&self) -> bool {
        self.flags.send_if_modified(|f| {
            if !f.paused {
                return false;
            }
            f.paused = false;
            true
        })
    }

    /// Cooperative stop: no new turn starts, an in-flight turn is left to finish.
    pub fn halt(&self) {
        self.flags.send_modify(|f| {
            f.running = false;
            f.paused = false;
        });
    }

    /// Hard stop: like [`halt`](Self::halt), and in-flight streams are told to stop.
    pub fn abort(&self) {
        self.flags.send_modify(|f| {
            f.running = false;
            f.paused = false;
            f.aborted = true;
        });
    }

    /// Forget an earlier abort so a stopped session can run single turns again (operator
    /// retries). No effect while a run is in progress.
    pub fn clear_abort(&self) -> bool {
        self.flags.send_if_modified(|f| {
            if f.running || !f.aborted {
                return false;
            }
            f.aborted = false;
            true
        })
    }

    /// Normal completion of all rounds.
    pub fn finish(&self) {
        self.halt();
    }

    /// Queue a moderator interjection for the next turn.
    ///
    /// If the run is paused it is resumed; the return value says whether that happened.
    pub fn queue_interjection(&self, text: impl Into<String>) -> bool {
        self.queue().push_back(text.into());
        self.resume()
    }

    /// Take every queued interjection at once, joined by a blank line.
    pub fn drain_interjections(&self) -> Option<String> {
        let drained = std::mem::take(&mut *self.queue());
        if drained.is_empty() {
            return None;
        }
        Some(drained.into_iter().collect::<Vec<_>>().join("\n\n"))
    }

    /// Put undelivered interjection text back at the head of the queue without resuming.
    pub fn requeue_interjection(&self, text: impl Into<String>) {
        self.queue().push_front(text.into());
    }

    pub fn pending_interjections(&self) -> usize {
        self.queue().len()
    }

    /// Suspend until the run is no longer paused.
    ///
    /// Returns whether the run is still running afterwards, so a stop issued while paused
    /// ends the wait too.
    pub async fn wait_until_resumed(&self) -> bool {
        let mut rx = self.flags.subscribe();
        // The borrowed `Ref` must be released before `rx` goes out of scope.
        let running = match rx.wait_for(|f| !f.paused).await {
            Ok(flags) => flags.running,
            Err(_) => false,
        };
        running
    }

    /// Resolves once the run has been aborted.
    pub async fn aborted(&self) {
        let mut rx = self.flags.subscribe();
        let _ = rx.wait_for(|f| f.aborted).await;
    }

    pub fn current_round(&self) -> u32 {
        self.current_round.load(Ordering::SeqCst)
    }

    pub fn set_current_round(&self, round: u32) {
        self.current_round.store(round, Ordering::SeqCst);
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.interjections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn transitions_keep_paused_within_running() {
        let control = RunControl::new();
        assert!(!control.pause());
        assert!(control.start());
        assert!(!control.start());
        assert!(control.pause());
        assert!(!control.pause());
        control.halt();
        let flags = control.flags();
        assert!(!flags.running && !flags.paused);
    }

    #[test]
    fn drain_joins_and_empties_queue() {
        let control = RunControl::new();
        control.queue_interjection("first");
        control.queue_interjection("second");
        assert_eq!(
            control.drain_interjections().as_deref(),
            Some("first\n\nsecond")
        );
        assert_eq!(control.drain_interjections(), None);
    }

    #[test]
    fn requeued_text_is_drained_first_without_resuming() {
        let control = RunControl::new();
        control.start();
        control.pause();
        control.queue_interjection("later");
        control.pause();
        control.requeue_interjection("earlier");
        assert!(control.is_paused());
        assert_eq!(
            control.drain_interjections().as_deref(),
            Some("earlier\n\nlater")
        );
    }

    #[test]
    fn interjection_resumes_a_paused_run() {
        let control = RunControl::new();
        control.start();
        control.pause();
        assert!(control.queue_interjection("look at costs"));
        assert!(!control.is_paused());
        assert_eq!(control.pending_interjections(), 1);
    }

    #[tokio::test]
    async fn resume_before_wait_is_not_lost() {
        let control = RunControl::new();
        control.start();
        control.pause();
        control.resume();
        assert!(control.wait_until_resumed().await);
    }

    #[tokio::test]
    async fn waiter_wakes_on_resume_and_on_stop() {
        let control = Arc::new(RunControl::new());
        control.start();
        control.pause();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_until_resumed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.resume();
        assert!(waiter.await.unwrap());

        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_until_resumed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.abort();
        assert!(!waiter.await.unwrap());
    }
}
