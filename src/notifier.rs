use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::debug;

#[derive(Debug)]
struct Flags {
    run: AtomicBool,
    start: AtomicBool,
    hangup: AtomicBool,
    child: AtomicBool,
}

/// Translates process signals into flags the supervision loop reads once
/// per cycle. SIGTERM/SIGINT end the loop, SIGHUP reopens the log, SIGUSR1
/// switches to start-mode, SIGUSR2 to stop-mode, SIGCHLD skips the next
/// idle sleep.
#[derive(Debug, Clone)]
pub struct Notifier {
    flags: Arc<Flags>,
}

impl Notifier {
    pub fn new(start: bool) -> Self {
        Self {
            flags: Arc::new(Flags {
                run: AtomicBool::new(true),
                start: AtomicBool::new(start),
                hangup: AtomicBool::new(false),
                child: AtomicBool::new(false),
            }),
        }
    }

    /// Installs the handlers once at startup; each signal gets its own
    /// stream and a flag-setting task.
    pub fn install(&self) -> Result<()> {
        self.watch(SignalKind::terminate(), |flags| {
            flags.run.store(false, Ordering::SeqCst)
        })?;
        self.watch(SignalKind::interrupt(), |flags| {
            flags.run.store(false, Ordering::SeqCst)
        })?;
        self.watch(SignalKind::hangup(), |flags| {
            flags.hangup.store(true, Ordering::SeqCst)
        })?;
        self.watch(SignalKind::user_defined1(), |flags| {
            flags.start.store(true, Ordering::SeqCst)
        })?;
        self.watch(SignalKind::user_defined2(), |flags| {
            flags.start.store(false, Ordering::SeqCst)
        })?;
        self.watch(SignalKind::child(), |flags| {
            flags.child.store(true, Ordering::SeqCst)
        })?;
        Ok(())
    }

    fn watch(
        &self,
        kind: SignalKind,
        apply: impl Fn(&Flags) + Send + 'static,
    ) -> Result<()> {
        let mut stream = signal(kind)
            .with_context(|| format!("failed to install handler for signal {kind:?}"))?;
        let flags = Arc::clone(&self.flags);
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!("received signal {kind:?}");
                apply(&flags);
            }
        });
        Ok(())
    }

    /// False once an orderly shutdown was requested.
    pub fn keep_running(&self) -> bool {
        self.flags.run.load(Ordering::SeqCst)
    }

    /// Start-semantics when true, stop-semantics otherwise.
    pub fn start_mode(&self) -> bool {
        self.flags.start.load(Ordering::SeqCst)
    }

    /// Consumes a pending log-reopen request.
    pub fn take_hangup(&self) -> bool {
        self.flags.hangup.swap(false, Ordering::SeqCst)
    }

    /// Consumes a pending child-exit observation.
    pub fn take_child(&self) -> bool {
        self.flags.child.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::Notifier;

    #[test]
    fn fresh_notifier_runs_with_the_seeded_intent() {
        let notifier = Notifier::new(true);
        assert!(notifier.keep_running());
        assert!(notifier.start_mode());
        assert!(!Notifier::new(false).start_mode());
    }

    #[test]
    fn take_flags_consume_exactly_one_observation() {
        let notifier = Notifier::new(true);
        assert!(!notifier.take_hangup());
        assert!(!notifier.take_child());
    }

    #[tokio::test]
    async fn signals_delivered_to_ourselves_flip_the_flags() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let notifier = Notifier::new(false);
        notifier.install().expect("install failed");

        let me = Pid::this();
        kill(me, Signal::SIGUSR1).expect("failed to raise SIGUSR1");
        wait_for(|| notifier.start_mode()).await;

        kill(me, Signal::SIGHUP).expect("failed to raise SIGHUP");
        wait_for(|| notifier.take_hangup()).await;

        kill(me, Signal::SIGUSR2).expect("failed to raise SIGUSR2");
        wait_for(|| !notifier.start_mode()).await;
    }

    async fn wait_for(predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("flag was not raised in time");
    }
}
