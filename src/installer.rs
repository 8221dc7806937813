// src/installer.rs

//! Package installation and rollback
//!
//! `Installer` activates a verified payload through the platform bridge,
//! records it in the `PackageStore`, and optionally arms a rollback
//! deadline. A single deadline state decides the race between the
//! application confirming the update and the deadline firing: whichever is
//! observed first wins and the other is rejected.

use crate::error::{Error, Result};
use crate::packages::{LocalPackageRecord, PackageIdentity, PackageMetadata, RemotePayload};
use crate::platform::PlatformBridge;
use crate::store::{InstallDetails, PackageStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Options for a single `stage` call
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOptions {
    /// Roll back automatically unless confirmed within this many milliseconds
    pub rollback_timeout_ms: Option<u32>,
    /// Install even if the package previously failed to apply
    pub allow_failed: bool,
    /// Restart the application once the package is active
    pub restart: bool,
}

/// What `resume` found for a persisted pending install
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// No install is awaiting confirmation
    NothingPending,
    /// The deadline was re-armed with the time left
    Armed(Duration),
    /// The deadline had already passed; the install was rolled back
    RolledBack(Option<LocalPackageRecord>),
}

enum DeadlineState {
    Idle,
    Armed {
        package: PackageMetadata,
        generation: u64,
        timer: Option<JoinHandle<()>>,
    },
    Committed(PackageIdentity),
    RolledBack(PackageIdentity),
}

struct Deadline {
    state: DeadlineState,
    next_generation: u64,
    /// Mirrors `state` being `Armed`, readable without the lock
    armed: Arc<AtomicBool>,
}

impl Deadline {
    fn set(&mut self, state: DeadlineState) {
        self.armed
            .store(matches!(state, DeadlineState::Armed { .. }), Ordering::SeqCst);
        self.state = state;
    }

    fn disarm(&mut self) {
        if let DeadlineState::Armed { timer, .. } = &mut self.state
            && let Some(timer) = timer.take()
        {
            timer.abort();
        }
    }
}

struct InstallerInner {
    store: Arc<PackageStore>,
    bridge: Arc<dyn PlatformBridge>,
    deadline: Mutex<Deadline>,
    armed: Arc<AtomicBool>,
}

/// Stages packages and owns the rollback deadline
#[derive(Clone)]
pub struct Installer {
    inner: Arc<InstallerInner>,
}

impl Installer {
    pub fn new(store: Arc<PackageStore>, bridge: Arc<dyn PlatformBridge>) -> Self {
        let armed = Arc::new(AtomicBool::new(false));
        Self {
            inner: Arc::new(InstallerInner {
                store,
                bridge,
                deadline: Mutex::new(Deadline {
                    state: DeadlineState::Idle,
                    next_generation: 0,
                    armed: armed.clone(),
                }),
                armed,
            }),
        }
    }

    /// Activate `payload`, refusing packages that failed before
    pub fn stage(
        &self,
        payload: &RemotePayload,
        rollback_timeout_ms: Option<u32>,
    ) -> Result<LocalPackageRecord> {
        self.stage_with(
            payload,
            StageOptions {
                rollback_timeout_ms,
                ..StageOptions::default()
            },
        )
    }

    /// Activate `payload` and make it the current package
    ///
    /// With a rollback timeout the record starts out pending and is reverted
    /// unless `confirm` is called before the deadline. Arming replaces any
    /// deadline that was already pending.
    pub fn stage_with(
        &self,
        payload: &RemotePayload,
        options: StageOptions,
    ) -> Result<LocalPackageRecord> {
        let meta = &payload.metadata;
        let runtime = match options.rollback_timeout_ms {
            Some(_) => Some(Handle::try_current().map_err(|_| {
                Error::Configuration("a rollback timeout needs a Tokio runtime".to_string())
            })?),
            None => None,
        };

        let inner = &self.inner;
        let mut deadline = inner.lock();

        if !options.allow_failed && inner.store.is_blacklisted(&meta.identity)? {
            return Err(Error::Blacklisted(meta.identity.to_string()));
        }
        if let Some(current) = inner.store.current()?
            && current.identity() == &meta.identity
        {
            return Err(Error::DuplicateInstall(meta.identity.to_string()));
        }

        info!("Installing {} ({})", meta.label, meta.identity);
        inner.bridge.activate(&payload.path)?;

        let details = InstallDetails {
            local_path: Some(payload.path.display().to_string()),
            rollback_timeout_ms: options.rollback_timeout_ms,
        };
        let record = match inner.store.record_installed(meta, details) {
            Ok(record) => record,
            Err(e) => {
                // Keep the previous package authoritative
                if let Err(revert) = inner.bridge.revert_to_previous() {
                    error!("Failed to revert activation of {}: {}", meta.identity, revert);
                }
                return Err(e);
            }
        };

        deadline.disarm();
        match (options.rollback_timeout_ms, runtime) {
            (Some(ms), Some(runtime)) => {
                let timeout = Duration::from_millis(u64::from(ms));
                self.arm(&mut deadline, meta.clone(), timeout, &runtime);
            }
            _ => deadline.set(DeadlineState::Idle),
        }
        drop(deadline);

        if options.restart {
            inner.bridge.restart_application()?;
        }

        Ok(record)
    }

    fn arm(&self, deadline: &mut Deadline, package: PackageMetadata, timeout: Duration, runtime: &Handle) {
        deadline.disarm();
        deadline.next_generation += 1;
        let generation = deadline.next_generation;

        info!(
            "Package {} must confirm within {}ms or it will be rolled back",
            package.identity,
            timeout.as_millis()
        );

        let weak: Weak<InstallerInner> = Arc::downgrade(&self.inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade()
                && let Err(e) = inner.on_deadline(generation)
            {
                debug!("Rollback deadline {} not acted on: {}", generation, e);
            }
        });

        deadline.set(DeadlineState::Armed {
            package,
            generation,
            timer: Some(timer),
        });
    }

    /// The application reports that the current package started successfully
    ///
    /// Cancels an armed deadline and clears the pending flag. Without an
    /// armed deadline this is a no-op. Fails if the deadline already won.
    pub fn confirm(&self) -> Result<()> {
        let inner = &self.inner;
        let mut deadline = inner.lock();

        match &deadline.state {
            DeadlineState::RolledBack(identity) => {
                Err(Error::AlreadyRolledBack(identity.to_string()))
            }
            DeadlineState::Committed(_) => Ok(()),
            DeadlineState::Armed { package, .. } => {
                let identity = package.identity.clone();
                inner.store.mark_confirmed(&identity)?;
                deadline.disarm();
                deadline.set(DeadlineState::Committed(identity));
                Ok(())
            }
            DeadlineState::Idle => {
                // A pending record left behind by an earlier process
                if let Some(current) = inner.store.current()?
                    && current.is_pending
                {
                    inner.store.mark_confirmed(current.identity())?;
                    deadline.set(DeadlineState::Committed(current.identity().clone()));
                } else {
                    debug!("No rollback deadline armed; nothing to confirm");
                }
                Ok(())
            }
        }
    }

    /// Revert to the previous package and blacklist the current one
    ///
    /// Fails if the current install was already confirmed or rolled back.
    pub fn rollback(&self) -> Result<Option<LocalPackageRecord>> {
        let mut deadline = self.inner.lock();
        self.inner.rollback_locked(&mut deadline, None)
    }

    /// Re-arm the deadline of a pending install recorded by an earlier process
    pub fn resume(&self) -> Result<ResumeOutcome> {
        let inner = &self.inner;
        let mut deadline = inner.lock();

        if let DeadlineState::Armed { .. } = deadline.state {
            return Ok(ResumeOutcome::NothingPending);
        }
        let Some(current) = inner.store.current()? else {
            return Ok(ResumeOutcome::NothingPending);
        };
        if !current.is_pending {
            return Ok(ResumeOutcome::NothingPending);
        }
        let Some(due) = current.rollback_deadline() else {
            warn!("Pending package {} has no rollback deadline", current.identity());
            return Ok(ResumeOutcome::NothingPending);
        };

        let remaining = (due - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            warn!(
                "Rollback deadline of {} passed while the application was down",
                current.identity()
            );
            let restored = inner.rollback_locked(&mut deadline, Some(current.identity()))?;
            return Ok(ResumeOutcome::RolledBack(restored));
        }

        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("a rollback timeout needs a Tokio runtime".to_string())
        })?;
        self.arm(&mut deadline, current.metadata, remaining, &runtime);
        Ok(ResumeOutcome::Armed(remaining))
    }

    /// Whether a staged package is waiting on `confirm`
    ///
    /// Never blocks on an install in progress.
    pub fn awaiting_confirmation(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }
}

impl InstallerInner {
    fn lock(&self) -> MutexGuard<'_, Deadline> {
        self.deadline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_deadline(&self, generation: u64) -> Result<()> {
        let mut deadline = self.lock();

        let armed_for = match &mut deadline.state {
            DeadlineState::Armed {
                generation: armed,
                timer,
                package,
            } if *armed == generation => {
                // This task is the timer; it must not abort itself
                timer.take();
                package.identity.clone()
            }
            DeadlineState::Committed(identity) => {
                return Err(Error::AlreadyCommitted(identity.to_string()));
            }
            _ => {
                debug!("Ignoring superseded rollback deadline {}", generation);
                return Ok(());
            }
        };

        // Another process (`notify-ready`) may have confirmed or replaced it
        let current = match self.store.current() {
            Ok(current) => current,
            Err(e) => {
                error!("Cannot read current package at rollback deadline: {}", e);
                deadline.set(DeadlineState::Idle);
                return Err(e);
            }
        };
        let still_pending = current
            .as_ref()
            .is_some_and(|c| c.identity() == &armed_for && c.is_pending);
        if !still_pending {
            info!("Package {} is no longer pending; keeping it", armed_for);
            deadline.set(DeadlineState::Committed(armed_for.clone()));
            return Err(Error::AlreadyCommitted(armed_for.to_string()));
        }

        warn!("Package {} was not confirmed in time; rolling back", armed_for);
        match self.rollback_locked(&mut deadline, Some(&armed_for)) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Automatic rollback failed: {}", e);
                Err(e)
            }
        }
    }

    /// Roll back the current package, which must be `expected` when given
    fn rollback_locked(
        &self,
        deadline: &mut Deadline,
        expected: Option<&PackageIdentity>,
    ) -> Result<Option<LocalPackageRecord>> {
        match &deadline.state {
            DeadlineState::Committed(identity) => {
                return Err(Error::AlreadyCommitted(identity.to_string()));
            }
            DeadlineState::RolledBack(identity) => {
                return Err(Error::AlreadyRolledBack(identity.to_string()));
            }
            DeadlineState::Idle | DeadlineState::Armed { .. } => {}
        }

        let current = self.store.current()?.ok_or(Error::NothingToRollBack)?;
        if let Some(expected) = expected
            && current.identity() != expected
        {
            return Err(Error::AlreadyCommitted(expected.to_string()));
        }

        self.bridge.revert_to_previous()?;
        let restored = self.store.revert_to_previous(&current.metadata)?;

        deadline.disarm();
        deadline.set(DeadlineState::RolledBack(current.identity().clone()));
        Ok(restored)
    }
}
