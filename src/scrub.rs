// SPDX-License-Identifier: GPL-3.0-only

//! Scrub orchestration over a set of volumes.
//!
//! The tool gives no transactional scrub API: start detaches, cancel is a
//! separate command with no wait, and the only progress signal is the status
//! directory. The orchestrator drives one job through
//! `CancelingPrior → Starting → Polling` and guarantees that a failed or
//! canceled call never leaves a scrub running behind it — every exit path
//! from an active job goes through the same quiesce loop that precedes it.
//!
//! At most one orchestrator may target a given UUID at a time; two jobs over
//! overlapping UUID sets would cancel each other's scrubs. Serializing
//! overlapping callers is the caller's responsibility.

use crate::error::{HealthError, Result};
use crate::types::ScrubStatusMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Wait between cancel attempts while quiescing prior scrubs.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Wait between progress polls. Scrubs run for minutes to hours, so this is
/// deliberately much longer than the cancel interval.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Cooperative cancellation handle for a running scrub job.
///
/// Clones share one flag. The orchestrator checks it only at poll ticks, so
/// a request takes effect within one progress-poll interval and always routes
/// through the cancel-unwind before the call returns.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a cancel command: both are acceptable, the tool exits
/// differently depending on whether a scrub was actually running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotRunning,
}

/// Issues scrub start/cancel commands against a mount point.
pub trait ScrubControl {
    fn scrub_start(&self, mount_point: &Path) -> Result<()>;
    fn scrub_cancel(&self, mount_point: &Path) -> Result<CancelOutcome>;
}

/// Source of persisted scrub-status snapshots.
pub trait StatusSource {
    fn read_all_statuses(&self) -> Result<ScrubStatusMap>;
}

/// Resolves a volume UUID to its root-subvolume mount point. Implementations
/// must resolve fresh on every call; mounts move between polls.
pub trait MountLookup {
    fn mount_point_of(&self, uuid: &Uuid) -> Result<PathBuf>;
}

/// Drives one scrub job over a set of volumes
pub struct ScrubOrchestrator<C, S, M> {
    control: C,
    statuses: S,
    mounts: M,
    cancel_poll: Duration,
    progress_poll: Duration,
}

impl<C, S, M> ScrubOrchestrator<C, S, M>
where
    C: ScrubControl,
    S: StatusSource,
    M: MountLookup,
{
    pub fn new(control: C, statuses: S, mounts: M) -> Self {
        Self {
            control,
            statuses,
            mounts,
            cancel_poll: CANCEL_POLL_INTERVAL,
            progress_poll: PROGRESS_POLL_INTERVAL,
        }
    }

    /// Override both poll intervals (tests, or callers with unusual tooling).
    pub fn with_intervals(mut self, cancel_poll: Duration, progress_poll: Duration) -> Self {
        self.cancel_poll = cancel_poll;
        self.progress_poll = progress_poll;
        self
    }

    /// Run one scrub over `targets`, blocking until every device of every
    /// target reports finished, then return the final status snapshot
    /// restricted to the targets.
    ///
    /// Any prior scrub on a target is canceled first (start is idempotent
    /// with respect to whatever was running before). On `cancel` being
    /// requested, or on any failure after scrubs have been started, the
    /// started scrubs are canceled back down before the outcome propagates.
    pub fn run(&self, targets: &BTreeSet<Uuid>, cancel: &CancelToken) -> Result<ScrubStatusMap> {
        info!("scrub requested for {} volumes", targets.len());
        self.quiesce(targets);

        match self.start_and_poll(targets, cancel) {
            Ok(snapshot) => {
                info!("scrub finished for all {} volumes", targets.len());
                Ok(snapshot)
            }
            Err(err) => {
                warn!("scrub job unwinding: {err}");
                self.quiesce(targets);
                Err(err)
            }
        }
    }

    fn start_and_poll(
        &self,
        targets: &BTreeSet<Uuid>,
        cancel: &CancelToken,
    ) -> Result<ScrubStatusMap> {
        for uuid in targets {
            let mount_point = self.mounts.mount_point_of(uuid)?;
            self.control.scrub_start(&mount_point)?;
            info!("started scrub of {uuid} at {}", mount_point.display());
        }

        loop {
            if cancel.is_requested() {
                info!("cancellation requested, stopping scrub job");
                return Err(HealthError::CancellationRequested);
            }

            let snapshot = self.statuses.read_all_statuses()?;

            // We own every targeted scrub for the duration of this call. A
            // canceled device can only mean another actor is managing the
            // same volume, and continuing would corrupt both jobs' view.
            for uuid in targets {
                if let Some(devices) = snapshot.get(uuid) {
                    for (devid, status) in devices {
                        if status.canceled {
                            return Err(HealthError::ScrubConflict {
                                uuid: *uuid,
                                devid: *devid,
                            });
                        }
                    }
                }
            }

            // A target with no status records yet reads as "not finished";
            // a target with records but zero devices is vacuously finished.
            let all_finished = targets.iter().all(|uuid| {
                snapshot
                    .get(uuid)
                    .is_some_and(|devices| devices.values().all(|status| status.finished))
            });
            if all_finished {
                let mut result = ScrubStatusMap::new();
                for uuid in targets {
                    if let Some(devices) = snapshot.get(uuid) {
                        result.insert(*uuid, devices.clone());
                    }
                }
                return Ok(result);
            }

            debug!("scrub still running, polling again");
            thread::sleep(self.progress_poll);
        }
    }

    /// Cancel until no targeted device is still actively running.
    ///
    /// A device counts as active while it reports neither finished nor
    /// canceled; finished devices need no cancel and the tool never flips
    /// their flag. Every failure in here is retried on the next tick —
    /// leaving a scrub running is worse than a slow cancel, and when this
    /// runs as an unwind the original error must be the one that propagates.
    fn quiesce(&self, targets: &BTreeSet<Uuid>) {
        loop {
            let active: Vec<Uuid> = match self.statuses.read_all_statuses() {
                Ok(snapshot) => targets
                    .iter()
                    .filter(|uuid| {
                        snapshot.get(uuid).is_some_and(|devices| {
                            devices
                                .values()
                                .any(|status| !status.finished && !status.canceled)
                        })
                    })
                    .copied()
                    .collect(),
                Err(err) => {
                    warn!("status read failed while quiescing, canceling blindly: {err}");
                    targets.iter().copied().collect()
                }
            };

            if active.is_empty() {
                debug!("no prior scrub running on any target");
                return;
            }

            for uuid in &active {
                let outcome = self
                    .mounts
                    .mount_point_of(uuid)
                    .and_then(|mount_point| self.control.scrub_cancel(&mount_point));
                match outcome {
                    Ok(CancelOutcome::Canceled) => info!("canceled running scrub of {uuid}"),
                    Ok(CancelOutcome::NotRunning) => debug!("no scrub running for {uuid}"),
                    Err(err) => warn!("cancel of {uuid} failed, will retry: {err}"),
                }
            }

            thread::sleep(self.cancel_poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScrubDeviceStatus;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    const U1: &str = "11111111-1111-1111-1111-111111111111";
    const U2: &str = "22222222-2222-2222-2222-222222222222";

    fn uuid(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    fn targets(uuids: &[&str]) -> BTreeSet<Uuid> {
        uuids.iter().map(|u| uuid(u)).collect()
    }

    fn device(finished: bool, canceled: bool) -> ScrubDeviceStatus {
        ScrubDeviceStatus {
            finished,
            canceled,
            ..ScrubDeviceStatus::default()
        }
    }

    #[derive(Default)]
    struct State {
        statuses: ScrubStatusMap,
        started: Vec<Uuid>,
        cancels: Vec<Uuid>,
        reads: usize,
        /// Replace `statuses` wholesale once this many reads have happened.
        appear_after_reads: Option<(usize, ScrubStatusMap)>,
        /// Mark a started volume's devices finished right away.
        finish_on_start: bool,
        /// Simulate a foreign actor canceling devid 1 right after start.
        foreign_cancel_on_start: bool,
        /// Fail `scrub_start` for this volume.
        fail_start_for: Option<Uuid>,
        /// Fail this many status reads before behaving normally.
        fail_reads: usize,
        /// Fail this many cancel commands before behaving normally.
        fail_cancels: usize,
    }

    /// Implements all three orchestrator seams over one shared state.
    #[derive(Clone, Default)]
    struct Harness(Rc<RefCell<State>>);

    impl Harness {
        fn with_statuses(statuses: ScrubStatusMap) -> Self {
            let harness = Self::default();
            harness.0.borrow_mut().statuses = statuses;
            harness
        }

        fn orchestrator(&self) -> ScrubOrchestrator<Harness, Harness, Harness> {
            ScrubOrchestrator::new(self.clone(), self.clone(), self.clone())
                .with_intervals(Duration::from_millis(1), Duration::from_millis(1))
        }

        fn state(&self) -> std::cell::Ref<'_, State> {
            self.0.borrow()
        }
    }

    fn uuid_of(mount_point: &Path) -> Uuid {
        let name = mount_point.file_name().unwrap().to_str().unwrap();
        Uuid::parse_str(name).unwrap()
    }

    impl MountLookup for Harness {
        fn mount_point_of(&self, uuid: &Uuid) -> Result<PathBuf> {
            Ok(PathBuf::from(format!("/mnt/{uuid}")))
        }
    }

    impl StatusSource for Harness {
        fn read_all_statuses(&self) -> Result<ScrubStatusMap> {
            let mut state = self.0.borrow_mut();
            state.reads += 1;
            if state.fail_reads > 0 {
                state.fail_reads -= 1;
                return Err(HealthError::Io(std::io::Error::other(
                    "status directory unreadable",
                )));
            }
            if let Some((after, replacement)) = state.appear_after_reads.clone() {
                if state.reads >= after {
                    state.statuses = replacement;
                    state.appear_after_reads = None;
                }
            }
            Ok(state.statuses.clone())
        }
    }

    impl ScrubControl for Harness {
        fn scrub_start(&self, mount_point: &Path) -> Result<()> {
            let target = uuid_of(mount_point);
            let mut state = self.0.borrow_mut();
            if state.fail_start_for == Some(target) {
                return Err(HealthError::CommandFailed {
                    command: "scrub start".to_string(),
                    detail: "exit status Some(1): unable to start".to_string(),
                });
            }
            state.started.push(target);
            // A real start resets the volume's status records.
            let finish = state.finish_on_start;
            let foreign = state.foreign_cancel_on_start;
            if let Some(devices) = state.statuses.get_mut(&target) {
                for status in devices.values_mut() {
                    status.finished = finish;
                    status.canceled = false;
                }
                if foreign {
                    if let Some(first) = devices.values_mut().next() {
                        first.finished = false;
                        first.canceled = true;
                    }
                }
            }
            Ok(())
        }

        fn scrub_cancel(&self, mount_point: &Path) -> Result<CancelOutcome> {
            let target = uuid_of(mount_point);
            let mut state = self.0.borrow_mut();
            if state.fail_cancels > 0 {
                state.fail_cancels -= 1;
                return Err(HealthError::CommandFailed {
                    command: "scrub cancel".to_string(),
                    detail: "exit status Some(1): transient failure".to_string(),
                });
            }
            state.cancels.push(target);
            let mut had_running = false;
            if let Some(devices) = state.statuses.get_mut(&target) {
                for status in devices.values_mut() {
                    if !status.finished && !status.canceled {
                        status.canceled = true;
                        had_running = true;
                    }
                }
            }
            Ok(if had_running {
                CancelOutcome::Canceled
            } else {
                CancelOutcome::NotRunning
            })
        }
    }

    fn statuses_for(uuid_str: &str, devices: &[(u64, ScrubDeviceStatus)]) -> ScrubStatusMap {
        let mut map = ScrubStatusMap::new();
        map.insert(uuid(uuid_str), devices.iter().cloned().collect());
        map
    }

    #[test]
    fn all_finished_returns_after_single_start() {
        let harness = Harness::with_statuses(statuses_for(
            U1,
            &[(1, device(true, false)), (2, device(true, false))],
        ));
        harness.0.borrow_mut().finish_on_start = true;

        let snapshot = harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect("job should finish");

        assert_eq!(snapshot[&uuid(U1)].len(), 2);
        assert_eq!(harness.state().started, vec![uuid(U1)], "exactly one start");
        assert!(
            harness.state().cancels.is_empty(),
            "nothing was running, nothing to cancel"
        );
    }

    #[test]
    fn prior_running_scrub_is_canceled_before_start() {
        let harness = Harness::with_statuses(statuses_for(U1, &[(1, device(false, false))]));
        harness.0.borrow_mut().finish_on_start = true;

        harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect("job should finish");

        let state = harness.state();
        assert_eq!(state.cancels, vec![uuid(U1)], "prior scrub canceled once");
        assert_eq!(state.started, vec![uuid(U1)]);
    }

    #[test]
    fn polls_until_status_appears() {
        let mut finished = ScrubStatusMap::new();
        finished.insert(
            uuid(U1),
            BTreeMap::from([(1, device(true, false)), (2, device(true, false))]),
        );

        let harness = Harness::default();
        harness.0.borrow_mut().appear_after_reads = Some((3, finished));

        let snapshot = harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect("job should finish");

        assert!(snapshot[&uuid(U1)].values().all(|s| s.finished));
        let state = harness.state();
        assert_eq!(state.started, vec![uuid(U1)]);
        assert!(
            state.reads >= 3,
            "must keep polling while no status file exists"
        );
    }

    #[test]
    fn zero_device_volume_is_vacuously_finished() {
        let mut statuses = ScrubStatusMap::new();
        statuses.insert(uuid(U1), BTreeMap::new());
        let harness = Harness::with_statuses(statuses);

        let snapshot = harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect("job should finish");
        assert!(snapshot[&uuid(U1)].is_empty());
    }

    #[test]
    fn untargeted_volumes_are_ignored() {
        let mut statuses = statuses_for(U1, &[(1, device(true, false))]);
        // U2 is running and even "canceled" on one device, but not targeted.
        statuses.insert(
            uuid(U2),
            BTreeMap::from([(1, device(false, false)), (2, device(false, true))]),
        );
        let harness = Harness::with_statuses(statuses);
        harness.0.borrow_mut().finish_on_start = true;

        let snapshot = harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect("job should finish");

        assert!(!snapshot.contains_key(&uuid(U2)), "snapshot is targets-only");
        assert!(
            !harness.state().cancels.contains(&uuid(U2)),
            "must not touch volumes outside the target set"
        );
    }

    #[test]
    fn cancellation_request_unwinds_and_cancels_all_devices() {
        let harness = Harness::with_statuses(statuses_for(
            U1,
            &[(1, device(false, false)), (2, device(false, false))],
        ));
        let token = CancelToken::new();
        token.request();

        let err = harness
            .orchestrator()
            .run(&targets(&[U1]), &token)
            .expect_err("job must report cancellation");
        assert!(matches!(err, HealthError::CancellationRequested));

        let state = harness.state();
        assert!(
            state.statuses[&uuid(U1)].values().all(|s| s.canceled),
            "every targeted device must end up canceled"
        );
        assert!(state.cancels.contains(&uuid(U1)));
    }

    #[test]
    fn foreign_cancel_is_a_conflict() {
        let harness = Harness::with_statuses(statuses_for(
            U1,
            &[(1, device(false, false)), (2, device(false, false))],
        ));
        harness.0.borrow_mut().foreign_cancel_on_start = true;

        let err = harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect_err("foreign cancel must abort the job");
        match err {
            HealthError::ScrubConflict { uuid: u, devid } => {
                assert_eq!(u, uuid(U1));
                assert_eq!(devid, 1);
            }
            other => panic!("expected ScrubConflict, got {other:?}"),
        }
    }

    #[test]
    fn start_failure_unwinds_already_started_scrubs() {
        let mut statuses = statuses_for(U1, &[(1, device(true, false))]);
        statuses.insert(uuid(U2), BTreeMap::from([(1, device(true, false))]));
        let harness = Harness::with_statuses(statuses);
        {
            let mut state = harness.0.borrow_mut();
            state.fail_start_for = Some(uuid(U2));
        }

        let err = harness
            .orchestrator()
            .run(&targets(&[U1, U2]), &CancelToken::new())
            .expect_err("start failure must propagate");
        assert!(matches!(err, HealthError::CommandFailed { .. }));

        let state = harness.state();
        assert_eq!(state.started, vec![uuid(U1)], "U1 started before the failure");
        assert!(
            state.statuses[&uuid(U1)]
                .values()
                .all(|s| s.finished || s.canceled),
            "U1's scrub must not be left running"
        );
    }

    #[test]
    fn quiesce_retries_failed_cancels_until_success() {
        let harness = Harness::with_statuses(statuses_for(U1, &[(1, device(false, false))]));
        {
            let mut state = harness.0.borrow_mut();
            state.fail_cancels = 2;
            state.finish_on_start = true;
        }

        harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect("cancel failures are transient, job must still finish");

        let state = harness.state();
        assert_eq!(
            state.cancels,
            vec![uuid(U1)],
            "cancel must eventually succeed after the failed attempts"
        );
        assert_eq!(state.started, vec![uuid(U1)]);
    }

    #[test]
    fn status_read_failure_quiesces_blindly() {
        let harness = Harness::with_statuses(statuses_for(U1, &[(1, device(false, false))]));
        {
            let mut state = harness.0.borrow_mut();
            state.fail_reads = 1;
            state.finish_on_start = true;
        }

        harness
            .orchestrator()
            .run(&targets(&[U1]), &CancelToken::new())
            .expect("job must finish once the status directory is readable again");

        let state = harness.state();
        assert_eq!(
            state.cancels,
            vec![uuid(U1)],
            "an unreadable status directory must cancel targets rather than skip them"
        );
    }

    #[test]
    fn unwind_cancel_failures_do_not_mask_the_original_error() {
        let mut statuses = statuses_for(U1, &[(1, device(true, false))]);
        statuses.insert(uuid(U2), BTreeMap::from([(1, device(true, false))]));
        let harness = Harness::with_statuses(statuses);
        {
            let mut state = harness.0.borrow_mut();
            state.fail_start_for = Some(uuid(U2));
            state.fail_cancels = 1;
        }

        let err = harness
            .orchestrator()
            .run(&targets(&[U1, U2]), &CancelToken::new())
            .expect_err("start failure must propagate");
        match err {
            HealthError::CommandFailed { command, .. } => {
                assert_eq!(
                    command, "scrub start",
                    "the start failure, not the unwind's cancel failure, must propagate"
                );
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }

        let state = harness.state();
        assert_eq!(
            state.cancels,
            vec![uuid(U1)],
            "the unwind must retry past its failed cancel"
        );
        assert!(
            state.statuses[&uuid(U1)]
                .values()
                .all(|s| s.finished || s.canceled),
            "U1's scrub must not be left running"
        );
    }
}
