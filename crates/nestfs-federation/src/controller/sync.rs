//! Synchronization of one archive controller.
//!
//! A sync runs in three phases under the controller lock:
//!
//! 1. Close streams as the options demand: force, wait or fail `Busy`.
//! 2. Commit pending changes to the parent, or abort them.
//! 3. Return to `Unmounted`, dropping any false positive classification,
//!    and clear the selective cache if asked to.
//!
//! A failed commit leaves the model mounted and dirty so the sync can be
//! retried.

use std::thread;

use nestfs_vfs::{input_options, FsError, FsResult, SyncOption, SyncOptions};
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use super::archive::{ControllerState, FederationController, Mount, MountState};
use super::Operation;
use crate::federation::Federation;
use crate::stream::StreamKind;

impl FederationController {
    /// Synchronize this mount point with its parent.
    pub(crate) fn sync(&self, fed: &Federation, options: SyncOptions) -> FsResult<()> {
        let mut state = self.lock()?;
        self.close_streams(&mut state, options)?;

        let ControllerState { mount, cache, .. } = &mut *state;
        match mount {
            MountState::Mounted(m) if options.contains(SyncOption::AbortChanges) => {
                if m.model.is_touched() {
                    warn!(mount_point = %self.mount_point(), "aborting pending changes");
                }
                m.container.abort_pending_changes();
            }
            MountState::Mounted(m) if m.model.is_touched() => self.commit(fed, m)?,
            MountState::FalsePositive(fp) => {
                debug!(
                    mount_point = %self.mount_point(),
                    cause = %fp.cause(),
                    "dropping false positive classification"
                );
            }
            _ => {}
        }
        *mount = MountState::Unmounted;

        if options.contains(SyncOption::ClearCache) || options.contains(SyncOption::AbortChanges) {
            let cleared = cache.clear();
            debug!(mount_point = %self.mount_point(), cleared, "cleared selective cache");
        }
        debug!(mount_point = %self.mount_point(), options = ?options, "synchronized");
        Ok(())
    }

    /// Write the committed container into the parent file system.
    fn commit(&self, fed: &Federation, mount: &mut Mount) -> FsResult<()> {
        let bytes = mount.container.commit_pending_changes().map_err(|e| {
            FsError::sync(format!("cannot encode {}: {}", self.mount_point(), e))
        })?;
        let len = bytes.len();
        fed.node(self.parent())?
            .apply(
                fed,
                self.entry_in_parent(),
                &Operation::Write(bytes),
                input_options::NONE,
            )
            .map_err(|e| {
                FsError::sync(format!(
                    "cannot write {} to its parent: {}",
                    self.mount_point(),
                    e
                ))
            })?;
        debug!(mount_point = %self.mount_point(), bytes = len, "committed archive");
        Ok(())
    }

    /// Phase one: make sure no stream is left open.
    fn close_streams(
        &self,
        state: &mut MutexGuard<'_, ControllerState>,
        options: SyncOptions,
    ) -> FsResult<()> {
        if options.contains(SyncOption::ForceCloseInput) {
            self.force_close(state, StreamKind::Input);
        }
        if options.contains(SyncOption::ForceCloseOutput) {
            self.force_close(state, StreamKind::Output);
        }

        let me = thread::current().id();
        loop {
            let inputs = state.streams.count(StreamKind::Input);
            let outputs = state.streams.count(StreamKind::Output);
            if inputs == 0 && outputs == 0 {
                return Ok(());
            }

            let may_wait = (inputs == 0 || options.contains(SyncOption::WaitCloseInput))
                && (outputs == 0 || options.contains(SyncOption::WaitCloseOutput));
            // Waiting on our own streams would never end.
            let own = state.streams.count_owned_by(StreamKind::Input, me)
                + state.streams.count_owned_by(StreamKind::Output, me);
            if !may_wait || own > 0 {
                return Err(FsError::Busy { inputs, outputs });
            }

            debug!(
                mount_point = %self.mount_point(),
                inputs,
                outputs,
                "waiting for streams to close"
            );
            self.streams_closed.wait(state);
        }
    }

    /// Close every stream of `kind`. Output written so far is staged.
    fn force_close(&self, state: &mut ControllerState, kind: StreamKind) {
        let slots = state.streams.drain(kind);
        if slots.is_empty() {
            return;
        }
        warn!(
            mount_point = %self.mount_point(),
            kind = ?kind,
            count = slots.len(),
            "forcibly closing streams"
        );
        for slot in slots {
            let data = slot.close();
            if slot.kind() != StreamKind::Output {
                continue;
            }
            let MountState::Mounted(mount) = &mut state.mount else {
                continue;
            };
            let staged = mount
                .model
                .check_file_target(slot.name())
                .and_then(|()| self.stage_file(mount, slot.name(), &data));
            if let Err(e) = staged {
                warn!(entry = slot.name(), error = %e, "dropped output of closed stream");
            }
        }
        self.streams_closed.notify_all();
    }
}
