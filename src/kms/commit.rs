use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use smithay::reexports::drm::control::{crtc, property, AtomicCommitFlags, RawResourceHandle};

use super::{DrmObject, KmsDevice, KmsError, ObjectId, RequestEntry};

/// Longest a single submission may sleep between `EBUSY` retries in total.
///
/// Submissions run on the event loop, so this stays well below a frame. A commit still busy
/// after that is left to the caller, which retries on the next completion event or vblank.
pub const MAX_RETRY_STALL: Duration = Duration::from_millis(3);

/// How hard to push a commit through a busy device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn with_attempts(self, attempts: u32) -> Self {
        Self { attempts, ..self }
    }

    /// Whether another retry fits into [`MAX_RETRY_STALL`] after sleeping `stalled` already.
    fn may_sleep(&self, stalled: Duration) -> bool {
        stalled.saturating_add(self.delay) <= MAX_RETRY_STALL
    }
}

/// One atomic transaction.
///
/// Entries are keyed by `(object, property)`, so staging the same property twice keeps the
/// last value only. The same request is used for the test-only and the real submission.
#[derive(Debug, Default)]
pub struct AtomicCommit {
    entries: BTreeMap<(u32, u32), RequestEntry>,
    objects: Vec<ObjectId>,
    allow_modeset: bool,
    flip_crtcs: Vec<crtc::Handle>,
}

impl AtomicCommit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every staged property of `object`.
    pub fn add(&mut self, object: &DrmObject) {
        for (prop, value) in object.pending() {
            self.add_property(object.id(), prop, value);
        }
        if !self.objects.contains(&object.id()) {
            self.objects.push(object.id());
        }
    }

    pub fn add_property(&mut self, object: ObjectId, prop: property::Handle, value: u64) {
        let key = (object.raw(), RawResourceHandle::from(prop).get());
        self.entries.insert(key, (object, prop, value));
    }

    pub fn set_allow_modeset(&mut self, allow: bool) {
        self.allow_modeset |= allow;
    }

    pub fn allows_modeset(&self) -> bool {
        self.allow_modeset
    }

    /// Requests a completion event for `crtc` on real submission.
    pub fn request_flip_event(&mut self, crtc: crtc::Handle) {
        if !self.flip_crtcs.contains(&crtc) {
            self.flip_crtcs.push(crtc);
        }
    }

    pub fn flip_crtcs(&self) -> &[crtc::Handle] {
        &self.flip_crtcs
    }

    /// Drops every event request, turning the real submission into a blocking one.
    pub fn clear_flip_events(&mut self) {
        self.flip_crtcs.clear();
    }

    /// Objects whose staged properties ride on this commit.
    pub fn objects(&self) -> &[ObjectId] {
        &self.objects
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn value(&self, object: ObjectId, prop: property::Handle) -> Option<u64> {
        self.entries
            .get(&(object.raw(), RawResourceHandle::from(prop).get()))
            .map(|(_, _, value)| *value)
    }

    fn request(&self) -> Vec<RequestEntry> {
        self.entries.values().copied().collect()
    }

    /// Asks the kernel whether the request would be accepted, without applying it.
    pub fn test(&self, device: &dyn KmsDevice) -> Result<(), KmsError> {
        let _span = tracy_client::span!("AtomicCommit::test");

        let mut flags = AtomicCommitFlags::TEST_ONLY;
        if self.allow_modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        device
            .atomic_commit(flags, &self.request())
            .map_err(KmsError::from_io)
    }

    /// Submits the request for real.
    ///
    /// A commit with flip events is nonblocking; one without blocks until the kernel is done.
    /// `EBUSY` is retried according to `retry`, sleeping no longer than [`MAX_RETRY_STALL`] in
    /// total.
    pub fn submit(&self, device: &dyn KmsDevice, retry: RetryPolicy) -> Result<(), KmsError> {
        let _span = tracy_client::span!("AtomicCommit::submit");

        let mut flags = AtomicCommitFlags::empty();
        if self.allow_modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }
        if !self.flip_crtcs.is_empty() {
            flags |= AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK;
        }

        let request = self.request();
        let attempts = retry.attempts.max(1);
        let mut attempt = 0;
        let mut stalled = Duration::ZERO;
        loop {
            attempt += 1;
            match device.atomic_commit(flags, &request) {
                Ok(()) => return Ok(()),
                Err(err) => match KmsError::from_io(err) {
                    KmsError::Busy { .. } if attempt < attempts && retry.may_sleep(stalled) => {
                        debug!("device busy, retrying commit ({attempt}/{attempts})");
                        if !retry.delay.is_zero() {
                            thread::sleep(retry.delay);
                            stalled += retry.delay;
                        }
                    }
                    KmsError::Busy { .. } => return Err(KmsError::Busy { attempts: attempt }),
                    err => return Err(err),
                },
            }
        }
    }
}
