//! Crash injection for commit recovery tests.
//!
//! A [`CrashInjector`] is a [`CommitHook`] that stops one commit at a chosen
//! [`CrashPoint`]. The store is left exactly as a process death at that point
//! would leave it; expelling and remaking the location then runs recovery.
//!
//! ```text
//! node data → sync → journal → sync → blocks + state slot → publish → truncate
//!                  ↑                ↑                     ↑          ↑
//!          AfterNodeData     AfterJournal          AfterApply  AfterPublish
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use quarry_store::{CommitHook, CommitStage, StoreConfig};

/// Where in the commit sequence the simulated crash happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// New node data is durable, the journal is not written.
    ///
    /// Recovery keeps the previous generation and cuts the node data back.
    AfterNodeData,

    /// The journal holds the whole transaction, nothing is applied.
    ///
    /// Recovery replays the journal and reaches the new generation.
    AfterJournal,

    /// Blocks and the state slot are written, the generation is not
    /// published to this process.
    AfterApply,

    /// Fully published, the journal is not yet truncated.
    AfterPublish,
}

impl CrashPoint {
    /// Every crash point, in commit order.
    pub const ALL: [CrashPoint; 4] =
        [Self::AfterNodeData, Self::AfterJournal, Self::AfterApply, Self::AfterPublish];

    /// The commit stage this point stops at.
    pub fn stage(self) -> CommitStage {
        match self {
            Self::AfterNodeData => CommitStage::NodeDataSynced,
            Self::AfterJournal => CommitStage::JournalSynced,
            Self::AfterApply => CommitStage::BlocksApplied,
            Self::AfterPublish => CommitStage::StatePublished,
        }
    }

    /// Returns true if a commit stopped here survives recovery.
    pub fn is_durable(self) -> bool {
        !matches!(self, Self::AfterNodeData)
    }
}

/// Stops the first armed commit that reaches its crash point.
///
/// The injector starts disarmed so setup commits go through.
#[derive(Debug)]
pub struct CrashInjector {
    crash_point: CrashPoint,
    stages_seen: AtomicU32,
    crashed: AtomicBool,
    armed: AtomicBool,
}

impl CrashInjector {
    /// Creates a disarmed injector.
    pub fn new(crash_point: CrashPoint) -> Arc<Self> {
        Arc::new(Self {
            crash_point,
            stages_seen: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    /// Store configuration that reports commits to this injector.
    pub fn config(self: &Arc<Self>) -> StoreConfig {
        StoreConfig::builder().commit_hook(Arc::clone(self) as Arc<dyn CommitHook>).build()
    }

    /// Arms the injector and resets its counters.
    pub fn arm(&self) {
        self.stages_seen.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarms the injector.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Returns true once a commit was stopped.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// The configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.crash_point
    }

    /// Stages reported while armed.
    pub fn stages_seen(&self) -> u32 {
        self.stages_seen.load(Ordering::SeqCst)
    }
}

impl CommitHook for CrashInjector {
    fn on_stage(&self, stage: CommitStage) -> bool {
        if !self.armed.load(Ordering::SeqCst) || self.crashed.load(Ordering::SeqCst) {
            return true;
        }
        self.stages_seen.fetch_add(1, Ordering::SeqCst);
        if stage == self.crash_point.stage() {
            self.crashed.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disarmed() {
        let injector = CrashInjector::new(CrashPoint::AfterJournal);
        assert!(injector.on_stage(CommitStage::JournalSynced));
        assert!(!injector.has_crashed());
        assert_eq!(injector.stages_seen(), 0);
    }

    #[test]
    fn test_stops_at_its_stage_once() {
        let injector = CrashInjector::new(CrashPoint::AfterApply);
        injector.arm();

        assert!(injector.on_stage(CommitStage::NodeDataSynced));
        assert!(injector.on_stage(CommitStage::JournalSynced));
        assert!(!injector.on_stage(CommitStage::BlocksApplied));
        assert!(injector.has_crashed());

        // Later commits run through.
        assert!(injector.on_stage(CommitStage::BlocksApplied));
        assert_eq!(injector.stages_seen(), 3);
    }

    #[test]
    fn test_arm_resets_state() {
        let injector = CrashInjector::new(CrashPoint::AfterNodeData);
        injector.arm();
        assert!(!injector.on_stage(CommitStage::NodeDataSynced));

        injector.arm();
        assert!(!injector.has_crashed());
        assert_eq!(injector.stages_seen(), 0);

        injector.disarm();
        assert!(injector.on_stage(CommitStage::NodeDataSynced));
    }

    #[test]
    fn test_points_map_to_distinct_stages() {
        let stages: std::collections::HashSet<_> =
            CrashPoint::ALL.iter().map(|point| point.stage()).collect();
        assert_eq!(stages.len(), CrashPoint::ALL.len());
        assert!(!CrashPoint::AfterNodeData.is_durable());
        assert!(CrashPoint::AfterJournal.is_durable());
    }
}
