use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state shared by the engine and every follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Init = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            0 => Status::Init,
            1 => Status::Running,
            2 => Status::Stopping,
            _ => Status::Stopped,
        }
    }
}

/// Lock-free status atom.
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::SeqCst)
    }

    /// Compare-and-swap; true when the transition happened.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_succeeds_from_expected_state() {
        let status = AtomicStatus::new(Status::Init);
        assert!(status.transition(Status::Init, Status::Running));
        assert_eq!(status.load(), Status::Running);
    }

    #[test]
    fn test_transition_fails_from_other_state() {
        let status = AtomicStatus::new(Status::Stopped);
        assert!(!status.transition(Status::Init, Status::Running));
        assert_eq!(status.load(), Status::Stopped);
    }

    #[test]
    fn test_store_overwrites() {
        let status = AtomicStatus::new(Status::Running);
        status.store(Status::Stopping);
        assert_eq!(status.load(), Status::Stopping);
    }
}
