use std::sync::atomic::{AtomicU8, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Acknowledgement sent upstream for a delivered envelope
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AckType {
    /// the message was handed to the application, but is not settled yet
    Delivered = 0,
    Consumed = 1,
    /// the message goes back to the broker for redelivery
    Released = 2,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AcknowledgeMode {
    Transacted,
    Auto,
    Client,
    DupsOk,
}

impl AcknowledgeMode {
    pub fn is_auto_or_dups_ok(&self) -> bool {
        matches!(self, AcknowledgeMode::Auto | AcknowledgeMode::DupsOk)
    }

    pub fn is_transacted(&self) -> bool {
        *self == AcknowledgeMode::Transacted
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AckState {
    Pending = 0,
    Delivered = 1,
    Consumed = 2,
    Released = 3,
}

impl AckState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AckState::Consumed | AckState::Released)
    }
}

/// Per-envelope acknowledgement state `Pending -> Delivered -> {Consumed | Released}`.
///
/// An envelope is marked delivered at most once and receives exactly one terminal ack. Callers
///  ask the record before sending an ack and suppress the ack if the transition is refused.
#[derive(Debug)]
pub struct AckRecord {
    state: AtomicU8,
}

impl Default for AckRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl AckRecord {
    pub fn new() -> AckRecord {
        AckRecord {
            state: AtomicU8::new(AckState::Pending.into()),
        }
    }

    pub fn state(&self) -> AckState {
        AckState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(AckState::Pending)
    }

    fn target_state(ack_type: AckType) -> AckState {
        match ack_type {
            AckType::Delivered => AckState::Delivered,
            AckType::Consumed => AckState::Consumed,
            AckType::Released => AckState::Released,
        }
    }

    /// Atomically moves to the state corresponding to `ack_type`, returning the state it moved
    ///  from, or `None` if that transition is not allowed from the current state.
    pub fn try_advance(&self, ack_type: AckType) -> Option<AckState> {
        let allowed_from: &[AckState] = match ack_type {
            AckType::Delivered => &[AckState::Pending],
            AckType::Consumed | AckType::Released => &[AckState::Pending, AckState::Delivered],
        };
        let target = Self::target_state(ack_type);

        self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
            match AckState::try_from(raw) {
                Ok(current) if allowed_from.contains(&current) => Some(target.into()),
                _ => None,
            }
        })
            .ok()
            .and_then(|raw| AckState::try_from(raw).ok())
    }

    /// Undoes a successful [AckRecord::try_advance] for an ack that never reached the broker, so
    ///  it can be sent again. Returns `false` if the state moved on in the meantime.
    pub fn revert(&self, ack_type: AckType, previous: AckState) -> bool {
        self.state.compare_exchange(Self::target_state(ack_type).into(), previous.into(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
