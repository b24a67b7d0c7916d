use derive_more::{Display, From, Into};
use duplicate::duplicate_item;
use serde::{Deserialize, Serialize};

pub use ethereum_types::H256;

#[duplicate_item(Newtype; [Epoch]; [Slot]; [ValidatorIndex])]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Debug,
    Display,
    From,
    Into,
    Deserialize,
    Serialize,
)]
#[serde(transparent)]
pub struct Newtype(u64);

#[duplicate_item(Newtype; [Epoch]; [Slot]; [ValidatorIndex])]
impl Newtype {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Epoch {
    pub const GENESIS: Self = Self(0);

    #[must_use]
    pub const fn saturating_add(self, epochs: u64) -> Self {
        Self(self.0.saturating_add(epochs))
    }

    #[must_use]
    pub const fn saturating_sub(self, epochs: u64) -> Self {
        Self(self.0.saturating_sub(epochs))
    }

    #[must_use]
    pub const fn start_slot(self, slots_per_epoch: u64) -> Slot {
        Slot(self.0.saturating_mul(slots_per_epoch))
    }
}

impl Slot {
    /// Every slot maps to genesis if `slots_per_epoch` is zero.
    #[must_use]
    pub const fn epoch(self, slots_per_epoch: u64) -> Epoch {
        match self.0.checked_div(slots_per_epoch) {
            Some(epoch) => Epoch(epoch),
            None => Epoch::GENESIS,
        }
    }
}

impl ValidatorIndex {
    /// Records address validators with 5 bytes.
    pub const MAX_STORABLE: Self = Self((1 << 40) - 1);

    #[must_use]
    pub const fn is_storable(self) -> bool {
        self.0 <= Self::MAX_STORABLE.0
    }
}
