use derivative::Derivative;

use crate::params::{Params, ParamsError};

#[derive(Clone, Copy, Debug, Derivative)]
#[derivative(Default)]
pub struct SlasherConfig {
    /// Number of epochs of history kept for detection.
    #[derivative(Default(value = "4096"))]
    pub slashing_history_limit: u64,
    #[derivative(Default(value = "16"))]
    pub epochs_per_chunk: u64,
    #[derivative(Default(value = "256"))]
    pub validators_per_chunk: u64,
    #[derivative(Default(value = "32"))]
    pub slots_per_epoch: u64,
    /// Capacity of the channel between producers and the slasher.
    #[derivative(Default(value = "65536"))]
    pub queue_capacity: usize,
}

impl SlasherConfig {
    pub fn params(self) -> Result<Params, ParamsError> {
        for (parameter, is_zero) in [
            ("slots_per_epoch", self.slots_per_epoch == 0),
            ("queue_capacity", self.queue_capacity == 0),
        ] {
            if is_zero {
                return Err(ParamsError::Zero { parameter });
            }
        }

        Params::new(
            self.validators_per_chunk,
            self.epochs_per_chunk,
            self.slashing_history_limit,
        )
    }
}
