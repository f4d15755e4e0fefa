mod clock;
mod firmware;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use firmware::{
    format_integers, halt, CommandOutcome, Firmware, FirmwareOptions, InferenceReport, LoopState,
    StartupError, Step,
};
