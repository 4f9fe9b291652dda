pub mod core;
pub mod runtime;

pub use self::core::{
    ConfirmError, EngineCommand, EngineCore, EngineSnapshot, EngineUpdate, Step, Submission,
    SubmissionState,
};
pub use self::runtime::{start_engine, EngineHandle};
