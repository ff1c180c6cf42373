#![doc = include_str!("../README.md")]

pub mod activity;
pub mod config;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod picture;
pub mod session;
pub mod storage;

pub mod prelude {
    pub use crate::{
        activity::{AutoFocus, FlashController, FlashStep, SpecialCapture, SpecialCaptureMode},
        config::{ParameterSnapshot, PoolPlan, ScenarioFlags},
        error::SessionError,
        monitor::{HealthMonitor, ProgressSource},
        notify::{
            CallbackCategory, DeliveryGate, DeliveryPayload, FaultKind, NotificationSink,
            NotifyEvent, NullSink,
        },
        picture::{BurstReport, PictureDriver},
        session::{NodeProvider, SessionController, SessionState, SessionTunables},
        storage::{BurstWriter, resolve_burst_dir},
    };
    pub use aperture_pipeline::prelude::*;
}
