// Engine modules
pub mod models;      // Data structures (Plant, Task, NotificationRecord, Db, ...)
pub mod error;       // EngineError and Result alias
pub mod clock;       // Source of "now" (system / manual)
pub mod config;      // EngineConfig, loaded from file + env
pub mod profiles;    // Growth stage and strain profiles
pub mod generator;   // Stage tasks, recurrences, task ordering
pub mod environment; // Environmental adjustment rules
pub mod window;      // Focus window arithmetic
pub mod store;       // Store traits + JSON file store
pub mod cache;       // Focus-window task cache
pub mod preferences; // Notification preferences and delivery gate
pub mod sink;        // Notification sink seam + dedup ids
pub mod notifier;    // Notification scheduler state machine
pub mod sync;        // Optimistic multi-view notification lists
pub mod ticker;      // Owned periodic background job
pub mod engine;      // Everything wired together

pub use engine::{Collaborators, Engine, FocusWindowTasks};
pub use error::{EngineError, Result};
