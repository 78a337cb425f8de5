//! Database models, one file per table.
//! Re-exported at `crate::db::models` so callers can `use crate::db::models::*;`.

pub mod appointment;
pub mod channel;
pub mod sync_log;
pub mod sync_queue;
pub mod sync_state;
pub mod therapist;

pub use self::appointment::*;
pub use self::channel::*;
pub use self::sync_log::*;
pub use self::sync_queue::*;
pub use self::sync_state::*;
pub use self::therapist::*;
