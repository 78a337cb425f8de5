pub mod appointment;
pub mod channel;
pub mod sync_log;
pub mod sync_queue;
pub mod sync_state;
pub mod therapist;

pub use appointment::AppointmentRepository;
pub use channel::ChannelRepository;
pub use sync_log::SyncLogRepository;
pub use sync_queue::SyncQueueRepository;
pub use sync_state::SyncStateRepository;
pub use therapist::TherapistRepository;
