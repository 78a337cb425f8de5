pub mod channels;
pub mod event_mapper;
pub mod google_calendar;
pub mod init;
pub mod outbound;
pub mod sync;
