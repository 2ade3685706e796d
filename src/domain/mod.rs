pub mod app;
pub mod event;
pub mod feedback;
pub mod notification;
