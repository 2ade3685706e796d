pub mod certificate_monitor;
pub mod delivery;
pub mod feedback;
pub mod poller;

pub use certificate_monitor::CertificateMonitor;
pub use delivery::{DeliveryOutcome, DeliveryWorker};
pub use feedback::FeedbackWorker;
pub use poller::Poller;
