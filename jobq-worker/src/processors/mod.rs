pub mod email;
pub mod notification;

pub use email::{EmailJob, EmailProcessor, Mailer, TracingMailer};
pub use notification::{
    NotificationJob, NotificationProcessor, NotificationSink, StoredNotification,
    TracingNotificationSink,
};
