pub mod controller;
pub mod machine;

pub use controller::{CallDeps, NoopObserver, SessionController, SessionObserver};
pub use machine::{Command, Effect, Event, LocalMediaState, Notification, Session};
