//! Движок двустороннего видеозвонка поверх WebRTC: комната на сигнальном
//! релее, offer/answer с trickle ICE, ICE restart, замена трека камеры на
//! экран и телеметрия качества.

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod utils;

pub use config::CallConfig;
pub use error::{CallError, ErrorKind};
pub use session::{CallDeps, NoopObserver, SessionController, SessionObserver};
