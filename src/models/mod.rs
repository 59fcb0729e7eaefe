pub mod enums;

mod alert;
mod anomaly;
mod baseline;
mod behavior;
mod lab;
mod notification;
mod reminder;
mod trend;

pub use alert::*;
pub use anomaly::*;
pub use baseline::*;
pub use behavior::*;
pub use lab::*;
pub use notification::*;
pub use reminder::*;
pub use trend::*;

use uuid::Uuid;

/// Namespace for name-based (v5) ids, so re-derivation yields the same id.
pub const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c79_636f_7761_7463_685f_6964_735f_7631);

/// Deterministic id from the given name parts.
pub fn derive_id(parts: &[&str]) -> Uuid {
    Uuid::new_v5(&ID_NAMESPACE, parts.join("|").as_bytes())
}

/// Opaque patient identifier supplied by the external patient store.
pub type PatientId = String;
