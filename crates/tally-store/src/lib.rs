pub mod kv;
pub mod membership;
pub mod messages;
pub mod migrations;
pub mod settlements;

pub use kv::{FileKv, KvStore, MemoryKv, SqliteKv, StorageTier, TierKind, open_first};
pub use membership::MembershipSnapshotStore;
pub use messages::LocalMessageStore;
pub use settlements::LocalSettlementStore;
