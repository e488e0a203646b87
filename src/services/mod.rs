// Service exports
pub mod audit;
pub mod gateway;
pub mod notifier;
pub mod records;

pub use audit::{AuditError, AuditLog};
pub use gateway::{GatewayClient, GatewayError};
pub use notifier::{DeliveryTransport, Notifier, NotifierError, WebhookTransport};
pub use records::{MemoryRecordStore, RecordKey, RecordStore, RecordStoreError, RedisRecordStore};
