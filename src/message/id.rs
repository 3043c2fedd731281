use uuid::Uuid;

/// Produces identifiers for downstream messages.
///
/// Identifiers must be unique per connection: the relay and the correlation
/// table both key on them.
pub trait MessageIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default generator: random (v4) UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl MessageIdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

impl<F> MessageIdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn next_id(&self) -> String {
        self()
    }
}
