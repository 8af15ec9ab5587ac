use async_trait::async_trait;

/// Storage transaction the unit of work finalizes.
///
/// The transaction is shared with the data mappers that write through it, so
/// both operations take `&self`; implementations use interior mutability.
#[async_trait]
pub trait StorageTransaction: Send + Sync {
    /// Backend error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Makes every write issued so far durable.
    async fn commit(&self) -> Result<(), Self::Error>;

    /// Discards every write issued since the last commit.
    async fn rollback(&self) -> Result<(), Self::Error>;
}
