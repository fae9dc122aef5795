//! Grain state writes that fail.

#[cfg(test)]
mod tests {
  use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  };

  use async_trait::async_trait;

  use crate::{
    actor::__tests__::helpers::{TestContext, test_config},
    domain::{
      actor::{ActorRef, IndexName},
      image::Image,
    },
    index::{ActorTypeConfig, IndexDeclaration, PropertyGenerator},
    runtime::Runtime,
    storage::{MemoryStorage, StorageBindings, StorageError, StorageProvider},
  };

  /// Memory storage whose writes can be switched off
  #[derive(Default)]
  struct SwitchableStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
  }

  #[async_trait]
  impl StorageProvider for SwitchableStorage {
    fn name(&self) -> &str {
      "switchable"
    }

    async fn load(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StorageError> {
      self.inner.load(key).await
    }

    async fn save(&self, key: &str, value: &[u8]) -> std::result::Result<(), StorageError> {
      if self.failing.load(Ordering::SeqCst) {
        return Err(StorageError::Io(std::io::Error::other("disk full")));
      }
      self.inner.save(key, value).await
    }

    async fn remove(&self, key: &str) -> std::result::Result<(), StorageError> {
      self.inner.remove(key).await
    }
  }

  /// `User` grains persist through `grains`; index buckets use the default
  async fn context(grains: Arc<SwitchableStorage>) -> TestContext {
    let mut storage = StorageBindings::in_memory();
    storage.register("grains", grains);
    let users = ActorTypeConfig::new("User")
      .storage("grains")
      .index(IndexDeclaration::new("Email", PropertyGenerator::new("Email")).unique().eager());
    let runtime = Runtime::builder()
      .config(test_config())
      .storage(storage)
      .actor_type(users)
      .build()
      .await
      .expect("build runtime");
    TestContext { runtime }
  }

  /// Test: when the new state cannot be written the mutation fails, the
  /// grain keeps serving its previous state, and the eager index entry is
  /// moved back.
  #[tokio::test]
  async fn test_failed_state_write_rolls_back() {
    let grains = Arc::new(SwitchableStorage::default());
    let ctx = context(Arc::clone(&grains)).await;
    let u1 = ActorRef::new("User", "u1");

    ctx.set(&u1, "Email", "neo@example.com").await.expect("first write");

    grains.failing.store(true, Ordering::SeqCst);
    let err = ctx.set(&u1, "Email", "trinity@example.com").await.expect_err("write fails");
    assert!(matches!(err, crate::actor::GrainError::Storage(_)), "unexpected error: {err}");

    let props = ctx.grain(&u1).await.get_properties().await.expect("properties");
    assert_eq!(props.get("Email"), Some(&Image::from("neo@example.com")));
    assert_eq!(ctx.lookup("Email", "neo@example.com").await, vec![u1.clone()]);
    assert!(ctx.lookup("Email", "trinity@example.com").await.is_empty());

    // The rolled-back before-image still matches the index
    grains.failing.store(false, Ordering::SeqCst);
    ctx.set(&u1, "Email", "morpheus@example.com").await.expect("write recovers");
    assert!(ctx.lookup("Email", "neo@example.com").await.is_empty());
    assert_eq!(
      ctx
        .runtime
        .lookup_unique(&IndexName::new("Email"), &Image::from("morpheus@example.com"))
        .await
        .expect("owner"),
      u1
    );
  }
}
