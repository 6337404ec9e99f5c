use async_trait::async_trait;

/// A storage or cache layer the shutdown sequence closes after general work
/// has drained.
///
/// Implementations submit their own background work through
/// `Executor::submit_storage` / `Executor::submit_cache`; shutdown awaits that
/// category's counter reaching zero after `close` returns.
#[async_trait]
pub trait ClosableLayer: Send + Sync {
    /// Short name used in shutdown logs.
    fn name(&self) -> &str;

    /// Release resources and stop accepting work.
    async fn close(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Flag(AtomicBool);

    #[async_trait]
    impl ClosableLayer for Flag {
        fn name(&self) -> &str {
            "flag"
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn closable_layer_is_object_safe() {
        let layer: Box<dyn ClosableLayer> = Box::new(Flag(AtomicBool::new(false)));
        layer.close().await.unwrap();
        assert_eq!(layer.name(), "flag");
    }
}
