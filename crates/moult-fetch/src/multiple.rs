use async_trait::async_trait;
use moult::{BinaryStream, FetchError, Fetcher};
use tokio::sync::mpsc;

type Finished = (usize, Box<dyn Fetcher>, Result<Option<BinaryStream>, FetchError>);

/// Races several fetchers and answers with whichever finishes first.
///
/// A fetcher still busy with an earlier check is left running rather than
/// started twice; its answer is picked up by a later call.
pub struct Multiple {
    slots: Vec<Option<Box<dyn Fetcher>>>,
    results_tx: mpsc::UnboundedSender<Finished>,
    results_rx: mpsc::UnboundedReceiver<Finished>,
}

impl Multiple {
    pub fn new(fetchers: Vec<Box<dyn Fetcher>>) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            slots: fetchers.into_iter().map(Some).collect(),
            results_tx,
            results_rx,
        }
    }

    #[cfg(test)]
    fn running(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }
}

#[async_trait]
impl Fetcher for Multiple {
    async fn init(&mut self) -> Result<(), FetchError> {
        if self.slots.is_empty() {
            return Err(FetchError::InvalidConfig("no fetchers given".into()));
        }
        for fetcher in self.slots.iter_mut().flatten() {
            fetcher.init().await?;
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<BinaryStream>, FetchError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(mut fetcher) = slot.take() else {
                continue;
            };
            let results = self.results_tx.clone();
            tokio::spawn(async move {
                let result = fetcher.fetch().await;
                let _ = results.send((index, fetcher, result));
            });
        }

        // self holds a sender, so recv never yields None.
        let Some((index, fetcher, result)) = self.results_rx.recv().await else {
            return Ok(None);
        };
        self.slots[index] = Some(fetcher);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moult::fetcher::from_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn delayed(delay: Duration, body: &'static [u8], calls: Arc<AtomicUsize>) -> Box<dyn Fetcher> {
        Box::new(from_fn(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                let stream: BinaryStream = Box::pin(body);
                Ok(Some(stream))
            }
        }))
    }

    async fn read_all(mut stream: BinaryStream) -> Vec<u8> {
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_empty_list_is_invalid() {
        let err = Multiple::new(Vec::new()).init().await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_fetcher_wins() {
        let fast_calls = Arc::new(AtomicUsize::new(0));
        let slow_calls = Arc::new(AtomicUsize::new(0));
        let mut multiple = Multiple::new(vec![
            delayed(Duration::from_secs(10), b"slow", Arc::clone(&slow_calls)),
            delayed(Duration::from_secs(1), b"fast", Arc::clone(&fast_calls)),
        ]);
        multiple.init().await.unwrap();

        let stream = multiple.fetch().await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"fast");
        assert_eq!(multiple.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_fetcher_is_not_restarted() {
        let fast_calls = Arc::new(AtomicUsize::new(0));
        let slow_calls = Arc::new(AtomicUsize::new(0));
        let mut multiple = Multiple::new(vec![
            delayed(Duration::from_secs(10), b"slow", Arc::clone(&slow_calls)),
            delayed(Duration::from_secs(3), b"fast", Arc::clone(&fast_calls)),
        ]);

        // Answers land at 3s, 6s and 9s while the slow check is still going.
        for _ in 0..3 {
            let stream = multiple.fetch().await.unwrap().unwrap();
            assert_eq!(read_all(stream).await, b"fast");
        }
        assert_eq!(fast_calls.load(Ordering::SeqCst), 3);
        assert_eq!(slow_calls.load(Ordering::SeqCst), 1);

        let stream = multiple.fetch().await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"slow");
        assert_eq!(fast_calls.load(Ordering::SeqCst), 4);

        let stream = multiple.fetch().await.unwrap().unwrap();
        assert_eq!(read_all(stream).await, b"fast");
        assert_eq!(fast_calls.load(Ordering::SeqCst), 4);
        assert_eq!(slow_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_child_init_error_propagates() {
        struct Broken;

        #[async_trait]
        impl Fetcher for Broken {
            async fn init(&mut self) -> Result<(), FetchError> {
                Err(FetchError::InvalidConfig("broken".into()))
            }

            async fn fetch(&mut self) -> Result<Option<BinaryStream>, FetchError> {
                Ok(None)
            }
        }

        let broken: Box<dyn Fetcher> = Box::new(Broken);
        let mut multiple = Multiple::new(vec![broken]);
        let err = multiple.init().await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidConfig(msg) if msg == "broken"));
    }
}
