use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{StreamOptions, UpstreamEvent, UpstreamEvents, UpstreamFactory, UpstreamStream};
use crate::error::{RelayError, RelayResult};

/// Loopback upstream: every pushed unit comes straight back as audio
#[derive(Default)]
pub struct EchoUpstream {
    tx: Option<mpsc::UnboundedSender<RelayResult<UpstreamEvent>>>,
    rx: Option<mpsc::UnboundedReceiver<RelayResult<UpstreamEvent>>>,
}

impl EchoUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn send(&self, event: UpstreamEvent) -> RelayResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RelayError::UpstreamStream("echo upstream is not open".into()))?;
        tx.send(Ok(event))
            .map_err(|_| RelayError::UpstreamStream("echo receiver dropped".into()))
    }
}

#[async_trait::async_trait]
impl UpstreamStream for EchoUpstream {
    async fn open(&mut self, _options: &StreamOptions) -> RelayResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        self.rx = Some(rx);
        Ok(())
    }

    async fn push_audio(&mut self, audio: &[u8]) -> RelayResult<()> {
        if audio.is_empty() {
            return Ok(());
        }
        debug!("Echoing {} bytes", audio.len());
        self.send(UpstreamEvent::Audio(audio.to_vec()))
    }

    async fn finish_input(&mut self) -> RelayResult<()> {
        self.send(UpstreamEvent::ResponseDone)
    }

    fn pull_audio(&mut self) -> Option<UpstreamEvents> {
        let rx = self.rx.take()?;
        Some(
            stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
        )
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.tx = None;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.tx.is_some()
    }

    fn name(&self) -> &str {
        "echo"
    }
}

pub struct EchoFactory;

#[async_trait::async_trait]
impl UpstreamFactory for EchoFactory {
    fn create(&self) -> Box<dyn UpstreamStream> {
        Box::new(EchoUpstream::new())
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_returns_pushed_audio() {
        let mut upstream = EchoUpstream::new();
        upstream.open(&StreamOptions::default()).await.unwrap();
        let mut events = upstream.pull_audio().unwrap();
        assert!(upstream.pull_audio().is_none());

        upstream.push_audio(&[1, 2, 3]).await.unwrap();
        upstream.finish_input().await.unwrap();
        upstream.close().await.unwrap();

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            UpstreamEvent::Audio(vec![1, 2, 3])
        );
        assert_eq!(events.next().await.unwrap().unwrap(), UpstreamEvent::ResponseDone);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_push_before_open_fails() {
        let mut upstream = EchoUpstream::new();
        assert!(upstream.push_audio(&[1]).await.is_err());
    }
}
