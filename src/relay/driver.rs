//! Per-session driver task.
//!
//! Each session gets one task that owns its inbox and its upstream event
//! stream, so inbound fragments reach the upstream in arrival order and
//! outbound envelopes leave in upstream order.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use super::engine::RelayEngine;
use crate::codec::{AudioFragment, OutboundAudio};
use crate::error::{RelayError, RelayResult};
use crate::session::{Inbound, Session};
use crate::upstream::UpstreamEvent;

/// Progress of the exchange currently in flight
#[derive(Debug, Default)]
struct Turn {
    /// First fragment of the utterance being answered
    started_at: Option<Instant>,
    /// Audio pushed since the last `finish_input`
    uncommitted: bool,
    /// `finish_input` sent, response not yet done
    awaiting_response: bool,
    /// Most recent inbound message, quoted in error envelopes
    last_message_id: Option<String>,
}

impl Turn {
    fn processing_time_ms(&self) -> f64 {
        self.started_at
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    fn reset(&mut self) {
        self.started_at = None;
        self.awaiting_response = false;
    }
}

impl RelayEngine {
    /// Run one session from handshake to teardown
    pub(super) async fn drive(
        self,
        session: Arc<Session>,
        mut inbox: mpsc::UnboundedReceiver<Inbound>,
    ) {
        let cancel = session.cancel_token().clone();
        let limits = self.inner.registry.limits().clone();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = session.open_upstream(limits.handshake_timeout) => Some(opened),
        };
        let mut events = match opened {
            Some(Ok(events)) => events,
            Some(Err(e)) => {
                let first_message = first_message_id(&mut inbox);
                self.fail(&session, e, first_message.as_deref()).await;
                return;
            }
            None => {
                self.teardown(&session).await;
                return;
            }
        };

        let mut turn = Turn::default();
        let mut ending = false;
        let mut end_deadline = Instant::now();

        let outcome: RelayResult<()> = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),

                _ = tokio::time::sleep_until(end_deadline), if ending => {
                    debug!(
                        "Session {}/{}: response not finished within close grace",
                        session.device_id(),
                        session.session_id()
                    );
                    break Ok(());
                }

                inbound = inbox.recv(), if !ending => match inbound {
                    Some(Inbound::Audio(fragment)) => {
                        if let Err(e) = self.forward(&session, &fragment, &mut turn).await {
                            break Err(e);
                        }
                    }
                    Some(Inbound::End) => {
                        if turn.uncommitted {
                            if let Err(e) = self.commit(&session, &mut turn).await {
                                break Err(e);
                            }
                        }
                        if !turn.awaiting_response {
                            break Ok(());
                        }
                        ending = true;
                        end_deadline = Instant::now() + limits.close_grace;
                    }
                    None => break Ok(()),
                },

                event = events.next() => match event {
                    Some(Ok(event)) => match self.relay_event(&session, event, &mut turn).await {
                        Ok(response_done) if response_done && ending => break Ok(()),
                        Ok(_) => {}
                        Err(e) => break Err(e),
                    },
                    Some(Err(e)) => break Err(e),
                    None => {
                        info!(
                            "Upstream for {}/{} closed",
                            session.device_id(),
                            session.session_id()
                        );
                        break Ok(());
                    }
                },
            }
        };

        match outcome {
            Ok(()) => self.teardown(&session).await,
            Err(e) => {
                let original = turn.last_message_id.clone();
                self.fail(&session, e, original.as_deref()).await;
            }
        }
    }

    /// Push one device fragment and close the utterance if it is the last
    async fn forward(
        &self,
        session: &Session,
        fragment: &AudioFragment,
        turn: &mut Turn,
    ) -> RelayResult<()> {
        if turn.started_at.is_none() {
            turn.started_at = Some(Instant::now());
        }
        turn.last_message_id = Some(fragment.message_id.clone());

        if !fragment.payload.is_empty() {
            session.push(fragment).await?;
            turn.uncommitted = true;
        } else {
            session.touch();
        }

        if fragment.ends_utterance() && turn.uncommitted {
            self.commit(session, turn).await?;
        }
        Ok(())
    }

    async fn commit(&self, session: &Session, turn: &mut Turn) -> RelayResult<()> {
        session.finish_input().await?;
        turn.uncommitted = false;
        turn.awaiting_response = true;
        debug!(
            "Session {}/{}: utterance committed",
            session.device_id(),
            session.session_id()
        );
        Ok(())
    }

    /// Deliver one upstream event. Returns true when a response completed.
    async fn relay_event(
        &self,
        session: &Session,
        event: UpstreamEvent,
        turn: &mut Turn,
    ) -> RelayResult<bool> {
        match event {
            UpstreamEvent::Audio(unit) => {
                self.publish_audio(session, &unit, turn).await?;
                Ok(false)
            }
            UpstreamEvent::Transcript(delta) => {
                session.append_transcript(&delta);
                Ok(false)
            }
            UpstreamEvent::ResponseDone => {
                let transcript = session.take_transcript();
                if !transcript.is_empty() {
                    self.publish_outbound(session, &[], Some(&transcript), 0, 1, turn)
                        .await?;
                }
                self.inner.stats.response_completed();
                debug!(
                    "Session {}/{}: response complete in {:.0} ms",
                    session.device_id(),
                    session.session_id(),
                    turn.processing_time_ms()
                );
                turn.reset();
                Ok(true)
            }
        }
    }

    /// Re-chunk one upstream audio unit and publish every slice in order
    async fn publish_audio(&self, session: &Session, unit: &[u8], turn: &Turn) -> RelayResult<()> {
        if unit.is_empty() {
            return Ok(());
        }

        let slices: Vec<&[u8]> = self.inner.codec.rechunk(unit).collect();
        let total = slices.len() as u32;
        for (index, slice) in slices.into_iter().enumerate() {
            self.publish_outbound(session, slice, None, index as u32, total, turn)
                .await?;
        }
        Ok(())
    }

    async fn publish_outbound(
        &self,
        session: &Session,
        audio: &[u8],
        transcript: Option<&str>,
        chunk_id: u32,
        total_chunks: u32,
        turn: &Turn,
    ) -> RelayResult<()> {
        let outbound = OutboundAudio {
            sequence: session.next_sequence(),
            chunk_id,
            total_chunks,
            audio,
            transcript,
            processing_time_ms: turn.processing_time_ms(),
            cost_estimate: session.cost_estimate().await,
        };
        let envelope = self
            .inner
            .codec
            .serialize(&session.envelope_template(), &outbound)?;

        let topic = self.device_topic(session.device_id());
        if let Err(e) = self.inner.publisher.publish(&topic, envelope).await {
            self.inner.stats.publish_failure();
            return Err(e);
        }

        session.record_outbound(audio.len());
        self.inner.stats.fragment_out();
        Ok(())
    }

    /// Report a session-ending failure to the device, then tear down
    async fn fail(&self, session: &Arc<Session>, error: RelayError, original: Option<&str>) {
        if matches!(
            error,
            RelayError::UpstreamHandshake(_) | RelayError::UpstreamStream(_)
        ) {
            self.inner.stats.upstream_error();
        }
        session.fail(&error);
        self.report_error(session.device_id(), session.session_id(), &error, original)
            .await;
        self.teardown(session).await;
    }

    /// Remove the session if it is still registered and release its upstream
    async fn teardown(&self, session: &Arc<Session>) {
        self.inner.registry.remove_session(session).await;
        session.close(self.inner.registry.limits().close_grace).await;
        self.inner.stats.session_closed();

        let stats = session.stats();
        info!(
            "Session {}/{} ended: {} fragments in, {} out, {:.1}s",
            stats.device_id,
            stats.session_id,
            stats.fragments_in,
            stats.fragments_out,
            stats.duration_secs
        );
    }
}

/// Message id of the fragment that opened the session, if still queued
fn first_message_id(inbox: &mut mpsc::UnboundedReceiver<Inbound>) -> Option<String> {
    match inbox.try_recv() {
        Ok(Inbound::Audio(fragment)) => Some(fragment.message_id),
        _ => None,
    }
}
