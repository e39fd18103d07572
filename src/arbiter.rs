//! Request fencing and cross-component cancellation.
//!
//! Every inbound generation message passes through [`Arbiter::dispatch`],
//! which compares its request id against the session's active id exactly
//! once. Nothing else decides whether a response is still wanted.

use crate::error::VoiceError;
use crate::generation::{GenerationChannel, GenerationEvent, GenerationInput, GenerationUpdate};
use crate::playback::{AudioSegment, PlaybackQueue, PlaybackReport, Progress};
use crate::session::{Notice, Observer, Phase, Session, Trigger};
use crate::types::RequestId;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Voice,
    Text,
}

/// A finalized unit of user input.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: u64,
    pub origin: Origin,
    pub text: String,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Streaming,
    Complete,
    Cancelled,
}

impl RequestStatus {
    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Streaming => 1,
            RequestStatus::Complete | RequestStatus::Cancelled => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub id: RequestId,
    pub utterance_id: u64,
    pub status: RequestStatus,
    pub accumulated_text: String,
    segments: u64,
}

impl GenerationRequest {
    fn new(id: RequestId, utterance_id: u64) -> Self {
        Self {
            id,
            utterance_id,
            status: RequestStatus::Pending,
            accumulated_text: String::new(),
            segments: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, RequestStatus::Pending | RequestStatus::Streaming)
    }

    /// Moves status forward. Terminal states never change again.
    fn advance(&mut self, next: RequestStatus) -> bool {
        if !self.is_live() || next.rank() < self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admitted(RequestId),
    Stale,
}

pub(crate) struct Arbiter {
    session: Session,
    generation: GenerationChannel,
    playback: PlaybackQueue,
    current: Option<GenerationRequest>,
    next_utterance: u64,
    stale_dropped: u64,
}

impl Arbiter {
    pub fn new(generation: GenerationChannel, playback: PlaybackQueue) -> Self {
        Self {
            session: Session::new(),
            generation,
            playback,
            current: None,
            next_utterance: 0,
            stale_dropped: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn active_request(&self) -> Option<RequestId> {
        self.session.active_request_id()
    }

    #[cfg(test)]
    pub fn current_request(&self) -> Option<&GenerationRequest> {
        self.current.as_ref()
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn subscribe(&mut self, observer: Box<dyn Observer>) {
        self.session.subscribe(observer);
    }

    pub fn subscribe_fn<F>(&mut self, f: F)
    where
        F: FnMut(Phase, Option<&Notice>) -> anyhow::Result<()> + Send + 'static,
    {
        self.session.subscribe_fn(f);
    }

    pub fn announce(&mut self, notice: Notice) {
        self.session.announce(notice);
    }

    pub fn warm_up(&mut self) {
        self.generation.connect();
    }

    /// Enters `Listening`, cancelling any response in flight first.
    pub fn begin_listening(&mut self) -> bool {
        match self.session.phase() {
            Phase::Listening => true,
            Phase::Thinking | Phase::Speaking => {
                tracing::info!("barge-in");
                self.cancel(true);
                true
            }
            _ => self.session.apply(Trigger::StartListening).accepted,
        }
    }

    pub fn end_listening(&mut self) {
        self.session.apply(Trigger::ListeningEnded);
    }

    /// Turns user input into a fenced generation request. Any live request is
    /// superseded first.
    pub fn submit(&mut self, origin: Origin, text: &str) -> Option<RequestId> {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!("ignoring empty {:?} input", origin);
            return None;
        }
        if self.session.phase() == Phase::Error {
            tracing::warn!("input ignored until the error is acknowledged");
            return None;
        }

        self.retire_current();

        self.next_utterance += 1;
        let utterance = Utterance {
            id: self.next_utterance,
            origin,
            text: text.to_string(),
            created_at: SystemTime::now(),
        };
        let id = self.session.allocate_request();
        self.current = Some(GenerationRequest::new(id, utterance.id));
        tracing::info!(request_id = %id, "submitting {:?} utterance", origin);
        self.session.announce(Notice::Utterance(utterance));
        self.session.apply(Trigger::UtteranceReady);

        if let Err(e) = self.generation.send_message(text, id) {
            self.fail(e);
            return None;
        }
        Some(id)
    }

    /// Cancels whatever is in flight and returns to `Idle`, or to
    /// `Listening` when the interrupt starts new input.
    pub fn cancel(&mut self, resume_listening: bool) {
        self.session.mark_cancel_requested();
        self.retire_current();
        self.session.apply(Trigger::Interrupt { resume_listening });
    }

    pub fn fail(&mut self, error: VoiceError) {
        tracing::error!("{}", error);
        self.retire_current();
        self.session.apply(Trigger::Failure(error.to_string()));
    }

    pub fn acknowledge(&mut self) {
        if let Some(reason) = self.session.failure() {
            tracing::info!("error acknowledged: {}", reason);
        }
        self.session.apply(Trigger::Acknowledge);
    }

    pub fn shutdown(&mut self) {
        self.retire_current();
        self.generation.close();
    }

    pub fn on_generation(&mut self, input: GenerationInput) {
        match self.generation.handle(input) {
            Some(GenerationUpdate::Event(event)) => self.dispatch(event),
            Some(GenerationUpdate::Lost(error)) => {
                if self.current.as_ref().is_some_and(|r| r.is_live()) {
                    self.fail(error);
                } else {
                    tracing::warn!("generation link unavailable: {}", error);
                }
            }
            None => {}
        }
    }

    pub fn on_playback(&mut self, report: PlaybackReport) {
        if self.playback.on_report(report) == Progress::Drained {
            self.settle_if_done();
        }
    }

    /// Flushes playback and cancels the current request if it is still live.
    fn retire_current(&mut self) {
        self.playback.flush();
        self.session.deactivate();
        let Some(mut request) = self.current.take() else {
            return;
        };
        if request.advance(RequestStatus::Cancelled) {
            self.generation.stop_generation();
            tracing::info!(request_id = %request.id, "request cancelled");
            self.session.announce(Notice::Cancelled(request.id));
        }
    }

    fn admit(&self, event: &GenerationEvent) -> Admission {
        match (event.request_id(), self.session.active_request_id()) {
            (Some(tag), Some(active)) if tag == active => Admission::Admitted(active),
            // The backend omits requestId on errors.
            (None, Some(active)) if matches!(event, GenerationEvent::Error { .. }) => {
                Admission::Admitted(active)
            }
            _ => Admission::Stale,
        }
    }

    fn dispatch(&mut self, event: GenerationEvent) {
        let id = match self.admit(&event) {
            Admission::Admitted(id) => id,
            Admission::Stale => {
                self.stale_dropped += 1;
                tracing::debug!(
                    "dropping stale {} for request {:?} (active {:?}, cancelled {})",
                    event.kind(),
                    event.request_id(),
                    self.session.active_request_id(),
                    self.session.cancel_requested()
                );
                return;
            }
        };
        let Some(request) = self.current.as_mut().filter(|r| r.id == id) else {
            return;
        };

        if !request.is_live() && !matches!(event, GenerationEvent::Error { .. }) {
            let error = VoiceError::ProtocolInconsistency(format!(
                "{} after response_end for request {}",
                event.kind(),
                id
            ));
            tracing::warn!("{}", error);
            return;
        }

        match event {
            GenerationEvent::Start { message, .. } => {
                if request.status == RequestStatus::Streaming {
                    let error = VoiceError::ProtocolInconsistency(format!(
                        "repeated response_start for request {}",
                        id
                    ));
                    tracing::warn!("{}; restarting accumulation", error);
                    request.accumulated_text.clear();
                }
                request.advance(RequestStatus::Streaming);
                if let Some(message) = message {
                    tracing::debug!(request_id = %id, "{}", message);
                }
            }
            GenerationEvent::Text { delta, .. } => {
                request.advance(RequestStatus::Streaming);
                request.accumulated_text.push_str(&delta);
                self.session.announce(Notice::Text {
                    request_id: id,
                    delta,
                });
            }
            GenerationEvent::Audio { payload, .. } => {
                request.advance(RequestStatus::Streaming);
                let segment = AudioSegment {
                    owner: id,
                    sequence: request.segments,
                    payload,
                };
                request.segments += 1;
                if self.playback.enqueue(segment, Some(id)) && self.session.phase() == Phase::Thinking {
                    self.session.apply(Trigger::FirstAudio);
                }
            }
            GenerationEvent::End {
                full_response,
                sources,
                interrupted,
                ..
            } => {
                if let Some(full) = full_response {
                    request.accumulated_text = full;
                }
                request.advance(RequestStatus::Complete);
                let notice = Notice::Completed {
                    request_id: id,
                    text: request.accumulated_text.clone(),
                    sources,
                    interrupted,
                };
                self.session.announce(notice);
                self.settle_if_done();
            }
            GenerationEvent::Error { message, .. } => {
                self.fail(VoiceError::Backend(message));
            }
        }
    }

    /// Leaves `Thinking`/`Speaking` once the response is complete and the queue is empty.
    fn settle_if_done(&mut self) {
        let complete = self
            .current
            .as_ref()
            .is_some_and(|r| r.status == RequestStatus::Complete);
        if complete && self.playback.is_idle() {
            self.current = None;
            self.session.deactivate();
            self.session.apply(Trigger::ResponseSettled);
        }
    }
}
