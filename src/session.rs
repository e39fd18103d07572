use crate::arbiter::Utterance;
use crate::types::events::generation::Source;
use crate::types::RequestId;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Conversational phase. Exactly one is current at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Listening => "listening",
            Phase::Thinking => "thinking",
            Phase::Speaking => "speaking",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Payload handed to observers alongside the phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Provisional transcript. Display only.
    Partial(String),
    Utterance(Utterance),
    Text {
        request_id: RequestId,
        delta: String,
    },
    Completed {
        request_id: RequestId,
        text: String,
        sources: Vec<Source>,
        interrupted: bool,
    },
    Cancelled(RequestId),
    Status(String),
    Failure(String),
}

/// Events that may move the session between phases.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Trigger {
    StartListening,
    UtteranceReady,
    FirstAudio,
    ResponseSettled,
    ListeningEnded,
    Failure(String),
    Acknowledge,
    Interrupt { resume_listening: bool },
}

/// Outcome of applying a trigger. A rejected trigger leaves the phase as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub accepted: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.accepted && self.from != self.to
    }
}

pub trait Observer: Send {
    fn on_update(&mut self, phase: Phase, notice: Option<&Notice>) -> anyhow::Result<()>;
}

struct FnObserver<F>(F);

impl<F> Observer for FnObserver<F>
where
    F: FnMut(Phase, Option<&Notice>) -> anyhow::Result<()> + Send,
{
    fn on_update(&mut self, phase: Phase, notice: Option<&Notice>) -> anyhow::Result<()> {
        (self.0)(phase, notice)
    }
}

/// The single owner of phase and request-id state.
pub(crate) struct Session {
    phase: Phase,
    active_request_id: Option<RequestId>,
    last_request_id: u64,
    cancel_requested: bool,
    failure: Option<String>,
    observers: Vec<Box<dyn Observer>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            active_request_id: None,
            last_request_id: 0,
            cancel_requested: false,
            failure: None,
            observers: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn active_request_id(&self) -> Option<RequestId> {
        self.active_request_id
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn subscribe(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn subscribe_fn<F>(&mut self, f: F)
    where
        F: FnMut(Phase, Option<&Notice>) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe(Box::new(FnObserver(f)));
    }

    /// Issues the next request id and makes it the active one.
    pub fn allocate_request(&mut self) -> RequestId {
        self.last_request_id += 1;
        let id = RequestId::new(self.last_request_id);
        self.active_request_id = Some(id);
        self.cancel_requested = false;
        id
    }

    pub fn deactivate(&mut self) -> Option<RequestId> {
        self.active_request_id.take()
    }

    pub fn mark_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    pub fn apply(&mut self, trigger: Trigger) -> Transition {
        let from = self.phase;
        let next = match (&trigger, from) {
            (Trigger::Interrupt { resume_listening }, _) => Some(if *resume_listening {
                Phase::Listening
            } else {
                Phase::Idle
            }),
            (Trigger::Failure(_), Phase::Error) => None,
            (Trigger::Failure(_), _) => Some(Phase::Error),
            (Trigger::Acknowledge, Phase::Error) => Some(Phase::Idle),
            (Trigger::StartListening, Phase::Idle) => Some(Phase::Listening),
            (
                Trigger::UtteranceReady,
                Phase::Idle | Phase::Listening | Phase::Thinking | Phase::Speaking,
            ) => Some(Phase::Thinking),
            (Trigger::FirstAudio, Phase::Thinking) => Some(Phase::Speaking),
            (Trigger::ResponseSettled, Phase::Thinking | Phase::Speaking) => Some(Phase::Idle),
            (Trigger::ListeningEnded, Phase::Listening) => Some(Phase::Idle),
            _ => None,
        };

        let Some(to) = next else {
            tracing::debug!("{:?} ignored in phase {}", trigger, from);
            return Transition {
                from,
                to: from,
                accepted: false,
            };
        };

        self.phase = to;
        let transition = Transition {
            from,
            to,
            accepted: true,
        };

        match trigger {
            Trigger::Failure(reason) => {
                self.failure = Some(reason.clone());
                self.notify(Some(&Notice::Failure(reason)));
            }
            _ => {
                if to != Phase::Error {
                    self.failure = None;
                }
                if transition.changed() {
                    tracing::info!("phase {} -> {}", from, to);
                    self.notify(None);
                }
            }
        }
        transition
    }

    /// Notifies observers without changing phase.
    pub fn announce(&mut self, notice: Notice) {
        self.notify(Some(&notice));
    }

    fn notify(&mut self, notice: Option<&Notice>) {
        let phase = self.phase;
        for (index, observer) in self.observers.iter_mut().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer.on_update(phase, notice))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("observer {} failed: {:#}", index, e),
                Err(_) => tracing::error!("observer {} panicked; continuing", index),
            }
        }
    }
}
