use crate::error::VoiceError;
use crate::runtime::{EventBus, Input};
use crate::types::RequestId;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// One unit of synthesized audio owned by a generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub owner: RequestId,
    pub sequence: u64,
    /// Encoded bytes as received (WAV or raw PCM16).
    pub payload: Vec<u8>,
}

/// Audio output. `play` resolves when the segment has finished playing.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()>;
    /// Silences whatever is playing right now.
    fn stop(&self);
}

#[derive(Debug)]
pub struct PlaybackReport {
    ticket: u64,
    owner: RequestId,
    sequence: u64,
    result: Result<(), String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// The next queued segment started.
    Next,
    /// Nothing is playing and nothing is queued.
    Drained,
    /// The report belonged to a segment that was flushed.
    Ignored,
}

struct Playing {
    ticket: u64,
    task: JoinHandle<()>,
}

/// Plays segments strictly in enqueue order, one at a time.
pub(crate) struct PlaybackQueue {
    sink: Arc<dyn AudioSink>,
    bus: EventBus,
    queue: VecDeque<AudioSegment>,
    playing: Option<Playing>,
    next_ticket: u64,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn AudioSink>, bus: EventBus) -> Self {
        Self {
            sink,
            bus,
            queue: VecDeque::new(),
            playing: None,
            next_ticket: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.playing.is_none() && self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.playing.is_some())
    }

    /// Accepts the segment only if it belongs to the active request.
    pub fn enqueue(&mut self, segment: AudioSegment, active: Option<RequestId>) -> bool {
        if active != Some(segment.owner) {
            tracing::debug!(
                "dropping segment {} of request {}: not active",
                segment.sequence,
                segment.owner
            );
            return false;
        }
        self.queue.push_back(segment);
        if self.playing.is_none() {
            self.start_next();
        }
        true
    }

    fn start_next(&mut self) -> bool {
        let Some(segment) = self.queue.pop_front() else {
            return false;
        };
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let sink = self.sink.clone();
        let bus = self.bus.clone();
        let task = tokio::spawn(async move {
            let result = sink.play(&segment).await.map_err(|e| format!("{:#}", e));
            bus.post(Input::Playback(PlaybackReport {
                ticket,
                owner: segment.owner,
                sequence: segment.sequence,
                result,
            }));
        });
        self.playing = Some(Playing { ticket, task });
        true
    }

    /// Advances past a finished segment. A failed segment never stalls the queue.
    pub fn on_report(&mut self, report: PlaybackReport) -> Progress {
        match &self.playing {
            Some(playing) if playing.ticket == report.ticket => {}
            _ => return Progress::Ignored,
        }
        self.playing = None;

        if let Err(reason) = report.result {
            let error = VoiceError::PlaybackFailure(reason);
            tracing::warn!(
                "segment {} of request {}: {}",
                report.sequence,
                report.owner,
                error
            );
        }

        if self.start_next() {
            Progress::Next
        } else {
            Progress::Drained
        }
    }

    /// Stops the current segment and discards everything queued.
    pub fn flush(&mut self) -> usize {
        let discarded = self.len();
        if let Some(playing) = self.playing.take() {
            playing.task.abort();
        }
        self.queue.clear();
        if discarded > 0 {
            self.sink.stop();
            tracing::debug!("flushed {} segments", discarded);
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct FakeSink {
        played: Mutex<Vec<u64>>,
        stops: Mutex<usize>,
        delay: Duration,
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
            self.played.lock().unwrap().push(segment.sequence);
            tokio::time::sleep(self.delay).await;
            if segment.payload == b"bad" {
                anyhow::bail!("cannot decode segment");
            }
            Ok(())
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
        }
    }

    fn segment(sequence: u64, payload: &[u8]) -> AudioSegment {
        AudioSegment {
            owner: RequestId::new(1),
            sequence,
            payload: payload.to_vec(),
        }
    }

    async fn next_report(rx: &mut UnboundedReceiver<Input>) -> PlaybackReport {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(Input::Playback(report))) => return report,
                Ok(Some(_)) => continue,
                other => panic!("no playback report: {:?}", other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn plays_in_order_even_when_a_segment_fails() {
        let (bus, mut rx) = EventBus::new();
        let sink = Arc::new(FakeSink::default());
        let mut queue = PlaybackQueue::new(sink.clone(), bus);
        let active = Some(RequestId::new(1));

        assert!(queue.enqueue(segment(0, b"s1"), active));
        assert!(queue.enqueue(segment(1, b"bad"), active));
        assert!(queue.enqueue(segment(2, b"s3"), active));

        let mut progress = Vec::new();
        while !queue.is_idle() {
            progress.push(queue.on_report(next_report(&mut rx).await));
        }

        assert_eq!(*sink.played.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(progress, vec![Progress::Next, Progress::Next, Progress::Drained]);
    }

    #[tokio::test]
    async fn segments_of_other_requests_are_rejected() {
        let (bus, _rx) = EventBus::new();
        let sink = Arc::new(FakeSink::default());
        let mut queue = PlaybackQueue::new(sink.clone(), bus);

        assert!(!queue.enqueue(segment(0, b"s1"), Some(RequestId::new(2))));
        assert!(!queue.enqueue(segment(0, b"s1"), None));
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn flush_stops_playback_and_ignores_late_reports() {
        let (bus, mut rx) = EventBus::new();
        let sink = Arc::new(FakeSink {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let mut queue = PlaybackQueue::new(sink.clone(), bus);
        let active = Some(RequestId::new(1));
        queue.enqueue(segment(0, b"s1"), active);
        queue.enqueue(segment(1, b"s2"), active);
        queue.enqueue(segment(2, b"s3"), active);

        assert_eq!(queue.flush(), 3);
        assert!(queue.is_idle());
        assert_eq!(*sink.stops.lock().unwrap(), 1);

        let stale = PlaybackReport {
            ticket: 1,
            owner: RequestId::new(1),
            sequence: 0,
            result: Ok(()),
        };
        assert_eq!(queue.on_report(stale), Progress::Ignored);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(sink.played.lock().unwrap().len() <= 1);
    }
}
