#![allow(dead_code)]

use async_trait::async_trait;
use duplex_voice::{
    AudioSegment, AudioSink, CaptureError, ClientConfig, Conductor, Config, Connector,
    DeviceFormat, DeviceStream, Frame, Handle, Microphone, Notice, Phase, RawLink,
    RecognitionConfig, SampleSink,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const RECOGNITION_URL: &str = "memory://recognition";
pub const GENERATION_URL: &str = "memory://generation";
pub const WAIT: Duration = Duration::from_secs(2);

/// The backend side of one in-memory link.
pub struct ServerEnd {
    pub url: String,
    pub from_client: mpsc::Receiver<String>,
    pub to_client: mpsc::Sender<Frame>,
}

impl ServerEnd {
    pub async fn expect(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .unwrap_or_else(|_| panic!("nothing sent on {}", self.url))
            .unwrap_or_else(|| panic!("{} closed by the client", self.url));
        serde_json::from_str(&text).unwrap()
    }

    pub async fn expect_type(&mut self, kind: &str) -> Value {
        let message = self.expect().await;
        assert_eq!(message["type"], kind, "unexpected message {message}");
        message
    }

    /// True when the client sends nothing for `period`.
    pub async fn quiet(&mut self, period: Duration) -> bool {
        tokio::time::timeout(period, self.from_client.recv())
            .await
            .is_err()
    }

    pub async fn send(&self, message: Value) {
        self.to_client
            .send(Frame::Text(message.to_string()))
            .await
            .unwrap();
    }
}

/// Hands out in-memory links and exposes their backend ends to the test.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    refusing: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted,
            refusing: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
        };
        (Arc::new(connector), rx)
    }

    pub fn refuse(&self, url: &str) {
        self.refusing.lock().unwrap().insert(url.to_string());
    }

    pub fn attempts(&self, url: &str) -> usize {
        self.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &Config) -> anyhow::Result<RawLink> {
        let url = config.url().to_string();
        *self.attempts.lock().unwrap().entry(url.clone()).or_default() += 1;
        if self.refusing.lock().unwrap().contains(&url) {
            anyhow::bail!("connection refused by {}", url);
        }

        let (outbound, from_client) = mpsc::channel(config.capacity());
        let (to_client, inbound) = mpsc::channel(config.capacity());
        self.accepted
            .send(ServerEnd {
                url,
                from_client,
                to_client,
            })
            .map_err(|_| anyhow::anyhow!("test harness is gone"))?;
        Ok(RawLink { outbound, inbound })
    }
}

type SinkSlot = Arc<Mutex<Option<SampleSink>>>;

/// A 16 kHz mono microphone the test speaks into.
pub struct FakeMicrophone {
    slot: SinkSlot,
}

#[derive(Clone)]
pub struct Voice {
    slot: SinkSlot,
}

impl Voice {
    /// Feeds samples through the device callback. Returns false when nothing is capturing.
    pub fn speak(&self, samples: &[f32]) -> bool {
        match self.slot.lock().unwrap().as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }
}

pub fn microphone() -> (FakeMicrophone, Voice) {
    let slot: SinkSlot = Arc::new(Mutex::new(None));
    (FakeMicrophone { slot: slot.clone() }, Voice { slot })
}

struct FakeStream {
    slot: SinkSlot,
}

impl DeviceStream for FakeStream {
    fn pause(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }
}

impl Microphone for FakeMicrophone {
    fn format(&self) -> Result<DeviceFormat, CaptureError> {
        Ok(DeviceFormat {
            sample_rate: 16_000,
            channels: 1,
        })
    }

    fn start(&mut self, sink: SampleSink) -> Result<Box<dyn DeviceStream>, CaptureError> {
        *self.slot.lock().unwrap() = Some(sink);
        Ok(Box::new(FakeStream {
            slot: self.slot.clone(),
        }))
    }
}

/// Records what it was asked to play and takes `duration` per segment.
pub struct RecordingSink {
    duration: Duration,
    played: Mutex<Vec<AudioSegment>>,
    stops: AtomicUsize,
}

impl RecordingSink {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn played(&self) -> Vec<(u64, u64)> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .map(|s| (s.owner.value(), s.sequence))
            .collect()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, segment: &AudioSegment) -> anyhow::Result<()> {
        self.played.lock().unwrap().push(segment.clone());
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub type Update = (Phase, Option<Notice>);

pub struct Harness {
    pub handle: Handle,
    pub connector: Arc<MemoryConnector>,
    pub voice: Voice,
    pub sink: Arc<RecordingSink>,
    pub updates: mpsc::UnboundedReceiver<Update>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    stash: Vec<ServerEnd>,
    task: JoinHandle<()>,
}

/// Honours `RUST_LOG` when debugging a failing test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    pub fn start(segment_duration: Duration) -> Self {
        init_logging();
        let (connector, servers) = MemoryConnector::new();
        let (mic, voice) = microphone();
        let sink = Arc::new(RecordingSink::new(segment_duration));

        let poll = |url: &str| {
            Config::builder()
                .with_url(url)
                .with_open_poll(Duration::from_millis(10), 20)
                .build()
        };
        let config = ClientConfig::default()
            .with_recognition(poll(RECOGNITION_URL))
            .with_generation(poll(GENERATION_URL))
            .with_recognition_policy(
                RecognitionConfig::default()
                    .with_reconnect_delay(Duration::from_millis(10))
                    .with_final_timeout(Duration::from_millis(500)),
            );

        let (mut conductor, handle) =
            Conductor::new(config, connector.clone(), Box::new(mic), sink.clone());
        let (tx, updates) = mpsc::unbounded_channel();
        conductor.subscribe_fn(move |phase, notice| {
            let _ = tx.send((phase, notice.cloned()));
            Ok(())
        });
        let task = tokio::spawn(conductor.run());

        Self {
            handle,
            connector,
            voice,
            sink,
            updates,
            servers,
            stash: Vec::new(),
            task,
        }
    }

    /// Waits for the next link opened to `url`.
    pub async fn accept(&mut self, url: &str) -> ServerEnd {
        if let Some(index) = self.stash.iter().position(|s| s.url == url) {
            return self.stash.remove(index);
        }
        loop {
            let server = tokio::time::timeout(WAIT, self.servers.recv())
                .await
                .unwrap_or_else(|_| panic!("no connection to {url}"))
                .unwrap();
            if server.url == url {
                return server;
            }
            self.stash.push(server);
        }
    }

    /// Collects updates up to and including the transition into `phase`.
    pub async fn wait_for_phase(&mut self, phase: Phase) -> Vec<Update> {
        self.collect_until(|(p, notice)| {
            *p == phase && matches!(notice, None | Some(Notice::Failure(_)))
        })
        .await
    }

    /// Collects updates up to and including the first notice matching `pred`.
    pub async fn wait_for_notice<F>(&mut self, pred: F) -> Vec<Update>
    where
        F: Fn(&Notice) -> bool,
    {
        self.collect_until(|(_, notice)| notice.as_ref().is_some_and(&pred))
            .await
    }

    async fn collect_until<F>(&mut self, done: F) -> Vec<Update>
    where
        F: Fn(&Update) -> bool,
    {
        let mut seen = Vec::new();
        loop {
            let update = tokio::time::timeout(WAIT, self.updates.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out; saw {seen:?}"))
                .unwrap();
            let finished = done(&update);
            seen.push(update);
            if finished {
                return seen;
            }
        }
    }

    /// Everything observed so far without waiting.
    pub fn drain(&mut self) -> Vec<Update> {
        std::iter::from_fn(|| self.updates.try_recv().ok()).collect()
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().unwrap();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("event loop did not stop")
            .unwrap();
    }
}

pub fn texts(updates: &[Update]) -> Vec<String> {
    updates
        .iter()
        .filter_map(|(_, notice)| match notice {
            Some(Notice::Text { delta, .. }) => Some(delta.clone()),
            _ => None,
        })
        .collect()
}

pub fn partials(updates: &[Update]) -> Vec<String> {
    updates
        .iter()
        .filter_map(|(_, notice)| match notice {
            Some(Notice::Partial(text)) => Some(text.clone()),
            _ => None,
        })
        .collect()
}
