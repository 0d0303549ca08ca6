//! Async greeting dispatcher.
//!
//! On every accepted capture the frame loop hands a [`GreetingJob`] to the
//! dispatcher and moves on. A detached tokio task then asks the description
//! service for a greeting (bounded by a timeout), speaks it on the blocking
//! pool and records the spoken text once. Nothing is reported back to the
//! frame loop.

use crate::collaborators::PersistError;
use crate::types::{CaptureEvent, GuestId};
use image::RgbImage;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Who a greeting is addressed to. Resolved once per capture event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Greetee {
    Guest,
    Visitor { name: String },
}

impl Greetee {
    pub fn from_event(event: &CaptureEvent) -> Self {
        match &event.identity {
            Some(m) => Greetee::Visitor {
                name: m.name.clone(),
            },
            None => Greetee::Guest,
        }
    }

    /// First word of the visitor's name.
    pub fn first_name(&self) -> Option<&str> {
        match self {
            Greetee::Guest => None,
            Greetee::Visitor { name } => name.split_whitespace().next(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DescribeError {
    #[error("description service not configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Transport(String),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("image encoding failed: {0}")]
    Encode(String),
}

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("audio pipe: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} exited with {status}")]
    Exited { program: String, status: String },
}

/// Produces a greeting text from a person crop.
pub trait DescriptionService: Send + Sync + 'static {
    fn describe(
        &self,
        person: RgbImage,
        greetee: &Greetee,
    ) -> impl Future<Output = Result<String, DescribeError>> + Send;
}

/// Speaks text aloud. Blocks until playback ends.
pub trait SpeechSynthesizer: Send + Sync + 'static {
    fn speak(&self, text: &str) -> Result<(), SpeechError>;
}

/// Stores the spoken greeting against its capture.
pub trait GreetingSink: Send + Sync + 'static {
    fn record_greeting(&self, guest_id: &GuestId, text: &str) -> Result<(), PersistError>;
}

/// Everything a greeting worker needs from a capture event.
#[derive(Debug, Clone)]
pub struct GreetingJob {
    pub guest_id: GuestId,
    pub greetee: Greetee,
    pub person: RgbImage,
}

impl GreetingJob {
    pub fn from_event(event: &CaptureEvent) -> Self {
        Self {
            guest_id: event.guest_id.clone(),
            greetee: Greetee::from_event(event),
            person: event.person_crop.clone(),
        }
    }
}

/// Phrases spoken when the description service fails or times out.
/// Visitor phrases may contain `{name}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FallbackPhrases {
    pub guest: Vec<String>,
    pub visitor: Vec<String>,
}

impl Default for FallbackPhrases {
    fn default() -> Self {
        Self {
            guest: vec![
                "Hello there, and welcome! You look fantastic today.".into(),
                "Welcome! What a stylish entrance.".into(),
                "Hey there, great to see you. Welcome in!".into(),
            ],
            visitor: vec![
                "Welcome back, {name}! Great to see you again.".into(),
                "Hello {name}, welcome back!".into(),
            ],
        }
    }
}

impl FallbackPhrases {
    pub fn pick(&self, greetee: &Greetee) -> String {
        let mut rng = rand::thread_rng();
        match greetee {
            Greetee::Guest => self
                .guest
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| "Welcome!".to_string()),
            Greetee::Visitor { .. } => {
                let name = greetee.first_name().unwrap_or_default();
                self.visitor
                    .choose(&mut rng)
                    .map(|p| p.replace("{name}", name))
                    .unwrap_or_else(|| format!("Welcome back, {name}!"))
            }
        }
    }
}

/// Fire-and-forget greeting worker factory.
pub struct GreetingDispatcher<D, S, W> {
    runtime: Handle,
    describer: Arc<D>,
    speaker: Arc<S>,
    sink: Arc<W>,
    fallbacks: Arc<FallbackPhrases>,
    timeout: Duration,
}

impl<D, S, W> Clone for GreetingDispatcher<D, S, W> {
    fn clone(&self) -> Self {
        Self {
            runtime: self.runtime.clone(),
            describer: self.describer.clone(),
            speaker: self.speaker.clone(),
            sink: self.sink.clone(),
            fallbacks: self.fallbacks.clone(),
            timeout: self.timeout,
        }
    }
}

impl<D, S, W> GreetingDispatcher<D, S, W>
where
    D: DescriptionService,
    S: SpeechSynthesizer,
    W: GreetingSink,
{
    /// `runtime` lets a plain OS thread (the frame loop) spawn tasks.
    pub fn new(
        runtime: Handle,
        describer: Arc<D>,
        speaker: Arc<S>,
        sink: Arc<W>,
        fallbacks: FallbackPhrases,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            describer,
            speaker,
            sink,
            fallbacks: Arc::new(fallbacks),
            timeout,
        }
    }

    /// Spawn a worker for `job` and return immediately.
    ///
    /// The handle is only useful to tests; the frame loop drops it.
    pub fn dispatch(&self, job: GreetingJob) -> JoinHandle<()> {
        let worker = self.clone();
        self.runtime.spawn(async move { worker.greet(job).await })
    }

    async fn greet(self, job: GreetingJob) {
        let GreetingJob {
            guest_id,
            greetee,
            person,
        } = job;

        let described = tokio::time::timeout(self.timeout, self.describer.describe(person, &greetee)).await;
        let text = match described {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                tracing::warn!(guest = %guest_id, "empty description; using fallback");
                self.fallbacks.pick(&greetee)
            }
            Ok(Err(e)) => {
                tracing::warn!(guest = %guest_id, error = %e, "description failed; using fallback");
                self.fallbacks.pick(&greetee)
            }
            Err(_) => {
                tracing::warn!(
                    guest = %guest_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "description timed out; using fallback"
                );
                self.fallbacks.pick(&greetee)
            }
        };

        tracing::info!(guest = %guest_id, greetee = ?greetee, text = %text, "greeting");

        let speaker = self.speaker.clone();
        let sink = self.sink.clone();
        let result = tokio::task::spawn_blocking(move || {
            if let Err(e) = speaker.speak(&text) {
                tracing::warn!(error = %e, "speech synthesis failed");
            }
            sink.record_greeting(&guest_id, &text)
                .map_err(|e| (guest_id, e))
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err((guest_id, e))) => {
                tracing::warn!(guest = %guest_id, error = %e, "failed to record greeting");
            }
            Err(e) => tracing::error!(error = %e, "greeting worker panicked"),
        }
    }
}
