//! Per-connection protocol state machine
//!
//! A session moves `AwaitingHandshake -> Processing -> Closed`. The first
//! inbound message must be a JSON array of class labels; every later message
//! is an encoded image frame. A bad handshake ends the session, an
//! undecodable frame does not. In single-shot mode the session ends after its
//! first successful detection response.
//!
//! The session talks to its transport through channels (`SessionIo`), so the
//! same state machine runs behind the WebSocket bridge and in tests.

use crate::worker_pool::InferencePool;
use sightline_core::config::{FrameMode, InferenceParams};
use sightline_core::protocol::{DetectionRecord, Response};
use sightline_core::{ClassVocabulary, Error};
use sightline_eye::{DecodeFailure, Detection, Detector, FrameDecoder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

impl Inbound {
    /// Textual view; binary payloads must be valid UTF-8.
    fn into_text(self) -> Option<String> {
        match self {
            Inbound::Text(text) => Some(text),
            Inbound::Binary(bytes) => String::from_utf8(bytes).ok(),
        }
    }

    /// Raw bytes view; text payloads yield their UTF-8 bytes.
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Inbound::Text(text) => text.into_bytes(),
            Inbound::Binary(bytes) => bytes,
        }
    }
}

/// Message for the transport to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(String),
    Close(CloseCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    InternalError,
}

impl CloseCode {
    /// WebSocket close status code.
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::InternalError => 1011,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Processing,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Handshake was not a list of strings
    HandshakeRejected,
    /// A detection response was delivered and the session closed itself
    Completed,
    /// The peer went away; not an error
    PeerClosed,
    /// The detector or a worker failed; the connection is dropped
    CapabilityFailed,
}

/// Session side of a connection.
pub struct SessionIo {
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::Sender<Outbound>,
    disconnected: watch::Receiver<bool>,
}

/// Transport side of a connection.
///
/// The transport forwards peer messages into `inbound`, delivers everything
/// from `outbound`, and sets `disconnect` to `true` once the peer is gone.
/// Dropping `disconnect` also counts as a disconnect.
pub struct PeerLink {
    pub inbound: mpsc::Sender<Inbound>,
    pub outbound: mpsc::Receiver<Outbound>,
    pub disconnect: watch::Sender<bool>,
}

/// Create a connected `SessionIo` / `PeerLink` pair.
pub fn channel(capacity: usize) -> (SessionIo, PeerLink) {
    let capacity = capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (disconnect_tx, disconnect_rx) = watch::channel(false);

    (
        SessionIo {
            inbound: inbound_rx,
            outbound: outbound_tx,
            disconnected: disconnect_rx,
        },
        PeerLink {
            inbound: inbound_tx,
            outbound: outbound_rx,
            disconnect: disconnect_tx,
        },
    )
}

impl SessionIo {
    async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Returns false when the transport is gone.
    async fn send(&self, response: &Response) -> bool {
        match response.encode() {
            Ok(text) => self.outbound.send(Outbound::Message(text)).await.is_ok(),
            Err(e) => {
                error!("Failed to encode response: {}", e);
                false
            }
        }
    }

    async fn close(&self, code: CloseCode) {
        let _ = self.outbound.send(Outbound::Close(code)).await;
    }

    /// Resolves once the peer is gone.
    async fn disconnected(&mut self) {
        let _ = self.disconnected.wait_for(|gone| *gone).await;
    }
}

/// Read-only collaborators shared by every session.
pub struct SessionContext {
    pub detector: Arc<dyn Detector>,
    pub decoder: Arc<dyn FrameDecoder>,
    pub pool: InferencePool,
    pub params: InferenceParams,
    pub frame_mode: FrameMode,
}

impl SessionContext {
    pub fn new(detector: Arc<dyn Detector>, decoder: Arc<dyn FrameDecoder>, pool: InferencePool) -> Self {
        Self {
            detector,
            decoder,
            pool,
            params: InferenceParams::default(),
            frame_mode: FrameMode::SingleShot,
        }
    }

    pub fn with_params(mut self, params: InferenceParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_frame_mode(mut self, frame_mode: FrameMode) -> Self {
        self.frame_mode = frame_mode;
        self
    }
}

enum Step {
    Continue,
    Finish(SessionOutcome),
}

/// Outcome of the blocking decode + inference job for one frame.
enum FrameResult {
    Undecodable(DecodeFailure),
    Detected {
        detections: Vec<Detection>,
        elapsed: Duration,
    },
    Failed(Error),
}

pub struct Session {
    id: String,
    context: Arc<SessionContext>,
    state: SessionState,
    vocabulary: Option<Arc<ClassVocabulary>>,
}

impl Session {
    pub fn new(id: impl Into<String>, context: Arc<SessionContext>) -> Self {
        Self {
            id: id.into(),
            context,
            state: SessionState::AwaitingHandshake,
            vocabulary: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until it closes.
    pub async fn run(mut self, mut io: SessionIo) -> SessionOutcome {
        debug!("Session {} awaiting handshake", self.id);

        let outcome = loop {
            let Some(message) = io.recv().await else {
                debug!("Session {}: peer closed the connection", self.id);
                break SessionOutcome::PeerClosed;
            };

            // every transition to `Closed` also returns `Step::Finish`
            let step = if self.state == SessionState::AwaitingHandshake {
                self.handshake(message, &mut io).await
            } else {
                self.process_frame(message, &mut io).await
            };

            if let Step::Finish(outcome) = step {
                break outcome;
            }
        };

        self.state = SessionState::Closed;
        match outcome {
            SessionOutcome::HandshakeRejected | SessionOutcome::Completed => {
                io.close(CloseCode::Normal).await
            }
            SessionOutcome::CapabilityFailed => io.close(CloseCode::InternalError).await,
            SessionOutcome::PeerClosed => {}
        }

        info!("Session {} closed: {:?}", self.id, outcome);
        outcome
    }

    async fn handshake(&mut self, message: Inbound, io: &mut SessionIo) -> Step {
        let parsed = message
            .into_text()
            .ok_or_else(|| Error::Protocol("handshake is not valid UTF-8".to_string()))
            .and_then(|text| ClassVocabulary::parse_handshake(&text));

        let vocabulary = match parsed {
            Ok(vocabulary) => Arc::new(vocabulary),
            Err(e) => {
                debug!("Session {}: rejecting handshake: {}", self.id, e);
                self.state = SessionState::Closed;
                return if io.send(&Response::handshake_rejected()).await {
                    Step::Finish(SessionOutcome::HandshakeRejected)
                } else {
                    Step::Finish(SessionOutcome::PeerClosed)
                };
            }
        };

        let detector = self.context.detector.clone();
        let job_vocabulary = vocabulary.clone();
        let pool = self.context.pool.clone();
        let configured = tokio::select! {
            result = pool.run(move || detector.configure(&job_vocabulary)) => result,
            _ = io.disconnected() => {
                debug!("Session {}: peer closed during configuration", self.id);
                return Step::Finish(SessionOutcome::PeerClosed);
            }
        };

        match configured {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Session {}: detector rejected vocabulary: {}", self.id, e);
                return Step::Finish(SessionOutcome::CapabilityFailed);
            }
            Err(e) => {
                error!("Session {}: configuration job failed: {}", self.id, e);
                return Step::Finish(SessionOutcome::CapabilityFailed);
            }
        }

        debug!(
            "Session {}: handshake accepted with {} classes",
            self.id,
            vocabulary.len()
        );
        self.vocabulary = Some(vocabulary);
        self.state = SessionState::Processing;
        Step::Continue
    }

    async fn process_frame(&mut self, message: Inbound, io: &mut SessionIo) -> Step {
        let Some(vocabulary) = self.vocabulary.clone() else {
            error!("Session {}: frame received without a vocabulary", self.id);
            return Step::Finish(SessionOutcome::CapabilityFailed);
        };

        let bytes = message.into_bytes();
        let frame_size = bytes.len();
        let context = self.context.clone();
        let job_vocabulary = vocabulary.clone();
        let pool = self.context.pool.clone();

        let result = tokio::select! {
            result = pool.run(move || run_frame(&context, &job_vocabulary, &bytes)) => result,
            _ = io.disconnected() => {
                debug!("Session {}: peer closed during frame processing", self.id);
                return Step::Finish(SessionOutcome::PeerClosed);
            }
        };

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                error!("Session {}: frame job failed: {}", self.id, e);
                return Step::Finish(SessionOutcome::CapabilityFailed);
            }
        };

        match frame {
            FrameResult::Undecodable(reason) => {
                debug!("Session {}: {} byte frame not decoded: {}", self.id, frame_size, reason);
                if io.send(&Response::decode_failed()).await {
                    Step::Continue
                } else {
                    Step::Finish(SessionOutcome::PeerClosed)
                }
            }
            FrameResult::Failed(e) => {
                error!("Session {}: inference failed: {}", self.id, e);
                Step::Finish(SessionOutcome::CapabilityFailed)
            }
            FrameResult::Detected { detections, elapsed } => {
                let records = build_records(&vocabulary, detections, elapsed.as_secs_f64());
                debug!(
                    "Session {}: {} detections in {:.4}s",
                    self.id,
                    records.len(),
                    elapsed.as_secs_f64()
                );

                if !io.send(&Response::Detections(records)).await {
                    return Step::Finish(SessionOutcome::PeerClosed);
                }

                match self.context.frame_mode {
                    FrameMode::SingleShot => {
                        self.state = SessionState::Closed;
                        Step::Finish(SessionOutcome::Completed)
                    }
                    FrameMode::Persistent => Step::Continue,
                }
            }
        }
    }
}

/// Decode and infer one frame. Runs on the blocking pool.
fn run_frame(context: &SessionContext, vocabulary: &ClassVocabulary, bytes: &[u8]) -> FrameResult {
    let image = match context.decoder.decode(bytes) {
        Ok(image) => image,
        Err(reason) => return FrameResult::Undecodable(reason),
    };

    let start = Instant::now();
    match context.detector.infer(vocabulary, &image, &context.params) {
        Ok(detections) => FrameResult::Detected {
            detections,
            elapsed: start.elapsed(),
        },
        Err(e) => FrameResult::Failed(e),
    }
}

/// Resolve detections against the session vocabulary, keeping detector order.
fn build_records(vocabulary: &ClassVocabulary, detections: Vec<Detection>, time: f64) -> Vec<DetectionRecord> {
    detections
        .into_iter()
        .filter_map(|detection| {
            let Some(label) = vocabulary.get(detection.class_index) else {
                warn!(
                    "Dropping detection with class index {} outside a vocabulary of {}",
                    detection.class_index,
                    vocabulary.len()
                );
                return None;
            };
            if !detection.confidence.is_finite() || !detection.bbox.is_finite() {
                warn!("Dropping non-finite detection for class {}", label);
                return None;
            }
            Some(DetectionRecord {
                class_name: label.to_string(),
                confidence: detection.confidence.clamp(0.0, 1.0),
                bbox: detection.bbox,
                time,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use sightline_core::protocol::{HANDSHAKE_SCHEMA_ERROR, IMAGE_DECODING_FAILED};
    use sightline_core::{BoundingBox, Response};
    use sightline_eye::DecodedImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Decodes payloads starting with `IMG`, rejects everything else.
    struct PrefixDecoder;

    impl FrameDecoder for PrefixDecoder {
        fn decode(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeFailure> {
            if bytes.starts_with(b"IMG") {
                Ok(DecodedImage::new(RgbImage::new(100, 80)))
            } else {
                Err(DecodeFailure::UnknownFormat)
            }
        }
    }

    /// Reports one box per vocabulary entry, plus an optional stray index.
    #[derive(Default)]
    struct EchoDetector {
        calls: AtomicUsize,
        stray_index: Option<usize>,
        delay: Option<Duration>,
    }

    impl Detector for EchoDetector {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn configure(&self, _vocabulary: &ClassVocabulary) -> sightline_core::Result<()> {
            Ok(())
        }

        fn infer(
            &self,
            vocabulary: &ClassVocabulary,
            _image: &DecodedImage,
            _params: &InferenceParams,
        ) -> sightline_core::Result<Vec<Detection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let mut detections: Vec<Detection> = (0..vocabulary.len())
                .map(|i| Detection {
                    class_index: i,
                    confidence: 0.9 - i as f32 * 0.1,
                    bbox: BoundingBox::new(10.0 * i as f32, 5.0, 10.0 * i as f32 + 8.0, 20.0),
                })
                .collect();
            if let Some(stray) = self.stray_index {
                detections.push(Detection {
                    class_index: stray,
                    confidence: 0.99,
                    bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
                });
            }
            Ok(detections)
        }
    }

    struct FailingDetector {
        fail_configure: bool,
    }

    impl Detector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn configure(&self, _vocabulary: &ClassVocabulary) -> sightline_core::Result<()> {
            if self.fail_configure {
                Err(Error::Model("text encoder unavailable".to_string()))
            } else {
                Ok(())
            }
        }

        fn infer(
            &self,
            _vocabulary: &ClassVocabulary,
            _image: &DecodedImage,
            _params: &InferenceParams,
        ) -> sightline_core::Result<Vec<Detection>> {
            Err(Error::Inference("device lost".to_string()))
        }
    }

    fn context(detector: Arc<dyn Detector>, frame_mode: FrameMode) -> Arc<SessionContext> {
        Arc::new(
            SessionContext::new(detector, Arc::new(PrefixDecoder), InferencePool::new(2))
                .with_frame_mode(frame_mode),
        )
    }

    async fn drain(outbound: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut messages = Vec::new();
        while let Some(message) = outbound.recv().await {
            messages.push(message);
        }
        messages
    }

    fn text(message: &Outbound) -> &str {
        match message {
            Outbound::Message(text) => text,
            Outbound::Close(code) => panic!("expected a message, got close {:?}", code),
        }
    }

    fn detections(message: &Outbound) -> Vec<DetectionRecord> {
        match Response::decode(text(message)).unwrap() {
            Response::Detections(records) => records,
            Response::Error(e) => panic!("expected detections, got error {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_invalid_handshakes_are_rejected_and_close() {
        let payloads = vec![
            Inbound::Text("not json".to_string()),
            Inbound::Text(r#"{"classes": ["cat"]}"#.to_string()),
            Inbound::Text(r#"["cat", 1]"#.to_string()),
            Inbound::Text("\"cat\"".to_string()),
            Inbound::Binary(vec![0xff, 0xfe, 0x00]),
        ];

        for payload in payloads {
            let detector = Arc::new(EchoDetector::default());
            let (io, link) = channel(8);
            let PeerLink { inbound, mut outbound, disconnect } = link;

            inbound.send(payload.clone()).await.unwrap();
            inbound.send(Inbound::Binary(b"IMG".to_vec())).await.unwrap();

            let outcome = Session::new("t", context(detector.clone(), FrameMode::SingleShot))
                .run(io)
                .await;
            assert_eq!(outcome, SessionOutcome::HandshakeRejected, "payload {:?}", payload);

            let messages = drain(&mut outbound).await;
            assert_eq!(messages.len(), 2);
            assert_eq!(
                text(&messages[0]),
                format!("{{\"error\":\"{}\"}}", HANDSHAKE_SCHEMA_ERROR)
            );
            assert_eq!(messages[1], Outbound::Close(CloseCode::Normal));
            assert_eq!(detector.calls.load(Ordering::SeqCst), 0);
            drop(disconnect);
        }
    }

    #[tokio::test]
    async fn test_binary_handshake_is_read_as_text() {
        let detector = Arc::new(EchoDetector::default());
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Binary(br#"["cat"]"#.to_vec())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG".to_vec())).await.unwrap();

        let outcome = Session::new("t", context(detector, FrameMode::SingleShot)).run(io).await;
        assert_eq!(outcome, SessionOutcome::Completed);
        let messages = drain(&mut outbound).await;
        assert_eq!(detections(&messages[0])[0].class_name, "cat");
        drop(disconnect);
    }

    #[tokio::test]
    async fn test_decode_failure_keeps_session_open() {
        let detector = Arc::new(EchoDetector::default());
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Text(r#"["cat","dog"]"#.to_string())).await.unwrap();
        inbound.send(Inbound::Binary(b"garbage".to_vec())).await.unwrap();
        inbound.send(Inbound::Text("also not an image".to_string())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG-frame".to_vec())).await.unwrap();

        let outcome = Session::new("t", context(detector, FrameMode::SingleShot)).run(io).await;
        assert_eq!(outcome, SessionOutcome::Completed);

        let messages = drain(&mut outbound).await;
        assert_eq!(messages.len(), 4);
        let decode_error = format!("{{\"error\":\"{}\"}}", IMAGE_DECODING_FAILED);
        assert_eq!(text(&messages[0]), decode_error);
        assert_eq!(text(&messages[1]), decode_error);

        let records = detections(&messages[2]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].class_name, "cat");
        assert_eq!(records[1].class_name, "dog");
        assert!(records.iter().all(|r| r.time >= 0.0 && r.time == records[0].time));
        assert_eq!(messages[3], Outbound::Close(CloseCode::Normal));
        drop(disconnect);
    }

    #[tokio::test]
    async fn test_single_shot_ignores_further_frames() {
        let detector = Arc::new(EchoDetector::default());
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Text(r#"["mug"]"#.to_string())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG1".to_vec())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG2".to_vec())).await.unwrap();

        let outcome = Session::new("t", context(detector.clone(), FrameMode::SingleShot))
            .run(io)
            .await;
        assert_eq!(outcome, SessionOutcome::Completed);

        let messages = drain(&mut outbound).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(detections(&messages[0]).len(), 1);
        assert_eq!(messages[1], Outbound::Close(CloseCode::Normal));
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
        drop(disconnect);
    }

    #[tokio::test]
    async fn test_persistent_mode_answers_every_frame() {
        let detector = Arc::new(EchoDetector::default());
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Text(r#"["mug"]"#.to_string())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG1".to_vec())).await.unwrap();
        inbound.send(Inbound::Binary(b"bad".to_vec())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG2".to_vec())).await.unwrap();
        drop(inbound);

        let outcome = Session::new("t", context(detector.clone(), FrameMode::Persistent))
            .run(io)
            .await;
        assert_eq!(outcome, SessionOutcome::PeerClosed);

        let messages = drain(&mut outbound).await;
        assert_eq!(messages.len(), 3);
        assert_eq!(detections(&messages[0]).len(), 1);
        assert!(Response::decode(text(&messages[1])).unwrap().is_error());
        assert_eq!(detections(&messages[2]).len(), 1);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 2);
        drop(disconnect);
    }

    #[tokio::test]
    async fn test_records_stay_inside_vocabulary() {
        let detector = Arc::new(EchoDetector {
            stray_index: Some(7),
            ..Default::default()
        });
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Text(r#"["cat","dog","cat"]"#.to_string())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG".to_vec())).await.unwrap();

        Session::new("t", context(detector, FrameMode::SingleShot)).run(io).await;

        let records = detections(&drain(&mut outbound).await[0]);
        let classes: Vec<&str> = records.iter().map(|r| r.class_name.as_str()).collect();
        assert_eq!(classes, vec!["cat", "dog"]);
        for record in &records {
            assert!((0.0..=1.0).contains(&record.confidence));
            assert!(record.bbox.x1 < record.bbox.x2 && record.bbox.y1 < record.bbox.y2);
        }
        drop(disconnect);
    }

    #[tokio::test]
    async fn test_inference_failure_closes_without_response() {
        let detector = Arc::new(FailingDetector { fail_configure: false });
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Text(r#"["cat"]"#.to_string())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG".to_vec())).await.unwrap();

        let outcome = Session::new("t", context(detector, FrameMode::SingleShot)).run(io).await;
        assert_eq!(outcome, SessionOutcome::CapabilityFailed);
        assert_eq!(
            drain(&mut outbound).await,
            vec![Outbound::Close(CloseCode::InternalError)]
        );
        drop(disconnect);
    }

    #[tokio::test]
    async fn test_configure_failure_closes_without_response() {
        let detector = Arc::new(FailingDetector { fail_configure: true });
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Text(r#"["cat"]"#.to_string())).await.unwrap();

        let outcome = Session::new("t", context(detector, FrameMode::SingleShot)).run(io).await;
        assert_eq!(outcome, SessionOutcome::CapabilityFailed);
        assert_eq!(
            drain(&mut outbound).await,
            vec![Outbound::Close(CloseCode::InternalError)]
        );
        drop(disconnect);
    }

    #[tokio::test]
    async fn test_peer_close_before_handshake_is_silent() {
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;
        drop(inbound);

        let outcome = Session::new("t", context(Arc::new(EchoDetector::default()), FrameMode::SingleShot))
            .run(io)
            .await;
        assert_eq!(outcome, SessionOutcome::PeerClosed);
        assert!(drain(&mut outbound).await.is_empty());
        drop(disconnect);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_close_during_inference_unwinds() {
        let detector = Arc::new(EchoDetector {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let (io, link) = channel(8);
        let PeerLink { inbound, mut outbound, disconnect } = link;

        inbound.send(Inbound::Text(r#"["cat"]"#.to_string())).await.unwrap();
        inbound.send(Inbound::Binary(b"IMG".to_vec())).await.unwrap();

        let session = tokio::spawn(
            Session::new("t", context(detector.clone(), FrameMode::SingleShot)).run(io),
        );

        // wait until the frame is inside the detector, then hang up
        while detector.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        disconnect.send(true).unwrap();

        let started = Instant::now();
        let outcome = session.await.unwrap();
        assert_eq!(outcome, SessionOutcome::PeerClosed);
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(drain(&mut outbound).await.is_empty());
        drop(inbound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_keep_their_vocabularies() {
        let detector: Arc<dyn Detector> = Arc::new(EchoDetector {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let shared = context(detector, FrameMode::SingleShot);

        let mut handles = Vec::new();
        for vocab in [r#"["cat","dog"]"#, r#"["car","bus","truck"]"#, r#"["keys"]"#] {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                let (io, link) = channel(8);
                let PeerLink { inbound, mut outbound, disconnect } = link;
                inbound.send(Inbound::Text(vocab.to_string())).await.unwrap();
                inbound.send(Inbound::Binary(b"IMG".to_vec())).await.unwrap();
                Session::new("t", shared).run(io).await;
                let messages = drain(&mut outbound).await;
                drop(disconnect);
                let expected: Vec<String> = serde_json::from_str(vocab).unwrap();
                let got: Vec<String> = detections(&messages[0])
                    .into_iter()
                    .map(|r| r.class_name)
                    .collect();
                assert_eq!(got, expected);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_session_starts_awaiting_handshake() {
        let session = Session::new(
            "abc",
            context(Arc::new(EchoDetector::default()), FrameMode::SingleShot),
        );
        assert_eq!(session.id(), "abc");
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::InternalError.as_u16(), 1011);
    }
}
