//! Test doubles shared by the daemon's unit tests.

use crate::context::{Context, Tasks};
use crate::notifier::{ActionButton, MessageRef, Notifier, TransportError};
use crate::pending::PendingCache;
use async_trait::async_trait;
use doorman_core::{
    AnalyzerError, Config, Encoding, FaceAnalyzer, FaceRegion, IdentityStore, RecognitionEngine,
};
use doorman_hw::{Actuator, ActuatorError, CameraError, Frame, Relay};
use image::GrayImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::capture_loop::FrameSource;

pub const FACE: FaceRegion = FaceRegion {
    top: 2,
    right: 10,
    bottom: 10,
    left: 2,
};

pub struct MockAnalyzer {
    regions: Vec<FaceRegion>,
    encoding: Option<Encoding>,
}

impl MockAnalyzer {
    pub fn no_face() -> Self {
        Self {
            regions: vec![],
            encoding: None,
        }
    }

    pub fn face(values: Vec<f32>) -> Self {
        Self {
            regions: vec![FACE],
            encoding: Some(Encoding::new(values)),
        }
    }

    /// A face is found but encoding it fails.
    pub fn unencodable() -> Self {
        Self {
            regions: vec![FACE],
            encoding: None,
        }
    }
}

impl FaceAnalyzer for MockAnalyzer {
    fn detect(&mut self, _image: &GrayImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
        Ok(self.regions.clone())
    }

    fn encode(&mut self, _image: &GrayImage, _region: &FaceRegion) -> Result<Encoding, AnalyzerError> {
        self.encoding
            .clone()
            .ok_or_else(|| AnalyzerError::InferenceFailed("mock encoder failure".into()))
    }
}

#[derive(Default)]
pub struct MockActuator {
    engaged: AtomicUsize,
}

impl MockActuator {
    pub fn engagements(&self) -> usize {
        self.engaged.load(Ordering::SeqCst)
    }
}

impl Actuator for MockActuator {
    fn engage(&self) -> Result<(), ActuatorError> {
        self.engaged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> Result<(), ActuatorError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ActuatorError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentPhoto {
    pub caption: String,
    pub payloads: Vec<String>,
}

/// Records everything sent; photo sends succeed unless a result was queued.
#[derive(Default)]
pub struct MockNotifier {
    photo_results: Mutex<VecDeque<Result<MessageRef, TransportError>>>,
    photos: Mutex<Vec<SentPhoto>>,
    edits: Mutex<Vec<(MessageRef, String)>>,
    texts: Mutex<Vec<String>>,
    fail_edits: AtomicBool,
    next_message_id: AtomicI64,
}

impl MockNotifier {
    pub fn push_photo_result(&self, result: Result<MessageRef, TransportError>) {
        self.photo_results.lock().unwrap().push_back(result);
    }

    pub fn fail_edits(&self) {
        self.fail_edits.store(true, Ordering::SeqCst);
    }

    pub fn photos(&self) -> Vec<SentPhoto> {
        self.photos.lock().unwrap().clone()
    }

    pub fn edits(&self) -> Vec<(MessageRef, String)> {
        self.edits.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send_photo(
        &self,
        _image: Vec<u8>,
        caption: &str,
        actions: &[ActionButton],
    ) -> Result<MessageRef, TransportError> {
        self.photos.lock().unwrap().push(SentPhoto {
            caption: caption.to_string(),
            payloads: actions.iter().map(|a| a.payload.clone()).collect(),
        });
        let queued = self.photo_results.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            Ok(MessageRef {
                chat_id: 1,
                message_id: self.next_message_id.fetch_add(1, Ordering::SeqCst),
            })
        })
    }

    async fn edit_caption(&self, message: &MessageRef, text: &str) -> Result<(), TransportError> {
        if self.fail_edits.load(Ordering::SeqCst) {
            return Err(TransportError::Permanent("message is not modified".into()));
        }
        self.edits.lock().unwrap().push((*message, text.to_string()));
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Frame source replaying a script; `None` entries are capture failures.
pub struct MockFrames {
    script: VecDeque<Option<(u32, u32)>>,
}

impl MockFrames {
    pub fn new(script: Vec<Option<(u32, u32)>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl FrameSource for MockFrames {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        match self.script.pop_front() {
            Some(Some((width, height))) => Ok(Frame {
                data: vec![128; width as usize * height as usize],
                width,
                height,
                timestamp: std::time::Instant::now(),
                sequence: 0,
            }),
            _ => Err(CameraError::CaptureFailed("mock camera".into())),
        }
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub ctx: Context,
    pub actuator: Arc<MockActuator>,
}

/// Build a context over a temp data dir. Must be called inside a runtime.
pub fn harness(analyzer: MockAnalyzer) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("face_database.json");
    Harness::build(dir, store_path, analyzer)
}

impl Harness {
    /// Store whose parent path is a regular file, so every write fails.
    pub fn with_unwritable_store(analyzer: MockAnalyzer) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        Self::build(dir, blocker.join("face_database.json"), analyzer)
    }

    fn build(dir: TempDir, store_path: PathBuf, analyzer: MockAnalyzer) -> Self {
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            unlock_secs: 0,
            ..Config::default()
        };
        std::fs::create_dir_all(config.known_faces_dir()).unwrap();
        std::fs::create_dir_all(config.unknown_faces_dir()).unwrap();

        let store = Arc::new(IdentityStore::load(store_path).unwrap());
        let engine = Arc::new(RecognitionEngine::new(
            Box::new(analyzer),
            store.clone(),
            config.confidence_threshold,
        ));
        let actuator = Arc::new(MockActuator::default());
        let relay = Arc::new(Relay::new(actuator.clone()).unwrap());

        let ctx = Context {
            config: Arc::new(config),
            store,
            engine,
            relay,
            pending: Arc::new(PendingCache::new()),
            tasks: Tasks::current(),
        };
        Self { dir, ctx, actuator }
    }

    /// Write a small JPEG into the unknown-faces directory.
    pub fn write_face_image(&self, name: &str) -> PathBuf {
        let path = self.ctx.config.unknown_faces_dir().join(name);
        write_jpeg(&path);
        path
    }
}

pub fn write_jpeg(path: &Path) {
    GrayImage::from_pixel(16, 16, image::Luma([128]))
        .save(path)
        .unwrap();
}
