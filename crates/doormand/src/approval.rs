//! Remote approval of unknown faces.
//!
//! An unknown face becomes a pending approval and a photo alert with three
//! buttons. The operator's decision arrives later through the listener and is
//! resolved here into an identity write plus unlock, a one-time unlock, or a
//! denial.

use crate::context::{self, Context};
use crate::notifier::{DecisionAction, DecisionPayload, InboundEvent, MessageRef, Notifier};
use crate::pending::{PendingApproval, PendingId};
use doorman_core::EngineError;
use std::convert::Infallible;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub const ALERT_CAPTION: &str = "Unknown person at the door. What would you like to do?";
pub const FALLBACK_ALERT: &str =
    "⚠️ Unknown person detected at the door but couldn't send photo. Please check security cameras.";

/// Name prefix for identities added by an "allow always" decision.
const GENERATED_NAME_PREFIX: &str = "Person";

/// Outcome of one operator decision, rendered as the operator-facing reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Expired,
    ImageMissing,
    ImageUnreadable,
    NoFace,
    EncodingFailed,
    PersistFailed,
    Added { name: String, unlocked: bool },
    UnlockedOnce,
    UnlockFailed,
    Denied,
    Malformed,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("Error: Face data expired or not found."),
            Self::ImageMissing => f.write_str("ERROR: Face image does not exist."),
            Self::ImageUnreadable => f.write_str("Could not read face image."),
            Self::NoFace => f.write_str("Could not detect face in image."),
            Self::EncodingFailed => f.write_str("Could not extract face features from image."),
            Self::PersistFailed => f.write_str("Failed to add person to database."),
            Self::Added { name, unlocked: true } => {
                write!(f, "Person added to database as {name}. Door unlocked.")
            }
            Self::Added { name, unlocked: false } => {
                write!(f, "Person added to database as {name}. Door unlock failed.")
            }
            Self::UnlockedOnce => f.write_str("Door unlocked for one-time access."),
            Self::UnlockFailed => f.write_str("Failed to unlock door."),
            Self::Denied => f.write_str("Access denied."),
            Self::Malformed => f.write_str("Error: Invalid button data format."),
        }
    }
}

pub struct ApprovalWorkflow {
    ctx: Context,
    notifier: Arc<dyn Notifier>,
    shutdown: watch::Sender<bool>,
}

impl ApprovalWorkflow {
    pub fn new(ctx: Context, notifier: Arc<dyn Notifier>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            notifier,
            shutdown,
        }
    }

    /// Receiver that flips to `true` when the workflow shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Alert the operator about the face saved at `image_path`.
    ///
    /// Returns whether the photo alert was delivered. On failure the pending
    /// entry is dropped and a text-only alert is attempted instead.
    pub async fn send_alert(&self, image_path: &Path) -> bool {
        let image = match tokio::fs::read(image_path).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                tracing::error!(path = %image_path.display(), "face image is empty; alert not sent");
                return false;
            }
            Err(e) => {
                tracing::error!(path = %image_path.display(), error = %e, "face image unreadable; alert not sent");
                return false;
            }
        };

        let id = PendingId::generate();
        // Visible to the callback before the operator can possibly press a button.
        self.ctx.pending.put(id, image_path.to_path_buf());
        let buttons = DecisionPayload::buttons(id);

        let attempts = self.ctx.config.alert_attempts.max(1);
        let base_delay = self.ctx.config.alert_retry_delay();
        for attempt in 1..=attempts {
            match self
                .notifier
                .send_photo(image.clone(), ALERT_CAPTION, &buttons)
                .await
            {
                Ok(message) => {
                    tracing::info!(
                        id = %id,
                        message_id = message.message_id,
                        attempt,
                        "unknown face alert sent"
                    );
                    self.ctx
                        .pending
                        .schedule_expiry(id, self.ctx.config.pending_retention());
                    return true;
                }
                Err(e) if e.is_transient() => {
                    let delay = base_delay * attempt;
                    tracing::warn!(
                        id = %id,
                        attempt,
                        attempts,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "alert delivery failed"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(id = %id, attempt, error = %e, "alert delivery failed permanently");
                    break;
                }
            }
        }

        self.ctx.pending.remove(&id);
        if let Err(e) = self.notifier.send_text(FALLBACK_ALERT).await {
            tracing::error!(error = %e, "fallback text alert failed");
        }
        false
    }

    /// Resolve an operator decision on pending approval `id`.
    ///
    /// The entry is claimed with `remove` before anything else, so a repeated
    /// press or a concurrent expiry sees it as gone.
    pub async fn on_decision(&self, id: PendingId, action: DecisionAction) -> Resolution {
        let Some(approval) = self.ctx.pending.remove(&id) else {
            tracing::info!(id = %id, ?action, "decision for expired or unknown approval");
            return Resolution::Expired;
        };
        tracing::info!(id = %id, ?action, "operator decision received");

        match action {
            DecisionAction::AllowAlways => self.allow_always(approval).await,
            DecisionAction::AllowOnce => {
                if self.unlock().await {
                    Resolution::UnlockedOnce
                } else {
                    Resolution::UnlockFailed
                }
            }
            DecisionAction::Deny => {
                tracing::info!(id = %id, "access denied by operator");
                Resolution::Denied
            }
        }
    }

    async fn allow_always(&self, approval: PendingApproval) -> Resolution {
        let ctx = self.ctx.clone();
        let image_path = approval.image_path;
        let enrolled = self
            .ctx
            .tasks
            .blocking(move || enroll_from_image(&ctx, &image_path))
            .await;

        let name = match enrolled {
            Ok(Ok(name)) => name,
            Ok(Err(resolution)) => return resolution,
            Err(e) => {
                tracing::error!(id = %approval.id, error = %e, "enrollment task failed");
                return Resolution::EncodingFailed;
            }
        };

        let unlocked = self.unlock().await;
        Resolution::Added { name, unlocked }
    }

    async fn unlock(&self) -> bool {
        match self.ctx.relay.unlock(self.ctx.config.unlock_hold()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "door unlock failed");
                false
            }
        }
    }

    /// Tell the operator how `origin` was resolved.
    pub async fn report(&self, origin: &MessageRef, resolution: &Resolution) {
        let text = resolution.to_string();
        if let Err(e) = self.notifier.edit_caption(origin, &text).await {
            tracing::warn!(error = %e, "caption edit failed; sending update as text");
            if let Err(e) = self.notifier.send_text(&format!("Update: {text}")).await {
                tracing::error!(error = %e, "failed to report decision outcome");
            }
        }
    }

    pub async fn handle_event(&self, event: InboundEvent) -> Resolution {
        let (origin, resolution) = match event {
            InboundEvent::Decision { payload, origin } => {
                (origin, self.on_decision(payload.id, payload.action).await)
            }
            InboundEvent::Malformed { raw, origin } => {
                tracing::warn!(data = %raw, "invalid button data");
                (origin, Resolution::Malformed)
            }
        };
        self.report(&origin, &resolution).await;
        resolution
    }

    /// Handle inbound events until shutdown. Each event resolves on its own
    /// task so a long unlock hold never delays other decisions.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<InboundEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let workflow = Arc::clone(&self);
                    self.ctx.tasks.spawn("operator-decision", async move {
                        workflow.handle_event(event).await;
                        Ok::<_, Infallible>(())
                    });
                }
                _ = context::stopped(&mut shutdown) => break,
            }
        }
        tracing::info!("approval dispatcher stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Encode the stored face and persist it under a generated name.
///
/// Persistence completes before the caller unlocks; any failure here means
/// no unlock.
fn enroll_from_image(ctx: &Context, image_path: &Path) -> Result<String, Resolution> {
    if !image_path.is_file() {
        tracing::error!(path = %image_path.display(), "face image does not exist");
        return Err(Resolution::ImageMissing);
    }

    let image = image::open(image_path)
        .map_err(|e| {
            tracing::error!(path = %image_path.display(), error = %e, "face image unreadable");
            Resolution::ImageUnreadable
        })?
        .to_luma8();

    let (_, encoding) = ctx.engine.encode_largest(&image).map_err(|e| {
        tracing::warn!(path = %image_path.display(), error = %e, "cannot enroll stored face");
        match e {
            EngineError::NoFace | EngineError::Detection(_) => Resolution::NoFace,
            _ => Resolution::EncodingFailed,
        }
    })?;

    let name = ctx
        .store
        .add_generated(GENERATED_NAME_PREFIX, encoding)
        .map_err(|e| {
            tracing::error!(error = %e, "failed to add person to database");
            Resolution::PersistFailed
        })?;

    let known = ctx.config.known_faces_dir().join(format!("{name}.jpg"));
    if let Err(e) = std::fs::copy(image_path, &known) {
        tracing::warn!(path = %known.display(), error = %e, "failed to save known face image");
    }

    tracing::info!(name = %name, "person added to database");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::TransportError;
    use crate::testing::{harness, Harness, MockAnalyzer, MockNotifier};
    use doorman_hw::RelayState;
    use std::time::Duration;

    fn workflow(h: &Harness, notifier: &Arc<MockNotifier>) -> Arc<ApprovalWorkflow> {
        Arc::new(ApprovalWorkflow::new(h.ctx.clone(), notifier.clone()))
    }

    fn origin() -> MessageRef {
        MessageRef {
            chat_id: 42,
            message_id: 7,
        }
    }

    #[tokio::test]
    async fn test_send_alert_success_caches_and_sends_buttons() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        let wf = workflow(&h, &notifier);
        let image = h.write_face_image("unknown_1.jpg");

        assert!(wf.send_alert(&image).await);

        assert_eq!(h.ctx.pending.len(), 1);
        let photos = notifier.photos();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].caption, ALERT_CAPTION);
        assert_eq!(photos[0].payloads.len(), 3);
        let payload: DecisionPayload = photos[0].payloads[0].parse().unwrap();
        assert_eq!(payload.action, DecisionAction::AllowAlways);
        assert_eq!(h.ctx.pending.get(&payload.id).unwrap().image_path, image);
    }

    #[tokio::test]
    async fn test_send_alert_missing_image_is_not_cached() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        let wf = workflow(&h, &notifier);

        assert!(!wf.send_alert(&h.dir.path().join("missing.jpg")).await);
        let empty = h.dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        assert!(!wf.send_alert(&empty).await);

        assert!(h.ctx.pending.is_empty());
        assert!(notifier.photos().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_alert_exhausted_retries_fall_back_to_text() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        for _ in 0..3 {
            notifier.push_photo_result(Err(TransportError::Transient("timed out".into())));
        }
        let wf = workflow(&h, &notifier);
        let image = h.write_face_image("unknown_2.jpg");

        let started = tokio::time::Instant::now();
        assert!(!wf.send_alert(&image).await);

        assert_eq!(notifier.photos().len(), 3);
        assert!(h.ctx.pending.is_empty());
        assert_eq!(notifier.texts(), vec![FALLBACK_ALERT.to_string()]);
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 4 + 6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_alert_retries_then_succeeds() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        notifier.push_photo_result(Err(TransportError::Transient("502".into())));
        let wf = workflow(&h, &notifier);
        let image = h.write_face_image("unknown_3.jpg");

        assert!(wf.send_alert(&image).await);
        assert_eq!(notifier.photos().len(), 2);
        assert_eq!(h.ctx.pending.len(), 1);
        assert!(notifier.texts().is_empty());
    }

    #[tokio::test]
    async fn test_send_alert_permanent_failure_aborts_retries() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        notifier.push_photo_result(Err(TransportError::Permanent("chat not found".into())));
        let wf = workflow(&h, &notifier);
        let image = h.write_face_image("unknown_4.jpg");

        assert!(!wf.send_alert(&image).await);
        assert_eq!(notifier.photos().len(), 1);
        assert!(h.ctx.pending.is_empty());
        assert_eq!(notifier.texts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_entry_expires_after_retention() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        let wf = workflow(&h, &notifier);
        let image = h.write_face_image("unknown_5.jpg");
        assert!(wf.send_alert(&image).await);
        let payload: DecisionPayload = notifier.photos()[0].payloads[1].parse().unwrap();

        tokio::time::sleep(Duration::from_secs(3601)).await;

        assert!(h.ctx.pending.is_empty());
        assert_eq!(
            wf.on_decision(payload.id, payload.action).await,
            Resolution::Expired
        );
        assert_eq!(h.actuator.engagements(), 0);
    }

    #[tokio::test]
    async fn test_allow_always_without_face_changes_nothing() {
        let h = harness(MockAnalyzer::no_face());
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.write_face_image("unknown_6.jpg"));

        let resolution = wf.on_decision(id, DecisionAction::AllowAlways).await;

        assert_eq!(resolution, Resolution::NoFace);
        assert!(h.ctx.store.is_empty());
        assert_eq!(h.actuator.engagements(), 0);
        assert!(h.ctx.pending.is_empty());
    }

    #[tokio::test]
    async fn test_allow_always_adds_identity_then_unlocks() {
        let h = harness(MockAnalyzer::face(vec![0.5, 0.5]));
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.write_face_image("unknown_7.jpg"));

        let resolution = wf.on_decision(id, DecisionAction::AllowAlways).await;

        let Resolution::Added { name, unlocked } = resolution else {
            panic!("expected Added, got {resolution:?}");
        };
        assert!(unlocked);
        assert!(name.starts_with("Person_"));
        assert!(h.ctx.store.contains(&name));
        assert!(h.ctx.config.known_faces_dir().join(format!("{name}.jpg")).exists());
        assert_eq!(h.actuator.engagements(), 1);
        assert_eq!(h.ctx.relay.state(), RelayState::Locked);
        assert!(h.ctx.pending.is_empty());

        // Persisted before the unlock, so a reload sees it.
        let reloaded = doorman_core::IdentityStore::load(h.ctx.store.path()).unwrap();
        assert!(reloaded.contains(&name));
    }

    #[tokio::test]
    async fn test_allow_always_persist_failure_blocks_unlock() {
        let h = Harness::with_unwritable_store(MockAnalyzer::face(vec![0.5, 0.5]));
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.write_face_image("unknown_8.jpg"));

        let resolution = wf.on_decision(id, DecisionAction::AllowAlways).await;

        assert_eq!(resolution, Resolution::PersistFailed);
        assert!(h.ctx.store.is_empty());
        assert_eq!(h.actuator.engagements(), 0);
        assert!(h.ctx.pending.is_empty());
    }

    #[tokio::test]
    async fn test_allow_always_image_deleted() {
        let h = harness(MockAnalyzer::face(vec![0.5]));
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.dir.path().join("gone.jpg"));

        assert_eq!(
            wf.on_decision(id, DecisionAction::AllowAlways).await,
            Resolution::ImageMissing
        );
        assert_eq!(h.actuator.engagements(), 0);
    }

    #[tokio::test]
    async fn test_allow_once_unlocks_without_persisting() {
        let h = harness(MockAnalyzer::face(vec![0.5]));
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.write_face_image("unknown_9.jpg"));

        assert_eq!(
            wf.on_decision(id, DecisionAction::AllowOnce).await,
            Resolution::UnlockedOnce
        );
        assert_eq!(h.actuator.engagements(), 1);
        assert!(h.ctx.store.is_empty());
    }

    #[tokio::test]
    async fn test_allow_once_reports_unlock_failure() {
        let h = harness(MockAnalyzer::face(vec![0.5]));
        h.ctx.relay.cleanup();
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.write_face_image("unknown_10.jpg"));

        assert_eq!(
            wf.on_decision(id, DecisionAction::AllowOnce).await,
            Resolution::UnlockFailed
        );
    }

    #[tokio::test]
    async fn test_deny_and_duplicate_press() {
        let h = harness(MockAnalyzer::face(vec![0.5]));
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.write_face_image("unknown_11.jpg"));

        assert_eq!(wf.on_decision(id, DecisionAction::Deny).await, Resolution::Denied);
        assert_eq!(
            wf.on_decision(id, DecisionAction::AllowOnce).await,
            Resolution::Expired
        );
        assert_eq!(h.actuator.engagements(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_decisions_resolve_once() {
        let h = harness(MockAnalyzer::face(vec![0.5]));
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let id = PendingId::generate();
        h.ctx.pending.put(id, h.write_face_image("unknown_12.jpg"));

        let a = tokio::spawn({
            let wf = wf.clone();
            async move { wf.on_decision(id, DecisionAction::AllowOnce).await }
        });
        let b = tokio::spawn({
            let wf = wf.clone();
            async move { wf.on_decision(id, DecisionAction::AllowOnce).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(
            results.iter().filter(|r| **r == Resolution::UnlockedOnce).count(),
            1
        );
        assert!(results.contains(&Resolution::Expired));
        assert_eq!(h.actuator.engagements(), 1);
    }

    #[tokio::test]
    async fn test_report_falls_back_to_text_when_edit_fails() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        notifier.fail_edits();
        let wf = workflow(&h, &notifier);

        wf.report(&origin(), &Resolution::Denied).await;

        assert_eq!(notifier.texts(), vec!["Update: Access denied.".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_event_edits_origin_caption() {
        let h = harness(MockAnalyzer::no_face());
        let notifier = Arc::new(MockNotifier::default());
        let wf = workflow(&h, &notifier);

        let resolution = wf
            .handle_event(InboundEvent::Malformed {
                raw: "garbage".into(),
                origin: origin(),
            })
            .await;
        assert_eq!(resolution, Resolution::Malformed);

        let payload = DecisionPayload::new(DecisionAction::Deny, PendingId::generate());
        wf.handle_event(InboundEvent::Decision {
            payload,
            origin: origin(),
        })
        .await;

        assert_eq!(
            notifier.edits(),
            vec![
                (origin(), "Error: Invalid button data format.".to_string()),
                (origin(), "Error: Face data expired or not found.".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(MockAnalyzer::no_face());
        let wf = workflow(&h, &Arc::new(MockNotifier::default()));
        let (_tx, rx) = mpsc::channel(4);

        let dispatcher = tokio::spawn(wf.clone().run(rx));
        wf.shutdown();
        dispatcher.await.unwrap();
        assert!(*wf.shutdown_signal().borrow());
    }

    #[test]
    fn test_resolution_texts() {
        let added = Resolution::Added {
            name: "Person_1".into(),
            unlocked: false,
        };
        assert_eq!(
            added.to_string(),
            "Person added to database as Person_1. Door unlock failed."
        );
        assert_eq!(Resolution::UnlockFailed.to_string(), "Failed to unlock door.");
    }
}
